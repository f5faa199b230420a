/*!
 * Bridge facade.
 *
 * Owns one router session together with the handler registry, the
 * dispatcher and the discovery coordinator, and exposes the operations a
 * host application needs.
 */
use std::sync::Arc;

use chrono::{DateTime, Utc};
use helvar_core::config::HelvarConfig;
use tracing::info;

use crate::address::Address;
use crate::command::Command;
use crate::discovery::{DiscoveryCoordinator, DiscoverySink};
use crate::dispatcher::{Dispatcher, HandlerRegistry};
use crate::error::Result;
use crate::handler::{DeviceHandler, GroupHandler};
use crate::session::{
    CommandSender, Connector, SendQueue, SessionManager, SessionState, StatusSink, TcpConnector,
};

/// Connection to one HelvarNet router
#[derive(Debug)]
pub struct HelvarBridge {
    router: Address,
    session: SessionManager,
    dispatcher: Arc<Dispatcher>,
    discovery: Arc<DiscoveryCoordinator>,
}

impl HelvarBridge {
    /// Create a bridge that talks to the router over TCP
    pub fn new(
        config: &HelvarConfig,
        status: Arc<dyn StatusSink>,
        discovery_sink: Arc<dyn DiscoverySink>,
    ) -> Self {
        Self::with_connector(config, Arc::new(TcpConnector), status, discovery_sink)
    }

    /// Create a bridge over a custom transport
    pub fn with_connector(
        config: &HelvarConfig,
        connector: Arc<dyn Connector>,
        status: Arc<dyn StatusSink>,
        discovery_sink: Arc<dyn DiscoverySink>,
    ) -> Self {
        let router = Address::router(config.router.cluster_id, config.router.router_id);
        let queue = Arc::new(SendQueue::new());
        let sender = CommandSender::new(queue.clone(), config.router.protocol_version.as_str());

        let discovery = Arc::new(DiscoveryCoordinator::new(
            router,
            sender,
            discovery_sink,
            config.discovery.timeout(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(HandlerRegistry::new()),
            Some(discovery.clone()),
        ));
        let session = SessionManager::new(config, queue, connector, dispatcher.clone(), status);

        info!("Created bridge for router {}", router);
        Self {
            router,
            session,
            dispatcher,
            discovery,
        }
    }

    /// Open the session
    pub async fn connect(&self) -> Result<()> {
        self.session.connect().await
    }

    /// Stop discovery and close the session
    pub async fn disconnect(&self) {
        self.discovery.stop();
        self.session.disconnect().await;
    }

    /// Queue a command for the router
    pub fn send_command(&self, command: Command) {
        self.session.send_command(command);
    }

    /// Handle for queueing commands, for handlers created by the host
    pub fn sender(&self) -> CommandSender {
        self.session.sender()
    }

    /// Start a discovery scan
    pub fn start_discovery(&self) {
        self.discovery.start();
    }

    /// Abort the running discovery scan
    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }

    /// True while a discovery scan is running
    pub fn is_discovering(&self) -> bool {
        self.discovery.is_active()
    }

    /// Route messages for a device to `handler`
    pub fn register_device_handler(&self, handler: Arc<dyn DeviceHandler>) -> Result<()> {
        self.registry().register_device(handler)
    }

    /// Stop routing messages for `address`
    pub fn unregister_device_handler(&self, address: &Address) -> Result<()> {
        self.registry().unregister_device(address)
    }

    /// Route messages for a group to `handler`
    pub fn register_group_handler(&self, handler: Arc<dyn GroupHandler>) -> Result<()> {
        self.registry().register_group(handler)
    }

    /// Stop routing messages for `group_id`
    pub fn unregister_group_handler(&self, group_id: u16) -> Result<()> {
        self.registry().unregister_group(group_id)
    }

    /// The handler registry
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.dispatcher.registry()
    }

    /// Address of the router this bridge talks to
    pub fn router_address(&self) -> Address {
        self.router
    }

    /// Session state
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Router clock from the last keepalive reply
    pub fn last_router_time(&self) -> Option<DateTime<Utc>> {
        self.dispatcher.last_router_time()
    }
}
