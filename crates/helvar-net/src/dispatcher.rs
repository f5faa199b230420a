/*!
 * Routing of decoded router messages.
 *
 * The [`HandlerRegistry`] maps device addresses and group ids to their
 * handlers; the [`Dispatcher`] receives every decoded line from the session
 * and hands it to the matching handler or to discovery.
 */
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::address::Address;
use crate::command::{Command, CommandType, MessageType};
use crate::discovery::DiscoveryCoordinator;
use crate::error::{HelvarError, Result};
use crate::handler::{DeviceHandler, GroupHandler};
use crate::scene::SceneRef;
use crate::session::MessageHandler;

/// Registry change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device handler was registered
    DeviceHandlerAdded(Address),
    /// A device handler was removed
    DeviceHandlerRemoved(Address),
    /// A group handler was registered
    GroupHandlerAdded(u16),
    /// A group handler was removed
    GroupHandlerRemoved(u16),
}

/// Handlers keyed by device address and group id
pub struct HandlerRegistry {
    devices: RwLock<HashMap<Address, Arc<dyn DeviceHandler>>>,
    groups: RwLock<HashMap<u16, Arc<dyn GroupHandler>>>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("devices", &self.device_addresses().unwrap_or_default())
            .field("groups", &self.group_ids().unwrap_or_default())
            .finish()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            devices: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            event_sender,
        }
    }

    /// Register a device handler under its address
    pub fn register_device(&self, handler: Arc<dyn DeviceHandler>) -> Result<()> {
        let address = handler.address();
        let mut devices = self.devices.write().map_err(|_| {
            HelvarError::registry("Failed to acquire write lock on device handlers")
        })?;

        if devices.contains_key(&address) {
            return Err(HelvarError::registry(format!(
                "Device handler for {} already registered",
                address
            )));
        }

        devices.insert(address, handler);
        let _ = self.event_sender.send(RegistryEvent::DeviceHandlerAdded(address));
        debug!("Registered device handler for {}", address);
        Ok(())
    }

    /// Remove the device handler for `address`
    pub fn unregister_device(&self, address: &Address) -> Result<()> {
        let mut devices = self.devices.write().map_err(|_| {
            HelvarError::registry("Failed to acquire write lock on device handlers")
        })?;

        if devices.remove(address).is_none() {
            return Err(HelvarError::registry(format!(
                "Device handler for {} not registered",
                address
            )));
        }

        let _ = self.event_sender.send(RegistryEvent::DeviceHandlerRemoved(*address));
        debug!("Unregistered device handler for {}", address);
        Ok(())
    }

    /// Register a group handler under its group id
    pub fn register_group(&self, handler: Arc<dyn GroupHandler>) -> Result<()> {
        let group_id = handler.group_id();
        let mut groups = self.groups.write().map_err(|_| {
            HelvarError::registry("Failed to acquire write lock on group handlers")
        })?;

        if groups.contains_key(&group_id) {
            return Err(HelvarError::registry(format!(
                "Group handler for group {} already registered",
                group_id
            )));
        }

        groups.insert(group_id, handler);
        let _ = self.event_sender.send(RegistryEvent::GroupHandlerAdded(group_id));
        debug!("Registered group handler for group {}", group_id);
        Ok(())
    }

    /// Remove the group handler for `group_id`
    pub fn unregister_group(&self, group_id: u16) -> Result<()> {
        let mut groups = self.groups.write().map_err(|_| {
            HelvarError::registry("Failed to acquire write lock on group handlers")
        })?;

        if groups.remove(&group_id).is_none() {
            return Err(HelvarError::registry(format!(
                "Group handler for group {} not registered",
                group_id
            )));
        }

        let _ = self.event_sender.send(RegistryEvent::GroupHandlerRemoved(group_id));
        debug!("Unregistered group handler for group {}", group_id);
        Ok(())
    }

    /// Device handler registered for `address`
    pub fn device(&self, address: &Address) -> Option<Arc<dyn DeviceHandler>> {
        self.devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    /// Group handler registered for `group_id`
    pub fn group(&self, group_id: u16) -> Option<Arc<dyn GroupHandler>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group_id)
            .cloned()
    }

    /// Addresses with a registered device handler
    pub fn device_addresses(&self) -> Result<Vec<Address>> {
        let devices = self.devices.read().map_err(|_| {
            HelvarError::registry("Failed to acquire read lock on device handlers")
        })?;
        Ok(devices.keys().copied().collect())
    }

    /// Group ids with a registered group handler
    pub fn group_ids(&self) -> Result<Vec<u16>> {
        let groups = self.groups.read().map_err(|_| {
            HelvarError::registry("Failed to acquire read lock on group handlers")
        })?;
        Ok(groups.keys().copied().collect())
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }
}

/// Routes every inbound message to its handler
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    discovery: Option<Arc<DiscoveryCoordinator>>,
    router_time: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over `registry`, feeding discovery replies to `discovery`
    pub fn new(registry: Arc<HandlerRegistry>, discovery: Option<Arc<DiscoveryCoordinator>>) -> Self {
        Self {
            registry,
            discovery,
            router_time: RwLock::new(None),
        }
    }

    /// The registry messages are routed through
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Router clock from the most recent `QUERY_ROUTER_TIME` reply
    pub fn last_router_time(&self) -> Option<DateTime<Utc>> {
        *self.router_time.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_device(&self, command: &Command) {
        let Some(address) = command.address() else {
            debug!("{} carries no address, dropping", command);
            return;
        };
        match self.registry.device(address) {
            Some(handler) => handler.handle_router_message(command),
            None => debug!("No device handler for {}, dropping {}", address, command),
        }
    }

    fn to_group(&self, command: &Command) -> Option<Arc<dyn GroupHandler>> {
        let group_id = match command.group_id() {
            Ok(group_id) => group_id,
            Err(e) => {
                warn!("Cannot route {}: {}", command, e);
                return None;
            }
        };
        match self.registry.group(group_id) {
            Some(handler) => {
                handler.handle_router_message(command);
                Some(handler)
            }
            None => {
                debug!("No group handler for group {}, dropping {}", group_id, command);
                None
            }
        }
    }

    fn recall_scene(&self, command: &Command) {
        let Some(group) = self.to_group(command) else {
            return;
        };
        let block = command.block_id().ok().or_else(|| group.recall_block());
        let (Some(block), Ok(scene)) = (block, command.scene_id()) else {
            trace!("Recall without block and scene, members left untouched");
            return;
        };
        let scene = match SceneRef::new(block, scene) {
            Ok(scene) => scene,
            Err(e) => {
                warn!("Not applying recall to members: {}", e);
                return;
            }
        };

        for member in group.members() {
            if let Some(device) = self.registry.device(&member) {
                device.apply_scene(scene);
            }
        }
    }

    fn to_discovery(&self, command: &Command) {
        match &self.discovery {
            Some(discovery) => discovery.handle_reply(command),
            None => debug!("Discovery not configured, dropping {}", command),
        }
    }

    fn router_time(&self, command: &Command) {
        let parsed = command
            .result()
            .and_then(|result| result.trim().parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        match parsed {
            Some(time) => {
                trace!("Router time is {}", time);
                *self.router_time.write().unwrap_or_else(PoisonError::into_inner) = Some(time);
            }
            None => debug!("Unreadable router time in {}", command),
        }
    }
}

impl MessageHandler for Dispatcher {
    fn handle_message(&self, command: Command) {
        match command.message_type() {
            MessageType::Error => {
                warn!("Router reported an error: {}", command);
                return;
            }
            MessageType::InternalCommand => {
                debug!("Ignoring internal command {}", command);
                return;
            }
            MessageType::Command | MessageType::Reply => {}
        }

        match (command.message_type(), command.command_type()) {
            (MessageType::Command, CommandType::RecallScene) => self.recall_scene(&command),
            (MessageType::Command, CommandType::DirectLevelDevice) => self.to_device(&command),

            (MessageType::Reply, CommandType::QueryDeviceLoadLevel)
            | (MessageType::Reply, CommandType::QueryDeviceState)
            | (MessageType::Reply, CommandType::QuerySceneInfo) => self.to_device(&command),

            (MessageType::Reply, CommandType::QueryLastSceneInBlock)
            | (MessageType::Reply, CommandType::QueryLastSceneInGroup)
            | (MessageType::Reply, CommandType::QueryGroup) => {
                self.to_group(&command);
            }

            (MessageType::Reply, CommandType::QueryDeviceTypesAndAddresses)
            | (MessageType::Reply, CommandType::QueryDescriptionDevice)
            | (MessageType::Reply, CommandType::QueryGroups)
            | (MessageType::Reply, CommandType::QueryGroupDescription)
            | (MessageType::Reply, CommandType::QuerySceneNames) => self.to_discovery(&command),

            (MessageType::Reply, CommandType::QueryRouterTime) => self.router_time(&command),

            (message_type, command_type) => {
                debug!("No route for {:?} {}, dropping", message_type, command_type)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use crate::discovery::DiscoveryEvent;
    use crate::handler::{Dimmer, SceneGroup};
    use crate::scene::SceneLevel;
    use crate::session::{CommandSender, SendQueue};

    #[derive(Default)]
    struct StubDevice {
        address: Option<Address>,
        seen: Mutex<Vec<String>>,
        scenes: Mutex<Vec<SceneRef>>,
    }

    impl DeviceHandler for StubDevice {
        fn address(&self) -> Address {
            self.address.unwrap_or_else(|| Address::device_of(1, 1, 1, 1))
        }

        fn handle_router_message(&self, command: &Command) {
            self.seen.lock().unwrap().push(command.to_string());
        }

        fn apply_scene(&self, scene: SceneRef) {
            self.scenes.lock().unwrap().push(scene);
        }
    }

    fn sender() -> (CommandSender, Arc<SendQueue>) {
        let queue = Arc::new(SendQueue::new());
        (CommandSender::new(queue.clone(), "2"), queue)
    }

    fn line(text: &str) -> Command {
        text.parse().unwrap()
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknowns() {
        let registry = HandlerRegistry::new();
        let mut events = registry.subscribe();
        let device = Arc::new(StubDevice::default());

        registry.register_device(device.clone()).unwrap();
        assert!(matches!(
            registry.register_device(device.clone()),
            Err(HelvarError::Registry(_))
        ));
        assert_eq!(registry.device_addresses().unwrap(), vec![device.address()]);

        registry.unregister_device(&device.address()).unwrap();
        assert!(registry.unregister_device(&device.address()).is_err());
        assert!(registry.unregister_group(9).is_err());

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceHandlerAdded(device.address())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceHandlerRemoved(device.address())
        );
    }

    #[test]
    fn test_device_messages_route_by_exact_address() {
        let registry = Arc::new(HandlerRegistry::new());
        let device = Arc::new(StubDevice {
            address: Some(Address::device_of(1, 1, 2, 7)),
            ..Default::default()
        });
        registry.register_device(device.clone()).unwrap();
        let dispatcher = Dispatcher::new(registry, None);

        dispatcher.handle_message(line("?V:2,C:152,@1.1.2.7=55#"));
        dispatcher.handle_message(line(">V:2,C:14,L:20,F:50,@1.1.2.7#"));
        // different device, subnet-level address, error message
        dispatcher.handle_message(line("?V:2,C:152,@1.1.2.8=10#"));
        dispatcher.handle_message(line("?V:2,C:110,@1.1.2=0#"));
        dispatcher.handle_message(line("!V:2,C:152,@1.1.2.7=1#"));

        let seen = device.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("152"));
        assert!(seen[1].contains("L:20"));
    }

    #[test]
    fn test_recall_updates_group_and_member_levels() {
        let (sender, _queue) = sender();
        let registry = Arc::new(HandlerRegistry::new());

        let dimmer = Arc::new(Dimmer::new(Address::router(1, 1), 1, 5, sender.clone()).unwrap());
        let group = Arc::new(SceneGroup::new(4, 1, sender).unwrap());
        registry.register_device(dimmer.clone()).unwrap();
        registry.register_group(group.clone()).unwrap();
        let dispatcher = Dispatcher::new(registry, None);

        let mut levels = vec!["*"; 136];
        levels[16 + 2] = "75";
        dispatcher.handle_message(line(&format!(
            "?V:2,C:167,@1.1.1.5={}#",
            levels.join(",")
        )));
        dispatcher.handle_message(line("?V:2,C:164,G:4=@1.1.1.5,@1.1.1.6#"));
        assert_eq!(group.members().len(), 2);

        dispatcher.handle_message(line(">V:2,C:11,G:4,B:2,S:3,F:50#"));

        assert_eq!(group.last_scene(), Some(SceneRef::new(2, 3).unwrap()));
        assert_eq!(
            dimmer.scene_level(SceneRef::new(2, 3).unwrap()),
            Some(SceneLevel::Value(75.0))
        );
        assert_eq!(dimmer.level(), Some(75.0));
    }

    #[test]
    fn test_recall_without_block_uses_group_block_for_members() {
        let (sender, _queue) = sender();
        let registry = Arc::new(HandlerRegistry::new());

        let dimmer = Arc::new(Dimmer::new(Address::router(1, 1), 1, 5, sender.clone()).unwrap());
        let group = Arc::new(SceneGroup::new(4, 2, sender).unwrap());
        let bystander = Arc::new(StubDevice {
            address: Some(Address::device_of(1, 1, 1, 6)),
            ..Default::default()
        });
        registry.register_device(dimmer.clone()).unwrap();
        registry.register_device(bystander.clone()).unwrap();
        registry.register_group(group.clone()).unwrap();
        let dispatcher = Dispatcher::new(registry, None);

        let mut levels = vec!["*"; 136];
        levels[16 + 2] = "75";
        dispatcher.handle_message(line(&format!(
            "?V:2,C:167,@1.1.1.5={}#",
            levels.join(",")
        )));
        dispatcher.handle_message(line("?V:2,C:164,G:4=@1.1.1.5#"));

        dispatcher.handle_message(line(">V:2,C:11,G:4,S:3#"));

        assert_eq!(group.last_scene(), Some(SceneRef::new(2, 3).unwrap()));
        assert_eq!(dimmer.level(), Some(75.0));
        assert!(bystander.scenes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recall_for_unknown_group_is_dropped() {
        let registry = Arc::new(HandlerRegistry::new());
        let device = Arc::new(StubDevice::default());
        registry.register_device(device.clone()).unwrap();
        let dispatcher = Dispatcher::new(registry, None);

        dispatcher.handle_message(line(">V:2,C:11,G:4,B:1,S:1#"));
        assert!(device.scenes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discovery_replies_reach_coordinator() {
        let (sender, queue) = sender();
        let (tx, mut rx) = mpsc::unbounded_channel::<DiscoveryEvent>();
        let discovery = Arc::new(DiscoveryCoordinator::new(
            Address::router(1, 1),
            sender,
            Arc::new(tx),
            None,
        ));
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()), Some(discovery.clone()));

        discovery.start();
        dispatcher.handle_message(line("?V:2,C:100,@1.1.3=1537@9#"));
        dispatcher.handle_message(line("?V:2,C:106,@1.1.3.9=Stairs#"));

        match rx.try_recv().unwrap() {
            DiscoveryEvent::Device(device) => assert_eq!(device.name, "Stairs"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_router_time_is_recorded() {
        let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()), None);
        assert!(dispatcher.last_router_time().is_none());

        dispatcher.handle_message(line("?V:2,C:185=1700000000#"));
        assert_eq!(
            dispatcher.last_router_time().map(|t| t.timestamp()),
            Some(1_700_000_000)
        );

        dispatcher.handle_message(line("?V:2,C:185=soon#"));
        assert_eq!(
            dispatcher.last_router_time().map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }
}
