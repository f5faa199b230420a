/*!
 * HelvarNet
 *
 * This crate implements a client for HelvarNet lighting routers: the text
 * wire codec, a self-healing TCP session, discovery of devices and groups,
 * and dispatch of router messages to entity handlers.
 */

#![warn(missing_docs)]

// Re-export core types
pub use helvar_core::prelude;

pub mod address;
pub mod bridge;
pub mod command;
pub mod device_type;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod handler;
pub mod parser;
pub mod scene;
pub mod session;

// Re-export the types most hosts touch
pub use address::{Address, BusType};
pub use bridge::HelvarBridge;
pub use command::{Command, CommandType, MessageType, ParameterType};
pub use device_type::DeviceType;
pub use discovery::{DiscoveredDevice, DiscoveredGroup, DiscoveryEvent, DiscoverySink};
pub use dispatcher::{Dispatcher, HandlerRegistry, RegistryEvent};
pub use error::{HelvarError, Result};
pub use handler::{DeviceHandler, Dimmer, EntityEvent, GroupHandler, SceneGroup};
pub use scene::{Scene, SceneLevel, SceneRef};
pub use session::{SessionState, SessionStatus, StatusSink};

/// HelvarNet crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the protocol layer
pub fn init() -> std::result::Result<(), helvar_core::error::Error> {
    tracing::info!("HelvarNet {} initialized", VERSION);
    Ok(())
}
