/*!
 * Prelude module for the HelvarNet core crate.
 *
 * Re-exports the types most callers need in one import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export config types
pub use crate::config::{
    ConfigBuilder, DiscoveryConfig, HelvarConfig, LoggingConfig, RouterConfig, SessionConfig,
    SharedConfig,
};

// Re-export utility functions
pub use crate::utils::{box_future, spawn_and_log, with_timeout, BoxFuture};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
