/*!
 * Error types for the HelvarNet protocol crate.
 */
use thiserror::Error;

/// Error type for protocol, session and discovery operations
#[derive(Error, Debug)]
pub enum HelvarError {
    /// A received line does not follow the wire grammar, or names an unknown
    /// command id or parameter tag
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Malformed address text
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// A parameter expected in a decoded command is absent or not numeric
    #[error("Parameter not found in command: {0}")]
    NotFoundInCommand(String),

    /// A reply result could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Transport failure while connecting, reading or writing
    #[error("Communication error: {0}")]
    Communication(String),

    /// Missing or invalid configuration; never retried automatically
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Handler registry failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] helvar_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for HelvarNet operations
pub type Result<T> = std::result::Result<T, HelvarError>;

impl HelvarError {
    /// Create a new unsupported command error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::UnsupportedCommand(msg.as_ref().to_string())
    }

    /// Create a new invalid address error
    pub fn invalid_address<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::InvalidAddress(msg.as_ref().to_string())
    }

    /// Create a new not-found-in-command error
    pub fn not_found<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::NotFoundInCommand(msg.as_ref().to_string())
    }

    /// Create a new invalid response error
    pub fn invalid_response<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::InvalidResponse(msg.as_ref().to_string())
    }

    /// Create a new communication error
    pub fn communication<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::Communication(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn configuration<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::Configuration(msg.as_ref().to_string())
    }

    /// Create a new registry error
    pub fn registry<S: AsRef<str>>(msg: S) -> Self {
        HelvarError::Registry(msg.as_ref().to_string())
    }

    /// Whether a failed connect attempt should be retried after the reconnect delay
    pub fn is_retryable(&self) -> bool {
        match self {
            HelvarError::Communication(_) | HelvarError::Io(_) => true,
            HelvarError::Core(helvar_core::error::Error::Timeout(_))
            | HelvarError::Core(helvar_core::error::Error::Io(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(HelvarError::communication("refused").is_retryable());
        assert!(HelvarError::Core(helvar_core::error::Error::timeout("connect")).is_retryable());
        assert!(!HelvarError::configuration("no host").is_retryable());
        assert!(!HelvarError::unsupported("garbage").is_retryable());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: HelvarError = helvar_core::error::Error::config("missing host").into();
        assert!(matches!(err, HelvarError::Core(_)));
        assert!(err.to_string().contains("missing host"));
    }
}
