//! WolfGroup Error Types

use thiserror::Error;

/// Result type alias for WolfGroup operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfGroup error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Local configuration store errors
    #[error("Local configuration access failed: {0}")]
    ConfigAccess(String),

    // Replicated store errors
    #[error("Replicated store error: {0}")]
    Store(String),

    #[error("Malformed replicated entry {key}: {reason}")]
    MalformedEntry { key: String, reason: String },

    // Group errors
    #[error("Invalid group name: {0:?}")]
    InvalidGroupName(String),

    // Transport errors
    #[error("Transport registration failed for channel {channel}: {reason}")]
    TransportRegistration { channel: String, reason: String },

    // Synchronizer errors
    #[error("Synchronizer {name} failed: {reason}")]
    Synchronizer { name: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Group manager is not running")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::ConfigAccess(_) | Error::TransportRegistration { .. }
        )
    }

    /// Check if this error leaves the node in a degraded but usable state
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Error::TransportRegistration { .. } | Error::Synchronizer { .. } | Error::MalformedEntry { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::TransportRegistration {
            channel: "ops".to_string(),
            reason: "closed".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.is_degraded());
        assert_eq!(
            err.to_string(),
            "Transport registration failed for channel ops: closed"
        );

        let err = Error::ConfigAccess("disk full".to_string());
        assert!(err.is_retryable());
        assert!(!err.is_degraded());

        let err = Error::InvalidGroupName("a.b".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid group name: \"a.b\"");
    }
}
