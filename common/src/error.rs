use thiserror::Error;

/// Errors shared by every keeper crate
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid heartbeat value '{value}': {reason}")]
    InvalidHeartbeat { value: String, reason: String },

    #[error("Alive node not found in {group}")]
    NoAliveNode { group: String },

    #[error("Unknown operation event: {0}")]
    UnknownOpEvent(String),

    #[error("Exchange queue closed")]
    QueueClosed,

    #[error("Registry already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeeperError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True when the error means the key does not exist in the store
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = KeeperError::not_found("/apus/agent-groups/g1/leader");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Key not found: /apus/agent-groups/g1/leader");

        let err = KeeperError::NoAliveNode {
            group: "g1".to_string(),
        };
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "Alive node not found in g1");
    }
}
