use thiserror::Error;

/// Rejection of a desired app configuration received from outside.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("desired config must be a mapping, got {0}")]
    NotAMapping(&'static str),
    #[error("invalid app '{app}': {reason}")]
    InvalidApp { app: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client error: {0}")]
    Client(String),
    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}
