//! Error types for channels and their backing stores.

use thiserror::Error;

/// Main error type for channel and store operations.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Create-if-absent raced with another creator. Retried by the channel.
    #[error("Collection already exists: {0}")]
    CollectionAlreadyExists(String),

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Broken cursor on channel: {0}")]
    BrokenCursor(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Connection destroyed")]
    ConnectionDestroyed,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Collection dropped: {0}")]
    CollectionDropped(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Timed out waiting for channel: {0}")]
    Timeout(String),
}

impl MqError {
    /// True for the benign create-if-absent race.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, MqError::CollectionAlreadyExists(_))
    }
}

impl From<serde_json::Error> for MqError {
    fn from(e: serde_json::Error) -> Self {
        MqError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MqError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MqError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MqError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MqError::Deserialization(e.to_string())
    }
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, MqError>;
