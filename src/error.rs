use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoomservError>;

#[derive(Debug, Error)]
pub enum RoomservError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("not found")]
    NotFound,
    #[error("event already exists")]
    AlreadyExists,
    #[error("event rejected by auth rules: {0}")]
    AuthRejected(String),
    #[error("user is not in this room")]
    UserNotInRoom,
    #[error("event not found")]
    EventNotFound,
    #[error("stream token has expired")]
    TokenExpired,
    #[error("duplicate reaction")]
    DuplicateReaction,
    #[error("invalid versionstamp")]
    InvalidVersion,
    #[error("retryable storage error: {0}")]
    Retryable(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RoomservError {
    /// Whether the transaction harness should re-run the closure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<toml::de::Error> for RoomservError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for RoomservError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RoomservError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RoomservError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RoomservError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for RoomservError {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TryAgain
            | rocksdb::ErrorKind::TimedOut => Self::Retryable(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}
