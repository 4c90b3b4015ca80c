use thiserror::Error;

/// Errors raised by a [`Space`](crate::space::Space) implementation.
///
/// Every space call surfaces storage trouble through this type. Transient
/// spaces never produce it; persistent spaces do when the backing store is
/// unreachable or its contents cannot be decoded.
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "persistent")]
    #[error("Backend error: {0}")]
    Backend(#[from] rocksdb::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Space not found: {0}")]
    NotFound(String),

    #[error("Invalid space uri: {0}")]
    InvalidUri(String),

    #[error("Space {0} is registered with different key or value types")]
    TypeMismatch(String),

    #[error("Unsupported space scheme: {0}")]
    UnsupportedScheme(String),
}

/// Error type returned by participant callbacks.
///
/// The transaction manager never lets one of these escape a prepare, commit or
/// abort walk; it logs them against the transaction id instead.
#[derive(Error, Debug)]
pub enum ParticipantError {
    #[error("Participant failed: {0}")]
    Failed(String),

    #[error("Participant space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Other participant error: {0}")]
    Other(String),
}

/// Errors raised by the [`TransactionManager`](crate::manager::TransactionManager).
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Journal error: {0}")]
    Space(#[from] SpaceError),

    #[error("Context codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown participant class: {0}")]
    UnknownParticipant(String),

    #[error("Participant construction failed: {0}")]
    Participant(#[from] ParticipantError),

    #[error("Transaction manager is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TxnError>;
