use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the storage and replication core.
///
/// `Duplicate` is deliberately not a variant: applying an already-known
/// event is a normal outcome, reported through
/// [`Applied`](crate::stash::Applied).
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input: drawer name, cursor, URL, missing form field.
    #[error("{0}")]
    Validation(String),

    /// The requested file or metadata record does not exist.
    #[error("not found")]
    NotFound,

    /// The key-value store failed underneath us.
    #[error("storage: {0}")]
    Storage(String),

    /// A wire or outbound-HTTP operation failed.
    #[error("network: {0}")]
    Network(String),

    /// A structured record could not be decoded; the peer is incompatible
    /// or the data is corrupt.
    #[error("codec: {0}")]
    Codec(String),

    /// A task or channel broke down inside the process.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(e.to_string())
    }
}
