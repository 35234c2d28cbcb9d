//! Error types for the gateway

use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error (network payloads)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A live or validated transaction already uses this identifier
    #[error("Duplicate identifier {identifier} for account {account}")]
    DuplicateIdentifier {
        /// Account address
        account: String,
        /// Client identifier
        identifier: String,
    },

    /// Cursor hash is not a known record for the account
    #[error("Unknown cursor {hash} for account {account}")]
    UnknownCursor {
        /// Account address
        account: String,
        /// Cursor hash
        hash: String,
    },

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied malformed input
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// No session to the ledger network
    #[error("Not connected to the ledger network")]
    NotConnected,

    /// Network-level fault (transient)
    #[error("Network error: {0}")]
    Network(String),

    /// Request timed out
    #[error("Timeout after {seconds}s: {operation}")]
    Timeout {
        /// Timeout duration
        seconds: u64,
        /// Operation
        operation: String,
    },

    /// Startup retry budget exhausted without reaching any server
    #[error("No reachable ledger servers after {attempts} attempts")]
    NoReachableServers {
        /// Full rounds attempted over the server list
        attempts: u32,
    },

    /// Concurrency error (dispatcher mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error is attributable to caller misuse
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateIdentifier { .. }
                | Error::UnknownCursor { .. }
                | Error::NotFound(_)
                | Error::MalformedInput(_)
                | Error::InvalidState(_)
        )
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Network(err.to_string())
    }
}
