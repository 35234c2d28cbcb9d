//! Ledger network client interface
//!
//! The connection manager talks to the network only through [`LedgerClient`].
//! [`WebSocketClient`] speaks the `rippled` WebSocket API; [`MemoryNetwork`]
//! simulates a network in-process.

use crate::{
    types::{ClosedLedger, SignedBlob, TxHash},
    Result,
};
use async_trait::async_trait;
use sha2::{Digest, Sha512};
use tokio::sync::mpsc;

pub mod memory;
pub mod websocket;

pub use memory::MemoryNetwork;
pub use websocket::WebSocketClient;

/// Prefix the network hashes in front of a signed transaction ("TXN\0")
const TRANSACTION_ID_PREFIX: [u8; 4] = [0x54, 0x58, 0x4E, 0x00];

/// Unsolicited events of an open session
#[derive(Debug, Clone)]
pub enum NetworkSignal {
    /// A ledger was validated
    LedgerClosed(ClosedLedger),
    /// The server closed the session
    Disconnected,
    /// The session failed
    Error(String),
}

/// Preliminary result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued or applied by the server
    Accepted(String),
    /// Not queued now, may succeed later
    Retry(String),
    /// Malformed; can never succeed
    Rejected(String),
    /// Sequence or ledger window already passed; resubmitting cannot help
    Stale(String),
}

impl SubmitOutcome {
    /// Engine result code
    pub fn code(&self) -> &str {
        match self {
            SubmitOutcome::Accepted(code)
            | SubmitOutcome::Retry(code)
            | SubmitOutcome::Rejected(code)
            | SubmitOutcome::Stale(code) => code,
        }
    }
}

/// Ledger network client
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Client name (for logs)
    fn name(&self) -> &str;

    /// Open a session to `server`; its signals are pushed into `signals`
    async fn connect(&self, server: &str, signals: mpsc::Sender<NetworkSignal>) -> Result<()>;

    /// Tear down the current session (no-op when there is none)
    async fn disconnect(&self);

    /// Submit a signed blob over the current session
    async fn submit(&self, blob: &SignedBlob) -> Result<SubmitOutcome>;

    /// Fetch a validated ledger; `None` when the server no longer holds it
    async fn fetch_ledger(&self, ledger_index: u64) -> Result<Option<ClosedLedger>>;
}

/// Classify an engine result code
pub fn classify_engine_result(code: &str) -> SubmitOutcome {
    let accepted = code.starts_with("tes")
        || code.starts_with("tec")
        || code == "terQUEUED"
        || code == "tefALREADY";

    if accepted {
        SubmitOutcome::Accepted(code.to_string())
    } else if is_stale_result(code) {
        SubmitOutcome::Stale(code.to_string())
    } else if code.starts_with("tem") {
        SubmitOutcome::Rejected(code.to_string())
    } else {
        SubmitOutcome::Retry(code.to_string())
    }
}

/// Results after which the blob can never apply, though its sequence may
/// have gone to this very transaction
pub fn is_stale_result(code: &str) -> bool {
    matches!(code, "tefPAST_SEQ" | "tefMAX_LEDGER")
}

/// Hash of a signed transaction: first half of SHA-512 over prefix and blob
pub fn transaction_hash(blob: &SignedBlob) -> TxHash {
    let mut hasher = Sha512::new();
    hasher.update(TRANSACTION_ID_PREFIX);
    hasher.update(blob.as_bytes());
    let digest = hasher.finalize();

    let mut half = [0u8; 32];
    half.copy_from_slice(&digest[..32]);
    TxHash::from_bytes(&half)
}
