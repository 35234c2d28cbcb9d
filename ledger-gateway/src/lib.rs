//! Ledger Gateway
//!
//! Bridges request/response clients to a ledger network that is only
//! reachable over a stateful, asynchronous connection.
//!
//! # Architecture
//!
//! - **Single Dispatcher**: One task owns the connection state machine and
//!   delivers every closed ledger, in order, to the subscribers
//! - **Write-Ahead Submission**: A transaction is durable before the network sees it
//! - **Reconciliation**: Open transactions are resubmitted on every confirmed connection
//! - **Cursor Walks**: Account history is read one record at a time, exactly once
//!
//! # Invariants
//!
//! - Ledgers are delivered in strictly increasing order, never twice
//! - Every Validated transaction has a matching account record
//! - A Submitted transaction always reaches Validated or Failed
//! - One live transaction per (account, identifier)

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod metrics;
pub mod network;
pub mod retry;
pub mod storage;
pub mod tracker;
pub mod types;

// Re-exports
pub use config::Config;
pub use connection::{ConnectionManager, LedgerSubscriber, LifecycleEvent};
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use storage::Storage;
pub use types::{
    AccountAddress, ClosedLedger, ConnectionState, ConnectionStatus, FailureReason,
    LedgerTransactionRecord, Notification, PendingTransaction, SignedBlob, TransactionState,
    TxHash,
};
