//! Core types for the gateway
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode)
//! - Validation at the edge (newtypes parse caller input once)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

/// Base58 alphabet used by the ledger network's address encoding
const ADDRESS_ALPHABET: &str = "rpshnaf39wBUDNEGHJKLM4PQRST7VWXYZ2bcdeCg65jkm8oFqi1tuvAxyz";

/// Longest client identifier accepted
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Classic account address (`r...`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountAddress(String);

impl AccountAddress {
    /// Create without validation (trusted sources such as the network feed)
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Parse caller input
    pub fn parse(address: &str) -> crate::Result<Self> {
        let valid = address.starts_with('r')
            && (25..=35).contains(&address.len())
            && address.chars().all(|c| ADDRESS_ALPHABET.contains(c));

        if !valid {
            return Err(crate::Error::MalformedInput(format!(
                "Invalid account address: {}",
                address
            )));
        }

        Ok(Self(address.to_string()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction hash (64 upper-case hex digits)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(String);

impl TxHash {
    /// Build from raw digest bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode_upper(bytes))
    }

    /// Parse caller input (case-insensitive)
    pub fn parse(hash: &str) -> crate::Result<Self> {
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(crate::Error::MalformedInput(format!(
                "Invalid transaction hash: {}",
                hash
            )));
        }

        Ok(Self(hash.to_ascii_uppercase()))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque signed transaction payload
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlob(Vec<u8>);

impl SignedBlob {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse hex-encoded caller input
    pub fn from_hex(blob: &str) -> crate::Result<Self> {
        let bytes = hex::decode(blob.trim())
            .map_err(|e| crate::Error::MalformedInput(format!("Signed blob is not hex: {}", e)))?;

        if bytes.is_empty() {
            return Err(crate::Error::MalformedInput("Signed blob is empty".to_string()));
        }

        Ok(Self(bytes))
    }

    /// Upper-case hex encoding, as the network expects it
    pub fn to_hex(&self) -> String {
        hex::encode_upper(&self.0)
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SignedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedBlob({} bytes)", self.0.len())
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    /// No session
    Disconnected = 0,
    /// Session being established
    Connecting = 1,
    /// Session open, no live ledger close seen yet
    Connected = 2,
    /// Live ledger close observed; gateway is ready
    Confirmed = 3,
    /// Session failed; reconnection pending
    Errored = 4,
}

impl ConnectionState {
    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Confirmed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Confirmed => "confirmed",
            ConnectionState::Errored => "errored",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,

    /// Server of the current session
    pub server: Option<String>,

    /// Last ledger delivered to subscribers
    pub last_ledger_index: Option<u64>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            server: None,
            last_ledger_index: None,
        }
    }
}

/// Why a pending transaction failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Account sequence consumed by a different transaction
    Superseded,
    /// Unresolved after the configured number of ledger closes
    Expired,
    /// Sequence consumed inside a ledger range that could not be backfilled
    GapUnresolvable,
    /// Network rejected the blob as malformed (engine result attached)
    Rejected(String),
}

/// Lifecycle state of a pending transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Durably recorded and handed to the network
    Submitted,
    /// Included in a validated ledger (terminal)
    Validated,
    /// Will never be included (terminal)
    Failed(FailureReason),
    /// Last submission was not accepted by the connected server
    Missing,
}

impl TransactionState {
    /// Validated or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Validated | TransactionState::Failed(_))
    }

    /// Failed with any reason
    pub fn is_failed(&self) -> bool {
        matches!(self, TransactionState::Failed(_))
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            TransactionState::Submitted => "submitted",
            TransactionState::Validated => "validated",
            TransactionState::Missing => "missing",
            TransactionState::Failed(FailureReason::Superseded) => "superseded",
            TransactionState::Failed(FailureReason::Expired) => "expired",
            TransactionState::Failed(FailureReason::GapUnresolvable) => "gap_unresolvable",
            TransactionState::Failed(FailureReason::Rejected(_)) => "rejected",
        }
    }
}

/// A transaction submitted through this gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Client correlation id, unique per account
    pub identifier: String,

    /// Source account
    pub account: AccountAddress,

    /// Account sequence reserved by the transaction
    pub sequence: u32,

    /// Hash derived from the signed blob
    pub hash: TxHash,

    /// Signed payload
    pub signed_blob: SignedBlob,

    /// Current state
    pub state: TransactionState,

    /// When the gateway first recorded the transaction
    pub submitted_at: DateTime<Utc>,

    /// Last state change
    pub updated_at: DateTime<Utc>,

    /// Last ledger this transaction was checked against
    pub last_checked_ledger_index: Option<u64>,

    /// Ledger closes observed without resolution
    pub ledgers_checked: u32,

    /// Network submissions performed
    pub submit_attempts: u32,

    /// Engine result of the last submission
    pub last_engine_result: Option<String>,

    /// Ledger that validated the transaction
    pub validated_ledger_index: Option<u64>,

    /// Missed ledgers, seen while open, that may hold this transaction
    pub unresolved_gap: Option<LedgerGap>,
}

impl PendingTransaction {
    /// New record in Submitted state
    pub fn new(
        account: AccountAddress,
        identifier: String,
        sequence: u32,
        hash: TxHash,
        signed_blob: SignedBlob,
    ) -> Self {
        let now = Utc::now();
        Self {
            identifier,
            account,
            sequence,
            hash,
            signed_blob,
            state: TransactionState::Submitted,
            submitted_at: now,
            updated_at: now,
            last_checked_ledger_index: None,
            ledgers_checked: 0,
            submit_attempts: 0,
            last_engine_result: None,
            validated_ledger_index: None,
            unresolved_gap: None,
        }
    }

    /// Move to a new state
    pub fn transition(&mut self, state: TransactionState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Whether the outcome is known
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A validated transaction as delivered by the ledger feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    /// Transaction hash
    pub hash: TxHash,

    /// Position inside the ledger
    pub transaction_index: u32,

    /// Source account
    pub account: AccountAddress,

    /// Source account sequence consumed
    pub sequence: u32,

    /// Transaction type (`Payment`, `OfferCreate`, ...)
    pub transaction_type: String,

    /// Engine result (`tesSUCCESS`, `tec...`)
    pub result: String,

    /// Every account the transaction touched, source included
    pub affected_accounts: Vec<AccountAddress>,
}

/// A newly validated ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedLedger {
    /// Ledger index
    pub ledger_index: u64,

    /// Ledger hash, when the feed provides it
    pub ledger_hash: Option<String>,

    /// Transactions ordered by `transaction_index`
    pub transactions: Vec<LedgerTransaction>,
}

/// Ledgers that were missed and could not be backfilled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerGap {
    /// First missing ledger
    pub from: u64,

    /// Last missing ledger
    pub to: u64,
}

impl LedgerGap {
    /// Missing range
    pub fn range(&self) -> RangeInclusive<u64> {
        self.from..=self.to
    }

    /// Number of missing ledgers
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Smallest range covering both gaps
    pub fn merge(&self, other: &LedgerGap) -> LedgerGap {
        LedgerGap {
            from: self.from.min(other.from),
            to: self.to.max(other.to),
        }
    }
}

/// A confirmed transaction that touched an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransactionRecord {
    /// Account this record belongs to
    pub account: AccountAddress,

    /// Ledger index (primary ordering key)
    pub ledger_index: u64,

    /// Position inside the ledger (secondary ordering key)
    pub transaction_index: u32,

    /// Transaction hash
    pub hash: TxHash,

    /// Transaction type
    pub transaction_type: String,

    /// Source account of the transaction
    pub source_account: AccountAddress,

    /// Source account sequence
    pub sequence: u32,

    /// Engine result
    pub result: String,
}

impl LedgerTransactionRecord {
    /// Record of `tx` as seen from `account`
    pub fn from_ledger(account: &AccountAddress, ledger_index: u64, tx: &LedgerTransaction) -> Self {
        Self {
            account: account.clone(),
            ledger_index,
            transaction_index: tx.transaction_index,
            hash: tx.hash.clone(),
            transaction_type: tx.transaction_type.clone(),
            source_account: tx.account.clone(),
            sequence: tx.sequence,
            result: tx.result.clone(),
        }
    }

    /// Total-order key within the account
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.ledger_index, self.transaction_index)
    }
}

/// Result of a notification lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// The next unseen record
    Next(LedgerTransactionRecord),
    /// The account has no history
    None,
    /// The cursor is the latest record
    NoneYet,
}
