//! Gateway orchestration layer
//!
//! Ties storage, the connection manager, the submission tracker and the
//! notification resolver together behind the calls the HTTP layer makes.
//! Inputs arrive as strings and are parsed here.
//!
//! # Example
//!
//! ```no_run
//! use ledger_gateway::{network::WebSocketClient, Config, Gateway};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ledger_gateway::Result<()> {
//!     let config = Config::default();
//!     let client = Arc::new(WebSocketClient::new(Duration::from_secs(10)));
//!     let gateway = Gateway::open(config, client).await?;
//!     gateway.start().await?;
//!
//!     // let tx = gateway.submit_transaction(account, identifier, blob_hex, sequence).await?;
//!
//!     gateway.shutdown().await
//! }
//! ```

use crate::{
    connection::{self, ConnectionManager, LifecycleEvent},
    cursor::NotificationResolver,
    ingest::RecordIngestor,
    metrics::Metrics,
    network::LedgerClient,
    tracker::SubmissionTracker,
    types::{
        AccountAddress, ConnectionStatus, LedgerTransactionRecord, Notification,
        PendingTransaction, SignedBlob, TransactionState, TxHash,
    },
    Config, Error, Result, Storage,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Main gateway interface
pub struct Gateway {
    /// Connection manager handle
    connection: ConnectionManager,

    /// Pending transaction lifecycle
    tracker: SubmissionTracker,

    /// Account history reads
    resolver: NotificationResolver,

    /// Metrics
    metrics: Metrics,

    /// Dispatcher task
    dispatcher: JoinHandle<()>,

    /// Configuration
    config: Config,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("data_dir", &self.config.data_dir)
            .field("status", &self.connection.status())
            .finish()
    }
}

impl Gateway {
    /// Open storage and spawn the dispatcher; does not connect yet
    pub async fn open(config: Config, client: Arc<dyn LedgerClient>) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new().map_err(|e| Error::Other(format!("Metrics: {}", e)))?;

        let last_ledger_index = storage.last_ledger_index()?;
        let (connection, mut dispatcher) =
            connection::channel(&config.network, client, metrics.clone(), last_ledger_index);

        let tracker = SubmissionTracker::new(
            storage.clone(),
            connection.clone(),
            metrics.clone(),
            config.tracker.expiry_ledgers,
        );

        // Records first, so a Validated transaction always has its record
        dispatcher.register(Arc::new(RecordIngestor::new(storage.clone(), metrics.clone())));
        dispatcher.register(Arc::new(tracker.clone()));
        let dispatcher = dispatcher.spawn();

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            last_ledger_index = ?last_ledger_index,
            "Gateway opened"
        );

        Ok(Self {
            connection,
            tracker,
            resolver: NotificationResolver::new(storage),
            metrics,
            dispatcher,
            config,
        })
    }

    /// Connect within the startup retry budget
    ///
    /// Fails with [`Error::NoReachableServers`] when no server answers; the
    /// caller should treat that as fatal.
    pub async fn start(&self) -> Result<()> {
        self.connection.start().await
    }

    /// Record and submit a signed transaction
    pub async fn submit_transaction(
        &self,
        account: &str,
        identifier: &str,
        signed_blob_hex: &str,
        sequence: u32,
    ) -> Result<PendingTransaction> {
        let account = AccountAddress::parse(account)?;
        let blob = SignedBlob::from_hex(signed_blob_hex)?;
        self.tracker
            .submit(account, identifier.to_string(), blob, sequence)
            .await
    }

    /// Pending transaction by client identifier
    pub fn get_pending_transaction(
        &self,
        account: &str,
        identifier: &str,
    ) -> Result<PendingTransaction> {
        self.tracker.get(&AccountAddress::parse(account)?, identifier)
    }

    /// Unresolved transactions of an account
    pub fn get_pending_transactions(&self, account: &str) -> Result<Vec<PendingTransaction>> {
        self.tracker.get_pending(&AccountAddress::parse(account)?)
    }

    /// Archive a resolved transaction
    pub fn acknowledge_transaction(
        &self,
        account: &str,
        identifier: &str,
    ) -> Result<PendingTransaction> {
        self.tracker
            .acknowledge(&AccountAddress::parse(account)?, identifier)
    }

    /// Next notification after `after_hash` (or the first one)
    ///
    /// A cursor that does not name one of the account's records, including
    /// one that is not a hash at all, fails with [`Error::UnknownCursor`].
    pub fn get_next_notification(
        &self,
        account: &str,
        after_hash: Option<&str>,
    ) -> Result<Notification> {
        let account = AccountAddress::parse(account)?;
        let cursor = after_hash
            .map(|hash| {
                TxHash::parse(hash).map_err(|_| Error::UnknownCursor {
                    account: account.to_string(),
                    hash: hash.to_string(),
                })
            })
            .transpose()?;
        self.resolver.next(&account, cursor.as_ref())
    }

    /// Next notification after the transaction submitted as `identifier`
    pub fn get_next_notification_by_identifier(
        &self,
        account: &str,
        identifier: &str,
    ) -> Result<Notification> {
        let account = AccountAddress::parse(account)?;
        let tx = self.tracker.get(&account, identifier)?;

        if tx.state != TransactionState::Validated {
            return Err(Error::InvalidState(format!(
                "Transaction {} is {}, not validated",
                identifier,
                tx.state.label()
            )));
        }

        self.resolver.next(&account, Some(&tx.hash))
    }

    /// Validated transaction touching an account
    pub fn get_transaction(&self, account: &str, hash: &str) -> Result<LedgerTransactionRecord> {
        let account = AccountAddress::parse(account)?;
        self.resolver.transaction(&account, &TxHash::parse(hash)?)
    }

    /// Connection status
    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Whether a session is open
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Fresh client identifier
    pub fn new_identifier(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.connection.subscribe()
    }

    /// Connection manager handle
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Disconnect, stop background work and release storage
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down gateway");

        self.connection.shutdown().await?;
        self.dispatcher
            .await
            .map_err(|e| Error::Concurrency(format!("Dispatcher task failed: {}", e)))?;
        self.tracker.stop().await;

        Ok(())
    }
}
