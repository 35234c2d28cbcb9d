//! In-process ledger network
//!
//! Behaves like a single always-validating server. Tests drive it directly:
//! close ledgers, open gaps, prune history, drop the session or inject errors.

use super::{transaction_hash, LedgerClient, NetworkSignal, SubmitOutcome};
use crate::{
    types::{AccountAddress, ClosedLedger, LedgerTransaction, SignedBlob},
    Error, Result,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

struct Session {
    server: String,
    signals: mpsc::Sender<NetworkSignal>,
}

struct Inner {
    reachable: bool,
    session: Option<Session>,
    ledgers: BTreeMap<u64, ClosedLedger>,
    next_index: u64,
    submitted: Vec<SignedBlob>,
    submit_outcome: Option<SubmitOutcome>,
    connect_attempts: u32,
}

/// Simulated ledger network
pub struct MemoryNetwork {
    inner: Mutex<Inner>,
}

impl MemoryNetwork {
    /// Network whose next ledger will be `first_ledger_index`
    pub fn new(first_ledger_index: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                reachable: true,
                session: None,
                ledgers: BTreeMap::new(),
                next_index: first_ledger_index,
                submitted: Vec::new(),
                submit_outcome: None,
                connect_attempts: 0,
            }),
        }
    }

    /// Build a validated transaction for `blob`
    pub fn transaction(
        blob: &SignedBlob,
        account: &str,
        sequence: u32,
        transaction_index: u32,
        affected: &[&str],
    ) -> LedgerTransaction {
        LedgerTransaction {
            hash: transaction_hash(blob),
            transaction_index,
            account: AccountAddress::new(account),
            sequence,
            transaction_type: "Payment".to_string(),
            result: "tesSUCCESS".to_string(),
            affected_accounts: affected.iter().map(|a| AccountAddress::new(*a)).collect(),
        }
    }

    /// Make connection attempts succeed or fail
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Override the outcome of subsequent submissions (`None` accepts)
    pub fn set_submit_outcome(&self, outcome: Option<SubmitOutcome>) {
        self.inner.lock().submit_outcome = outcome;
    }

    /// Validate the next ledger and announce it on the open session
    pub async fn close_ledger(&self, transactions: Vec<LedgerTransaction>) -> u64 {
        let (ledger, signals) = {
            let mut inner = self.inner.lock();
            let ledger = Self::store_next(&mut inner, transactions);
            let signals = inner.session.as_ref().map(|s| s.signals.clone());
            (ledger, signals)
        };

        let ledger_index = ledger.ledger_index;
        if let Some(signals) = signals {
            let _ = signals.send(NetworkSignal::LedgerClosed(ledger)).await;
        }
        ledger_index
    }

    /// Validate the next ledger without announcing it (the gateway misses it)
    pub fn skip_ledger(&self, transactions: Vec<LedgerTransaction>) -> u64 {
        let mut inner = self.inner.lock();
        Self::store_next(&mut inner, transactions).ledger_index
    }

    /// Forget a ledger so that fetching it returns nothing
    pub fn prune(&self, ledger_index: u64) {
        self.inner.lock().ledgers.remove(&ledger_index);
    }

    /// Close the session from the server side
    pub async fn drop_connection(&self) {
        let session = self.inner.lock().session.take();
        if let Some(session) = session {
            let _ = session.signals.send(NetworkSignal::Disconnected).await;
        }
    }

    /// Report a session failure
    pub async fn emit_error(&self, message: &str) {
        let signals = self
            .inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.signals.clone());
        if let Some(signals) = signals {
            let _ = signals.send(NetworkSignal::Error(message.to_string())).await;
        }
    }

    /// Blobs received so far, in order
    pub fn submitted(&self) -> Vec<SignedBlob> {
        self.inner.lock().submitted.clone()
    }

    /// Number of successful `connect` calls
    pub fn connect_attempts(&self) -> u32 {
        self.inner.lock().connect_attempts
    }

    /// Server of the open session
    pub fn current_server(&self) -> Option<String> {
        self.inner.lock().session.as_ref().map(|s| s.server.clone())
    }

    fn store_next(inner: &mut Inner, mut transactions: Vec<LedgerTransaction>) -> ClosedLedger {
        transactions.sort_by_key(|tx| tx.transaction_index);

        let ledger_index = inner.next_index;
        inner.next_index += 1;

        let ledger = ClosedLedger {
            ledger_index,
            ledger_hash: Some(format!("{:064X}", ledger_index)),
            transactions,
        };
        inner.ledgers.insert(ledger_index, ledger.clone());
        ledger
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl LedgerClient for MemoryNetwork {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self, server: &str, signals: mpsc::Sender<NetworkSignal>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.reachable {
            return Err(Error::Network(format!("{} unreachable", server)));
        }

        inner.connect_attempts += 1;
        inner.session = Some(Session {
            server: server.to_string(),
            signals,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.lock().session = None;
    }

    async fn submit(&self, blob: &SignedBlob) -> Result<SubmitOutcome> {
        let mut inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(Error::NotConnected);
        }

        inner.submitted.push(blob.clone());
        Ok(inner
            .submit_outcome
            .clone()
            .unwrap_or_else(|| SubmitOutcome::Accepted("tesSUCCESS".to_string())))
    }

    async fn fetch_ledger(&self, ledger_index: u64) -> Result<Option<ClosedLedger>> {
        let inner = self.inner.lock();
        if inner.session.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(inner.ledgers.get(&ledger_index).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_connect_fails() {
        let network = MemoryNetwork::new(10);
        network.set_reachable(false);
        let (tx, _rx) = mpsc::channel(8);
        assert!(network.connect("ws://a", tx).await.is_err());
        assert_eq!(network.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_close_ledger_emits_signal() {
        let network = MemoryNetwork::new(10);
        let (tx, mut rx) = mpsc::channel(8);
        network.connect("ws://a", tx).await.unwrap();

        let index = network.close_ledger(vec![]).await;
        assert_eq!(index, 10);

        match rx.recv().await {
            Some(NetworkSignal::LedgerClosed(ledger)) => assert_eq!(ledger.ledger_index, 10),
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_skipped_ledger_is_fetchable_until_pruned() {
        let network = MemoryNetwork::new(5);
        let (tx, mut rx) = mpsc::channel(8);
        network.connect("ws://a", tx).await.unwrap();

        let skipped = network.skip_ledger(vec![]);
        assert!(rx.try_recv().is_err());
        assert!(network.fetch_ledger(skipped).await.unwrap().is_some());

        network.prune(skipped);
        assert!(network.fetch_ledger(skipped).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_submit_requires_session() {
        let network = MemoryNetwork::default();
        let blob = SignedBlob::from_bytes(vec![1, 2, 3]);
        assert!(matches!(network.submit(&blob).await, Err(Error::NotConnected)));

        let (tx, _rx) = mpsc::channel(8);
        network.connect("ws://a", tx).await.unwrap();
        network.set_submit_outcome(Some(SubmitOutcome::Retry("terPRE_SEQ".to_string())));
        assert_eq!(
            network.submit(&blob).await.unwrap(),
            SubmitOutcome::Retry("terPRE_SEQ".to_string())
        );
        assert_eq!(network.submitted(), vec![blob]);
    }
}
