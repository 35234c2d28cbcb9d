//! Submission tracker
//!
//! Owns the lifecycle of every transaction submitted through the gateway:
//! write-ahead persistence before the network call, reconciliation against
//! each closed ledger, and resubmission whenever the connection is confirmed.
//!
//! # State machine
//!
//! ```text
//!            submit (durable write)
//!                    │
//!                    ▼
//!   ┌──────────► Submitted ◄──────── Accepted ───┐
//!   │                │                           │
//!   │ Accepted       │ Retry                     │
//!   │                ▼                           │
//!   └─────────── Missing ────────────────────────┘
//!                    │
//!      ledger close  │  hash seen ─────────► Validated
//!                    │  sequence consumed ─► Failed(Superseded | GapUnresolvable)
//!                    │  budget spent ──────► Failed(Expired | GapUnresolvable)
//!                    │  tem* result ───────► Failed(Rejected)
//! ```
//!
//! A ledger gap that could not be backfilled is recorded on every
//! transaction open at the time. From then on a consumed sequence or a
//! spent budget can no longer be told apart from validation inside the
//! gap, so both resolve to `GapUnresolvable`.

use crate::{
    connection::{ConnectionManager, LedgerSubscriber},
    metrics::Metrics,
    network::{is_stale_result, transaction_hash, SubmitOutcome},
    types::{
        AccountAddress, ClosedLedger, FailureReason, LedgerGap, PendingTransaction, SignedBlob,
        TransactionState, TxHash, MAX_IDENTIFIER_LEN,
    },
    Error, Result, Storage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Outcome of checking one transaction against one ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The transaction is in the ledger
    Validated,
    /// The transaction can no longer be applied
    Failed(FailureReason),
    /// Nothing known yet
    Unresolved,
}

/// Decide what a closed ledger means for a pending transaction
///
/// `gap` is an unresolved gap reported with this ledger; one recorded
/// earlier on the transaction counts the same. `expiry_ledgers` bounds how
/// many ledger closes a transaction may stay unresolved, this one included.
pub fn evaluate(
    tx: &PendingTransaction,
    ledger: &ClosedLedger,
    gap: Option<&LedgerGap>,
    expiry_ledgers: u32,
) -> Resolution {
    if ledger.transactions.iter().any(|t| t.hash == tx.hash) {
        return Resolution::Validated;
    }

    let gap = gap.or(tx.unresolved_gap.as_ref());

    let consumed = ledger
        .transactions
        .iter()
        .filter(|t| t.account == tx.account && t.hash != tx.hash)
        .map(|t| t.sequence)
        .filter(|sequence| *sequence >= tx.sequence)
        .min();

    match consumed {
        // Our sequence went to another transaction in this very ledger
        Some(sequence) if sequence == tx.sequence => {
            return Resolution::Failed(FailureReason::Superseded);
        }
        // Consumed earlier; with missed ledgers we cannot tell by what
        Some(_) if gap.is_some() => {
            return Resolution::Failed(FailureReason::GapUnresolvable);
        }
        Some(_) => return Resolution::Failed(FailureReason::Superseded),
        None => {}
    }

    if tx.ledgers_checked.saturating_add(1) >= expiry_ledgers {
        let reason = if gap.is_some() {
            FailureReason::GapUnresolvable
        } else {
            FailureReason::Expired
        };
        return Resolution::Failed(reason);
    }

    Resolution::Unresolved
}

/// Tracks submitted transactions until they validate or fail
#[derive(Clone)]
pub struct SubmissionTracker {
    storage: Arc<Storage>,
    connection: ConnectionManager,
    metrics: Metrics,
    expiry_ledgers: u32,
    resubmission: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SubmissionTracker {
    /// Create new tracker
    pub fn new(
        storage: Arc<Storage>,
        connection: ConnectionManager,
        metrics: Metrics,
        expiry_ledgers: u32,
    ) -> Self {
        Self {
            storage,
            connection,
            metrics,
            expiry_ledgers: expiry_ledgers.max(1),
            resubmission: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancel an in-flight resubmission pass
    pub async fn stop(&self) {
        let task = self.resubmission.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    /// Record a signed transaction and hand it to the network
    ///
    /// The record is durable before the network sees the blob. Returns as
    /// soon as the submission round trip is over; never waits for
    /// validation. An identifier may only be reused after its previous
    /// transaction failed.
    pub async fn submit(
        &self,
        account: AccountAddress,
        identifier: String,
        signed_blob: SignedBlob,
        sequence: u32,
    ) -> Result<PendingTransaction> {
        validate_identifier(&identifier)?;
        let hash = transaction_hash(&signed_blob);

        let record = {
            let _guard = self.storage.lock_pending(&account, &identifier);

            if let Some(existing) = self.storage.get_pending(&account, &identifier)? {
                if !existing.state.is_failed() {
                    return Err(Error::DuplicateIdentifier {
                        account: account.to_string(),
                        identifier,
                    });
                }
            }

            let record = PendingTransaction::new(account, identifier, sequence, hash, signed_blob);
            self.storage.put_pending(&record)?;
            record
        };

        tracing::info!(
            account = %record.account,
            identifier = %record.identifier,
            sequence = record.sequence,
            hash = %record.hash,
            "Transaction recorded"
        );

        let outcome = self.connection.submit(&record.signed_blob).await;
        let updated = self.apply_outcome(&record.account, &record.identifier, &record.hash, outcome)?;

        Ok(updated.unwrap_or(record))
    }

    /// Fold a submission outcome into the stored record
    fn apply_outcome(
        &self,
        account: &AccountAddress,
        identifier: &str,
        hash: &TxHash,
        outcome: Result<SubmitOutcome>,
    ) -> Result<Option<PendingTransaction>> {
        let _guard = self.storage.lock_pending(account, identifier);

        let Some(mut tx) = self.storage.get_pending(account, identifier)? else {
            return Ok(None);
        };

        // Resolved or replaced while the request was in flight
        if tx.is_terminal() || tx.hash != *hash {
            return Ok(Some(tx));
        }

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::NotConnected) => {
                tracing::debug!(
                    account = %account,
                    identifier = %identifier,
                    "Not connected; transaction will be submitted once the connection is confirmed"
                );
                return Ok(Some(tx));
            }
            Err(e) => {
                tracing::warn!(
                    account = %account,
                    identifier = %identifier,
                    error = %e,
                    "Submission failed; will retry on next confirmation"
                );
                return Ok(Some(tx));
            }
        };

        self.metrics.submissions_total.inc();
        tx.submit_attempts = tx.submit_attempts.saturating_add(1);
        tx.last_engine_result = Some(outcome.code().to_string());

        match outcome {
            SubmitOutcome::Accepted(code) => {
                tracing::debug!(identifier = %identifier, engine_result = %code, "Submission accepted");
                if tx.state == TransactionState::Missing {
                    tx.transition(TransactionState::Submitted);
                }
            }
            SubmitOutcome::Retry(code) => {
                tracing::info!(identifier = %identifier, engine_result = %code, "Submission not queued");
                tx.transition(TransactionState::Missing);
            }
            SubmitOutcome::Stale(code) => {
                // Ledgers decide: validated earlier, superseded, or expired
                tracing::info!(identifier = %identifier, engine_result = %code, "Submission window passed");
                if tx.state == TransactionState::Missing {
                    tx.transition(TransactionState::Submitted);
                }
            }
            SubmitOutcome::Rejected(code) => {
                tracing::warn!(identifier = %identifier, engine_result = %code, "Submission rejected");
                tx.transition(TransactionState::Failed(FailureReason::Rejected(code)));
                self.metrics.record_resolution(&tx.state);
            }
        }

        self.storage.put_pending(&tx)?;
        Ok(Some(tx))
    }

    /// Resubmit every open transaction
    pub async fn resubmit_open(&self) -> Result<usize> {
        let open = self.storage.open_transactions()?;
        if !open.is_empty() {
            tracing::info!(count = open.len(), "Resubmitting open transactions");
        }

        let mut resubmitted = 0;
        for tx in open {
            if tx.last_engine_result.as_deref().is_some_and(is_stale_result) {
                continue;
            }
            let outcome = self.connection.submit(&tx.signed_blob).await;
            if matches!(outcome, Err(Error::NotConnected)) {
                // Next confirmation retries the rest
                break;
            }
            self.apply_outcome(&tx.account, &tx.identifier, &tx.hash, outcome)?;
            resubmitted += 1;
        }

        Ok(resubmitted)
    }

    /// Check one open transaction against a closed ledger
    fn reconcile(
        &self,
        open: &PendingTransaction,
        ledger: &ClosedLedger,
        gap: Option<&LedgerGap>,
    ) -> Result<()> {
        let _guard = self.storage.lock_pending(&open.account, &open.identifier);

        let Some(mut tx) = self.storage.get_pending(&open.account, &open.identifier)? else {
            return Ok(());
        };
        if tx.is_terminal() || tx.hash != open.hash {
            return Ok(());
        }
        if tx
            .last_checked_ledger_index
            .is_some_and(|checked| checked >= ledger.ledger_index)
        {
            return Ok(());
        }

        tx.last_checked_ledger_index = Some(ledger.ledger_index);
        if let Some(gap) = gap {
            tracing::warn!(
                account = %tx.account,
                identifier = %tx.identifier,
                from = gap.from,
                to = gap.to,
                "Open transaction may have been validated in missed ledgers"
            );
            tx.unresolved_gap = Some(match &tx.unresolved_gap {
                Some(seen) => seen.merge(gap),
                None => gap.clone(),
            });
        }

        match evaluate(&tx, ledger, None, self.expiry_ledgers) {
            Resolution::Validated => {
                tx.validated_ledger_index = Some(ledger.ledger_index);
                tx.transition(TransactionState::Validated);
            }
            Resolution::Failed(reason) => {
                tx.ledgers_checked = tx.ledgers_checked.saturating_add(1);
                tx.transition(TransactionState::Failed(reason));
            }
            Resolution::Unresolved => {
                tx.ledgers_checked = tx.ledgers_checked.saturating_add(1);
            }
        }

        if tx.is_terminal() {
            self.metrics.record_resolution(&tx.state);
            tracing::info!(
                account = %tx.account,
                identifier = %tx.identifier,
                ledger_index = ledger.ledger_index,
                outcome = tx.state.label(),
                "Transaction resolved"
            );
        }

        self.storage.put_pending(&tx)
    }

    /// Live or archived record
    pub fn get(&self, account: &AccountAddress, identifier: &str) -> Result<PendingTransaction> {
        self.storage
            .get_pending(account, identifier)?
            .ok_or_else(|| Error::NotFound(format!("Transaction {} for {}", identifier, account)))
    }

    /// Non-terminal records of an account
    pub fn get_pending(&self, account: &AccountAddress) -> Result<Vec<PendingTransaction>> {
        Ok(self
            .storage
            .account_pending(account)?
            .into_iter()
            .filter(|tx| !tx.is_terminal())
            .collect())
    }

    /// Archive a terminal record
    pub fn acknowledge(&self, account: &AccountAddress, identifier: &str) -> Result<PendingTransaction> {
        let _guard = self.storage.lock_pending(account, identifier);

        let tx = self
            .storage
            .get_pending(account, identifier)?
            .ok_or_else(|| Error::NotFound(format!("Transaction {} for {}", identifier, account)))?;

        if !tx.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Transaction {} is still {}",
                identifier,
                tx.state.label()
            )));
        }

        self.storage.archive_pending(&tx)?;
        Ok(tx)
    }
}

#[async_trait]
impl LedgerSubscriber for SubmissionTracker {
    fn name(&self) -> &str {
        "tracker"
    }

    async fn on_ledger_closed(&self, ledger: &ClosedLedger, gap: Option<&LedgerGap>) -> Result<()> {
        for open in self.storage.open_transactions()? {
            self.reconcile(&open, ledger, gap)?;
        }
        Ok(())
    }

    async fn on_ready(&self) -> Result<()> {
        let tracker = self.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = tracker.resubmit_open().await {
                tracing::error!(error = %e, "Resubmission failed");
            }
        });

        // A newer pass supersedes an unfinished one
        if let Some(previous) = self.resubmission.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() || identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::MalformedInput(format!(
            "Identifier must be 1 to {} bytes",
            MAX_IDENTIFIER_LEN
        )));
    }
    if identifier.chars().any(char::is_control) {
        return Err(Error::MalformedInput(
            "Identifier must not contain control characters".to_string(),
        ));
    }
    Ok(())
}
