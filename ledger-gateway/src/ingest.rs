//! Account history ingestion

use crate::{
    connection::LedgerSubscriber,
    metrics::Metrics,
    types::{ClosedLedger, LedgerGap},
    Result, Storage,
};
use async_trait::async_trait;
use std::sync::Arc;

/// Writes the account records of every delivered ledger
pub struct RecordIngestor {
    storage: Arc<Storage>,
    metrics: Metrics,
}

impl RecordIngestor {
    /// Create new ingestor
    pub fn new(storage: Arc<Storage>, metrics: Metrics) -> Self {
        Self { storage, metrics }
    }
}

#[async_trait]
impl LedgerSubscriber for RecordIngestor {
    fn name(&self) -> &str {
        "ingest"
    }

    async fn on_ledger_closed(&self, ledger: &ClosedLedger, gap: Option<&LedgerGap>) -> Result<()> {
        if let Some(gap) = gap {
            tracing::warn!(
                from = gap.from,
                to = gap.to,
                "Account history is missing ledgers"
            );
        }

        let written = self.storage.append_ledger(ledger)?;
        self.metrics.records_ingested.inc_by(written as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountAddress, LedgerTransaction, TxHash};
    use crate::Config;

    #[tokio::test]
    async fn test_ingest_writes_records() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let metrics = Metrics::new().unwrap();
        let ingestor = RecordIngestor::new(storage.clone(), metrics.clone());

        let source = AccountAddress::new("rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh");
        let ledger = ClosedLedger {
            ledger_index: 42,
            ledger_hash: None,
            transactions: vec![LedgerTransaction {
                hash: TxHash::from_bytes(&[7; 32]),
                transaction_index: 0,
                account: source.clone(),
                sequence: 1,
                transaction_type: "AccountSet".to_string(),
                result: "tesSUCCESS".to_string(),
                affected_accounts: vec![],
            }],
        };

        ingestor.on_ledger_closed(&ledger, None).await.unwrap();

        assert_eq!(metrics.records_ingested.get(), 1);
        assert_eq!(storage.last_ledger_index().unwrap(), Some(42));
        assert!(storage.first_record(&source).unwrap().is_some());
    }
}
