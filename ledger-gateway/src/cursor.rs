//! Notification cursor resolution
//!
//! A client walks an account's history one record at a time, handing back
//! the hash of the last record it saw. Order is `(ledger_index,
//! transaction_index)` and is fixed by the storage key layout, so repeated
//! calls with the same cursor always return the same record.

use crate::{
    types::{AccountAddress, LedgerTransactionRecord, Notification, TxHash},
    Error, Result, Storage,
};
use std::sync::Arc;

/// Resolves cursors against stored account records
#[derive(Clone)]
pub struct NotificationResolver {
    storage: Arc<Storage>,
}

impl NotificationResolver {
    /// Create new resolver
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Record following `after`, or the first record without a cursor
    pub fn next(&self, account: &AccountAddress, after: Option<&TxHash>) -> Result<Notification> {
        let Some(cursor) = after else {
            return Ok(self
                .storage
                .first_record(account)?
                .map_or(Notification::None, Notification::Next));
        };

        let position = self
            .storage
            .record_position(account, cursor)?
            .ok_or_else(|| Error::UnknownCursor {
                account: account.to_string(),
                hash: cursor.to_string(),
            })?;

        Ok(self
            .storage
            .record_after(account, position)?
            .map_or(Notification::NoneYet, Notification::Next))
    }

    /// Record of one transaction for an account
    pub fn transaction(
        &self,
        account: &AccountAddress,
        hash: &TxHash,
    ) -> Result<LedgerTransactionRecord> {
        self.storage
            .get_record(account, hash)?
            .ok_or_else(|| Error::NotFound(format!("Transaction {} for {}", hash, account)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClosedLedger, LedgerTransaction};
    use crate::Config;
    use tempfile::TempDir;

    const ACC_A: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const ACC_B: &str = "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY";

    fn hash(n: u8) -> TxHash {
        TxHash::from_bytes(&[n; 32])
    }

    fn setup() -> (NotificationResolver, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        for (ledger_index, txs) in [(10u64, vec![(1u8, 0u32), (2, 3)]), (12, vec![(3, 1)])] {
            storage
                .append_ledger(&ClosedLedger {
                    ledger_index,
                    ledger_hash: None,
                    transactions: txs
                        .into_iter()
                        .map(|(n, index)| LedgerTransaction {
                            hash: hash(n),
                            transaction_index: index,
                            account: AccountAddress::new(ACC_A),
                            sequence: n as u32,
                            transaction_type: "Payment".to_string(),
                            result: "tesSUCCESS".to_string(),
                            affected_accounts: vec![],
                        })
                        .collect(),
                })
                .unwrap();
        }

        (NotificationResolver::new(storage), temp_dir)
    }

    fn next_hash(notification: Notification) -> TxHash {
        match notification {
            Notification::Next(record) => record.hash,
            other => panic!("expected a record, got {:?}", other),
        }
    }

    #[test]
    fn test_walk_in_order() {
        let (resolver, _temp) = setup();
        let account = AccountAddress::new(ACC_A);

        let first = next_hash(resolver.next(&account, None).unwrap());
        assert_eq!(first, hash(1));
        let second = next_hash(resolver.next(&account, Some(&first)).unwrap());
        assert_eq!(second, hash(2));
        let third = next_hash(resolver.next(&account, Some(&second)).unwrap());
        assert_eq!(third, hash(3));
        assert_eq!(resolver.next(&account, Some(&third)).unwrap(), Notification::NoneYet);
    }

    #[test]
    fn test_cursor_is_idempotent() {
        let (resolver, _temp) = setup();
        let account = AccountAddress::new(ACC_A);

        let a = resolver.next(&account, Some(&hash(1))).unwrap();
        let b = resolver.next(&account, Some(&hash(1))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_account_and_unknown_cursor() {
        let (resolver, _temp) = setup();
        let empty = AccountAddress::new(ACC_B);

        assert_eq!(resolver.next(&empty, None).unwrap(), Notification::None);
        assert!(matches!(
            resolver.next(&empty, Some(&hash(1))),
            Err(Error::UnknownCursor { .. })
        ));
        assert!(matches!(
            resolver.next(&AccountAddress::new(ACC_A), Some(&hash(99))),
            Err(Error::UnknownCursor { .. })
        ));
    }

    #[test]
    fn test_transaction_lookup() {
        let (resolver, _temp) = setup();
        let account = AccountAddress::new(ACC_A);

        let record = resolver.transaction(&account, &hash(3)).unwrap();
        assert_eq!(record.ordering_key(), (12, 1));
        assert!(matches!(
            resolver.transaction(&account, &hash(42)),
            Err(Error::NotFound(_))
        ));
    }
}
