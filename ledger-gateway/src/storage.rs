//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `pending` - Pending transactions not yet archived (key: account | identifier)
//! - `open` - Index of Submitted/Missing transactions (key: account | identifier)
//! - `archive` - Acknowledged terminal transactions (key: account | identifier)
//! - `records` - Append-only account history (key: account | ledger_index | tx_index)
//! - `record_hashes` - Cursor index (key: account | hash, value: ledger_index | tx_index)
//! - `meta` - Gateway bookkeeping (last ingested ledger)
//!
//! Integers in keys are big-endian so that RocksDB's byte order is the
//! `(ledger_index, transaction_index)` order.

use crate::{
    error::{Error, Result},
    types::{AccountAddress, ClosedLedger, LedgerTransactionRecord, PendingTransaction, TxHash},
    Config,
};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

/// Column family names
const CF_PENDING: &str = "pending";
const CF_OPEN: &str = "open";
const CF_ARCHIVE: &str = "archive";
const CF_RECORDS: &str = "records";
const CF_RECORD_HASHES: &str = "record_hashes";
const CF_META: &str = "meta";

const META_LAST_LEDGER: &[u8] = b"last_ledger_index";

/// Separator between the account and the rest of a key
const KEY_SEPARATOR: u8 = b'|';

/// Number of lock stripes for pending-transaction updates
const LOCK_STRIPES: usize = 64;

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    write_opts: WriteOptions,
    locks: KeyLocks,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("path", &self.db.path()).finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        // Database options
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_PENDING, Self::cf_options_pending()),
            ColumnFamilyDescriptor::new(CF_OPEN, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_ARCHIVE, Self::cf_options_archive()),
            ColumnFamilyDescriptor::new(CF_RECORDS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_RECORD_HASHES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(config.rocksdb.sync_writes);

        tracing::info!(
            path = ?path,
            sync_writes = config.rocksdb.sync_writes,
            "Opened RocksDB"
        );

        Ok(Self {
            db,
            write_opts,
            locks: KeyLocks::new(LOCK_STRIPES),
        })
    }

    // Column family options

    fn cf_options_pending() -> Options {
        let mut opts = Options::default();
        // Small and hot, favour speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_archive() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Point lookups benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Serialize access to one pending transaction
    ///
    /// Guards read-modify-write sequences; never hold it across an `.await`.
    pub fn lock_pending(&self, account: &AccountAddress, identifier: &str) -> MutexGuard<'_, ()> {
        self.locks.lock(&Self::pending_key(account, identifier))
    }

    // Pending transaction operations

    /// Insert or update a pending transaction (keeps the open index in step)
    pub fn put_pending(&self, tx: &PendingTransaction) -> Result<()> {
        let key = Self::pending_key(&tx.account, &tx.identifier);
        let mut batch = WriteBatch::default();

        batch.put_cf(self.cf_handle(CF_PENDING)?, &key, bincode::serialize(tx)?);

        let cf_open = self.cf_handle(CF_OPEN)?;
        if tx.is_terminal() {
            batch.delete_cf(cf_open, &key);
        } else {
            batch.put_cf(cf_open, &key, []);
        }

        self.db.write_opt(batch, &self.write_opts)?;

        tracing::debug!(
            account = %tx.account,
            identifier = %tx.identifier,
            state = tx.state.label(),
            "Pending transaction stored"
        );

        Ok(())
    }

    /// Get a pending transaction, falling back to the archive
    pub fn get_pending(
        &self,
        account: &AccountAddress,
        identifier: &str,
    ) -> Result<Option<PendingTransaction>> {
        let key = Self::pending_key(account, identifier);

        for cf_name in [CF_PENDING, CF_ARCHIVE] {
            if let Some(value) = self.db.get_cf(self.cf_handle(cf_name)?, &key)? {
                return Ok(Some(bincode::deserialize(&value)?));
            }
        }

        Ok(None)
    }

    /// Non-archived transactions of an account, in identifier order
    pub fn account_pending(&self, account: &AccountAddress) -> Result<Vec<PendingTransaction>> {
        let cf = self.cf_handle(CF_PENDING)?;
        let prefix = Self::account_prefix(account);

        let mut transactions = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            transactions.push(bincode::deserialize(&value)?);
        }

        Ok(transactions)
    }

    /// All Submitted/Missing transactions, via the open index
    pub fn open_transactions(&self) -> Result<Vec<PendingTransaction>> {
        let cf_open = self.cf_handle(CF_OPEN)?;
        let cf_pending = self.cf_handle(CF_PENDING)?;

        let mut transactions = Vec::new();
        for item in self.db.iterator_cf(cf_open, IteratorMode::Start) {
            let (key, _) = item?;
            match self.db.get_cf(cf_pending, &key)? {
                Some(value) => transactions.push(bincode::deserialize(&value)?),
                None => tracing::warn!(
                    key = %String::from_utf8_lossy(&key),
                    "Open index entry without pending transaction"
                ),
            }
        }

        Ok(transactions)
    }

    /// Move a terminal transaction to the archive (atomic)
    pub fn archive_pending(&self, tx: &PendingTransaction) -> Result<()> {
        if !tx.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Transaction {} is not terminal",
                tx.identifier
            )));
        }

        let key = Self::pending_key(&tx.account, &tx.identifier);
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf_handle(CF_PENDING)?, &key);
        batch.delete_cf(self.cf_handle(CF_OPEN)?, &key);
        batch.put_cf(self.cf_handle(CF_ARCHIVE)?, &key, bincode::serialize(tx)?);

        self.db.write_opt(batch, &self.write_opts)?;

        tracing::debug!(
            account = %tx.account,
            identifier = %tx.identifier,
            "Pending transaction archived"
        );

        Ok(())
    }

    // Ledger record operations

    /// Append every record of a ledger plus the last-ledger marker (atomic)
    ///
    /// Returns the number of records written.
    pub fn append_ledger(&self, ledger: &ClosedLedger) -> Result<usize> {
        let cf_records = self.cf_handle(CF_RECORDS)?;
        let cf_hashes = self.cf_handle(CF_RECORD_HASHES)?;
        let mut batch = WriteBatch::default();
        let mut written = 0;

        for tx in &ledger.transactions {
            // Source account always sees its own transaction
            let accounts: BTreeSet<&AccountAddress> = tx
                .affected_accounts
                .iter()
                .chain(std::iter::once(&tx.account))
                .collect();

            for account in accounts {
                let record = LedgerTransactionRecord::from_ledger(account, ledger.ledger_index, tx);
                let ordering = Self::ordering_bytes(ledger.ledger_index, tx.transaction_index);

                batch.put_cf(
                    cf_records,
                    Self::record_key(account, ledger.ledger_index, tx.transaction_index),
                    bincode::serialize(&record)?,
                );
                batch.put_cf(cf_hashes, Self::record_hash_key(account, &tx.hash), ordering);
                written += 1;
            }
        }

        batch.put_cf(
            self.cf_handle(CF_META)?,
            META_LAST_LEDGER,
            ledger.ledger_index.to_be_bytes(),
        );

        self.db.write_opt(batch, &self.write_opts)?;

        tracing::debug!(
            ledger_index = ledger.ledger_index,
            transactions = ledger.transactions.len(),
            records = written,
            "Ledger ingested"
        );

        Ok(written)
    }

    /// Last ledger whose records were written
    pub fn last_ledger_index(&self) -> Result<Option<u64>> {
        let value = self.db.get_cf(self.cf_handle(CF_META)?, META_LAST_LEDGER)?;
        value
            .map(|bytes| {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Storage("Corrupt last ledger marker".to_string())
                })?;
                Ok(u64::from_be_bytes(raw))
            })
            .transpose()
    }

    /// Ordering key of a record, looked up by hash
    pub fn record_position(
        &self,
        account: &AccountAddress,
        hash: &TxHash,
    ) -> Result<Option<(u64, u32)>> {
        let value = self
            .db
            .get_cf(self.cf_handle(CF_RECORD_HASHES)?, Self::record_hash_key(account, hash))?;

        value
            .map(|bytes| Self::parse_ordering(&bytes))
            .transpose()
    }

    /// Record by hash
    pub fn get_record(
        &self,
        account: &AccountAddress,
        hash: &TxHash,
    ) -> Result<Option<LedgerTransactionRecord>> {
        let Some((ledger_index, transaction_index)) = self.record_position(account, hash)? else {
            return Ok(None);
        };

        let value = self.db.get_cf(
            self.cf_handle(CF_RECORDS)?,
            Self::record_key(account, ledger_index, transaction_index),
        )?;

        value
            .map(|bytes| bincode::deserialize(&bytes).map_err(Error::from))
            .transpose()
    }

    /// Earliest record of an account
    pub fn first_record(&self, account: &AccountAddress) -> Result<Option<LedgerTransactionRecord>> {
        self.scan_records_from(account, &Self::account_prefix(account), None)
    }

    /// First record strictly after `position` for an account
    pub fn record_after(
        &self,
        account: &AccountAddress,
        position: (u64, u32),
    ) -> Result<Option<LedgerTransactionRecord>> {
        let start = Self::record_key(account, position.0, position.1);
        self.scan_records_from(account, &start, Some(&start))
    }

    /// All records of an account in order
    pub fn account_records(&self, account: &AccountAddress) -> Result<Vec<LedgerTransactionRecord>> {
        let cf = self.cf_handle(CF_RECORDS)?;
        let prefix = Self::account_prefix(account);

        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(bincode::deserialize(&value)?);
        }

        Ok(records)
    }

    fn scan_records_from(
        &self,
        account: &AccountAddress,
        start: &[u8],
        exclude: Option<&[u8]>,
    ) -> Result<Option<LedgerTransactionRecord>> {
        let cf = self.cf_handle(CF_RECORDS)?;
        let prefix = Self::account_prefix(account);

        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if exclude == Some(&key[..]) {
                continue;
            }
            return Ok(Some(bincode::deserialize(&value)?));
        }

        Ok(None)
    }

    // Key helpers

    fn account_prefix(account: &AccountAddress) -> Vec<u8> {
        let mut key = account.as_str().as_bytes().to_vec();
        key.push(KEY_SEPARATOR);
        key
    }

    fn pending_key(account: &AccountAddress, identifier: &str) -> Vec<u8> {
        let mut key = Self::account_prefix(account);
        key.extend_from_slice(identifier.as_bytes());
        key
    }

    fn record_key(account: &AccountAddress, ledger_index: u64, transaction_index: u32) -> Vec<u8> {
        let mut key = Self::account_prefix(account);
        key.extend_from_slice(&Self::ordering_bytes(ledger_index, transaction_index));
        key
    }

    fn record_hash_key(account: &AccountAddress, hash: &TxHash) -> Vec<u8> {
        let mut key = Self::account_prefix(account);
        key.extend_from_slice(hash.as_str().as_bytes());
        key
    }

    fn ordering_bytes(ledger_index: u64, transaction_index: u32) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&ledger_index.to_be_bytes());
        bytes[8..].copy_from_slice(&transaction_index.to_be_bytes());
        bytes
    }

    fn parse_ordering(bytes: &[u8]) -> Result<(u64, u32)> {
        if bytes.len() != 12 {
            return Err(Error::Storage(format!(
                "Corrupt record position ({} bytes)",
                bytes.len()
            )));
        }
        let mut ledger = [0u8; 8];
        let mut index = [0u8; 4];
        ledger.copy_from_slice(&bytes[..8]);
        index.copy_from_slice(&bytes[8..]);
        Ok((u64::from_be_bytes(ledger), u32::from_be_bytes(index)))
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Striped mutexes keyed by record key
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[stripe].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LedgerTransaction, SignedBlob, TransactionState};
    use tempfile::TempDir;

    const ACC_A: &str = "rHb9CJAWyB4rj91VRWn96DkukG4bwdtyTh";
    const ACC_B: &str = "rPEPPER7kfTD9w2To4CQk6UCfuHM9c6GDY";

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Storage::open(&config).unwrap(), temp_dir)
    }

    fn hash(n: u8) -> TxHash {
        TxHash::from_bytes(&[n; 32])
    }

    fn pending(identifier: &str, sequence: u32) -> PendingTransaction {
        PendingTransaction::new(
            AccountAddress::new(ACC_A),
            identifier.to_string(),
            sequence,
            hash(sequence as u8),
            SignedBlob::from_bytes(vec![sequence as u8; 16]),
        )
    }

    fn tx(n: u8, index: u32, source: &str, affected: &[&str]) -> LedgerTransaction {
        LedgerTransaction {
            hash: hash(n),
            transaction_index: index,
            account: AccountAddress::new(source),
            sequence: n as u32,
            transaction_type: "Payment".to_string(),
            result: "tesSUCCESS".to_string(),
            affected_accounts: affected.iter().map(|a| AccountAddress::new(*a)).collect(),
        }
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        assert!(storage.db.cf_handle(CF_PENDING).is_some());
        assert!(storage.db.cf_handle(CF_RECORDS).is_some());
        assert_eq!(storage.last_ledger_index().unwrap(), None);
    }

    #[test]
    fn test_pending_roundtrip_and_open_index() {
        let (storage, _temp) = test_storage();
        let mut tx = pending("id1", 5);

        storage.put_pending(&tx).unwrap();
        assert_eq!(storage.open_transactions().unwrap().len(), 1);

        tx.transition(TransactionState::Validated);
        storage.put_pending(&tx).unwrap();
        assert!(storage.open_transactions().unwrap().is_empty());

        let stored = storage
            .get_pending(&AccountAddress::new(ACC_A), "id1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, TransactionState::Validated);
        assert_eq!(stored.sequence, 5);
    }

    #[test]
    fn test_archive_requires_terminal() {
        let (storage, _temp) = test_storage();
        let mut tx = pending("id1", 5);
        storage.put_pending(&tx).unwrap();

        assert!(matches!(
            storage.archive_pending(&tx),
            Err(Error::InvalidState(_))
        ));

        tx.transition(TransactionState::Validated);
        storage.put_pending(&tx).unwrap();
        storage.archive_pending(&tx).unwrap();

        let account = AccountAddress::new(ACC_A);
        assert!(storage.account_pending(&account).unwrap().is_empty());
        // Still visible through the archive
        assert!(storage.get_pending(&account, "id1").unwrap().is_some());
    }

    #[test]
    fn test_account_pending_prefix_isolation() {
        let (storage, _temp) = test_storage();
        storage.put_pending(&pending("id1", 1)).unwrap();

        let mut other = pending("id1", 2);
        other.account = AccountAddress::new(ACC_B);
        storage.put_pending(&other).unwrap();

        let mine = storage.account_pending(&AccountAddress::new(ACC_A)).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].sequence, 1);
    }

    #[test]
    fn test_append_ledger_orders_records() {
        let (storage, _temp) = test_storage();
        let account = AccountAddress::new(ACC_A);

        storage
            .append_ledger(&ClosedLedger {
                ledger_index: 101,
                ledger_hash: None,
                transactions: vec![tx(3, 0, ACC_B, &[ACC_A, ACC_B])],
            })
            .unwrap();
        let written = storage
            .append_ledger(&ClosedLedger {
                ledger_index: 100,
                ledger_hash: None,
                transactions: vec![tx(1, 0, ACC_A, &[]), tx(2, 7, ACC_A, &[ACC_B])],
            })
            .unwrap();
        // tx 1 -> A ; tx 2 -> A, B
        assert_eq!(written, 3);

        let records = storage.account_records(&account).unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.ordering_key()).collect();
        assert_eq!(keys, vec![(100, 0), (100, 7), (101, 0)]);

        let first = storage.first_record(&account).unwrap().unwrap();
        assert_eq!(first.hash, hash(1));

        let next = storage.record_after(&account, (100, 0)).unwrap().unwrap();
        assert_eq!(next.hash, hash(2));
        assert!(storage.record_after(&account, (101, 0)).unwrap().is_none());

        assert_eq!(storage.last_ledger_index().unwrap(), Some(100));
    }

    #[test]
    fn test_record_lookup_by_hash() {
        let (storage, _temp) = test_storage();
        storage
            .append_ledger(&ClosedLedger {
                ledger_index: 7,
                ledger_hash: None,
                transactions: vec![tx(9, 2, ACC_A, &[ACC_B])],
            })
            .unwrap();

        let b = AccountAddress::new(ACC_B);
        let record = storage.get_record(&b, &hash(9)).unwrap().unwrap();
        assert_eq!(record.ordering_key(), (7, 2));
        assert_eq!(record.source_account.as_str(), ACC_A);
        assert_eq!(storage.record_position(&b, &hash(9)).unwrap(), Some((7, 2)));
        assert!(storage.get_record(&b, &hash(1)).unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        {
            let storage = Storage::open(&config).unwrap();
            storage.put_pending(&pending("id1", 5)).unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.open_transactions().unwrap().len(), 1);
    }
}
