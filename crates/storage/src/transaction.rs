use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use txn::{ConcurrencyMgr, LockManager, TxnId};
use wal::{LogManager, RecoveryMgr};

use crate::buffer::BufferPool;
use crate::buffer_mgr::BufferMgr;
use crate::StorageResult;

/// Transaction context: carries the transaction id, the read-only flag, and
/// the three per-transaction managers the storage engine works through.
///
/// Commit and rollback drive the managers in a fixed order: the recovery
/// manager makes the outcome durable, the concurrency manager releases every
/// lock, and the buffer manager unpins whatever is still pinned.
pub struct Transaction {
    txn_id: TxnId,
    readonly: bool,
    buffer_mgr: BufferMgr,
    concurrency_mgr: ConcurrencyMgr,
    recovery_mgr: RecoveryMgr,
}

impl Transaction {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn buffer_mgr(&self) -> &BufferMgr {
        &self.buffer_mgr
    }

    pub fn concurrency_mgr(&self) -> &ConcurrencyMgr {
        &self.concurrency_mgr
    }

    pub fn recovery_mgr(&self) -> &RecoveryMgr {
        &self.recovery_mgr
    }

    pub fn commit(&self) -> StorageResult<()> {
        self.buffer_mgr.flush_all()?;
        self.recovery_mgr.on_tx_commit()?;
        self.concurrency_mgr.on_tx_commit();
        self.buffer_mgr.on_tx_commit();
        Ok(())
    }

    pub fn rollback(&self) -> StorageResult<()> {
        self.buffer_mgr.flush_all()?;
        self.recovery_mgr.on_tx_rollback()?;
        self.concurrency_mgr.on_tx_rollback();
        self.buffer_mgr.on_tx_rollback();
        Ok(())
    }

    pub fn end_statement(&self) {
        self.buffer_mgr.on_end_statement();
    }
}

/// Hands out transactions with monotonically increasing ids, wiring each to
/// the shared buffer pool, lock table, and log.
pub struct TransactionManager {
    pool: Arc<BufferPool>,
    lock_mgr: Arc<LockManager>,
    log_mgr: Arc<LogManager>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    pub fn new(
        pool: Arc<BufferPool>,
        lock_mgr: Arc<LockManager>,
        log_mgr: Arc<LogManager>,
    ) -> Self {
        Self {
            pool,
            lock_mgr,
            log_mgr,
            next_txn_id: AtomicU64::new(1),
        }
    }

    pub fn begin(&self) -> StorageResult<Transaction> {
        self.begin_with(false)
    }

    pub fn begin_readonly(&self) -> StorageResult<Transaction> {
        self.begin_with(true)
    }

    fn begin_with(&self, readonly: bool) -> StorageResult<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let recovery_mgr = RecoveryMgr::new(Arc::clone(&self.log_mgr), txn_id)?;
        Ok(Transaction {
            txn_id,
            readonly,
            buffer_mgr: BufferMgr::new(Arc::clone(&self.pool), txn_id),
            concurrency_mgr: ConcurrencyMgr::new(txn_id, Arc::clone(&self.lock_mgr)),
            recovery_mgr,
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn lock_mgr(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    pub fn log_mgr(&self) -> &Arc<LogManager> {
        &self.log_mgr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, PageFormatter};
    use crate::file::FileManager;
    use crate::page::Page;
    use std::time::Duration;
    use txn::{DeadlockPolicy, LockKey};
    use wal::{LogReader, LogRecord};

    struct Zeroes;

    impl PageFormatter for Zeroes {
        fn format(&self, _page: &mut Page) {}
    }

    fn setup(pool_size: usize) -> (tempfile::TempDir, TransactionManager, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("db.wal");
        let file_mgr = Arc::new(FileManager::new(dir.path()).unwrap());
        let log_mgr = Arc::new(LogManager::open(&wal_path).unwrap());
        let pool = Arc::new(BufferPool::new(
            file_mgr,
            Some(Arc::clone(&log_mgr)),
            BufferConfig {
                pool_size,
                max_time: Duration::from_millis(200),
                epsilon: Duration::from_millis(5),
            },
        ));
        let lock_mgr = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
            Duration::from_millis(200),
        )));
        let txn_mgr = TransactionManager::new(pool, lock_mgr, log_mgr);
        (dir, txn_mgr, wal_path)
    }

    #[test]
    fn commit_unpins_everything_and_clears_modifying_tx() {
        let (_dir, txn_mgr, _) = setup(4);
        let tx = txn_mgr.begin().unwrap();
        let buffer = tx.buffer_mgr().pin_new("t.tbl", &Zeroes).unwrap();
        buffer.set_i32(0, 17, tx.txn_id(), None);
        let blk = buffer.block().unwrap();
        // Extra local pin on the same block.
        tx.buffer_mgr().pin(&blk).unwrap();

        tx.commit().unwrap();
        assert_eq!(tx.buffer_mgr().pinned_count(), 0);
        assert_eq!(txn_mgr.pool().available(), 4);
        assert_eq!(buffer.modifying_tx(), None);
        assert!(!buffer.is_dirty());
    }

    #[test]
    fn commit_releases_locks_and_writes_the_commit_record() {
        let (_dir, txn_mgr, wal_path) = setup(4);
        let tx = txn_mgr.begin().unwrap();
        let txn_id = tx.txn_id();
        tx.concurrency_mgr()
            .modify_leaf_block(LockKey::Block {
                file: "i_leaf.idx".to_string(),
                num: 0,
            })
            .unwrap();
        tx.commit().unwrap();

        assert!(txn_mgr.lock_mgr().held_keys_for(txn_id).is_empty());
        let mut reader = LogReader::open(&wal_path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(
            records,
            vec![
                LogRecord::Start { txn_id },
                LogRecord::Commit { txn_id },
            ]
        );
    }

    #[test]
    fn rollback_also_cleans_up() {
        let (_dir, txn_mgr, wal_path) = setup(4);
        let tx = txn_mgr.begin().unwrap();
        let txn_id = tx.txn_id();
        tx.buffer_mgr().pin_new("t.tbl", &Zeroes).unwrap();
        tx.rollback().unwrap();

        assert_eq!(tx.buffer_mgr().pinned_count(), 0);
        assert_eq!(txn_mgr.pool().available(), 4);

        let mut reader = LogReader::open(&wal_path).unwrap();
        let mut last = None;
        while let Some(record) = reader.next_record().unwrap() {
            last = Some(record);
        }
        assert_eq!(last, Some(LogRecord::Rollback { txn_id }));
    }

    #[test]
    fn transaction_ids_increase() {
        let (_dir, txn_mgr, _) = setup(2);
        let a = txn_mgr.begin().unwrap();
        let b = txn_mgr.begin_readonly().unwrap();
        assert!(b.txn_id() > a.txn_id());
        assert!(b.is_readonly());
        assert!(!a.is_readonly());
    }
}
