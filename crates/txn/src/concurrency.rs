use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{LockKey, LockManager, LockResult, TxnId};

/// Per-transaction façade over the shared lock table.
///
/// Index operations acquire file and block locks through this object. Block
/// locks taken while walking the B-tree are remembered so that
/// `release_index_locks` can drop exactly the structural locks when the index
/// cursor closes, without touching locks the transaction holds on data.
pub struct ConcurrencyMgr {
    txn_id: TxnId,
    lock_mgr: Arc<LockManager>,
    index_locks: Mutex<HashSet<LockKey>>,
}

impl ConcurrencyMgr {
    pub fn new(txn_id: TxnId, lock_mgr: Arc<LockManager>) -> Self {
        Self {
            txn_id,
            lock_mgr,
            index_locks: Mutex::new(HashSet::new()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Shared lock on a whole file, taken before measuring its length.
    pub fn read_file(&self, file_name: &str) -> LockResult<()> {
        let key = LockKey::File(file_name.to_string());
        self.lock_mgr.lock_shared(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    /// Exclusive lock on a whole file, taken before appending a block.
    pub fn modify_file(&self, file_name: &str) -> LockResult<()> {
        let key = LockKey::File(file_name.to_string());
        self.lock_mgr.lock_exclusive(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    /// Shared lock on a directory block while crabbing down for a read.
    pub fn crab_down_dir_for_read(&self, key: LockKey) -> LockResult<()> {
        self.lock_mgr.lock_shared(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    /// Exclusive lock on a directory block while crabbing down for an
    /// insertion; retained so a leaf split may update the ancestor path.
    pub fn crab_down_dir_for_modification(&self, key: LockKey) -> LockResult<()> {
        self.lock_mgr.lock_exclusive(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    /// Releases the shared lock on a parent directory block once its child
    /// is latched (lock-coupling).
    pub fn crab_back_dir_for_read(&self, key: &LockKey) {
        self.lock_mgr.unlock(self.txn_id, key);
        self.index_locks.lock().remove(key);
    }

    pub fn read_leaf_block(&self, key: LockKey) -> LockResult<()> {
        self.lock_mgr.lock_shared(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    pub fn modify_leaf_block(&self, key: LockKey) -> LockResult<()> {
        self.lock_mgr.lock_exclusive(self.txn_id, key.clone())?;
        self.remember(key);
        Ok(())
    }

    /// Drops every lock acquired on the index structure by this transaction.
    pub fn release_index_locks(&self) {
        let keys: Vec<LockKey> = self.index_locks.lock().drain().collect();
        for key in keys {
            self.lock_mgr.unlock(self.txn_id, &key);
        }
    }

    pub fn on_tx_commit(&self) {
        self.index_locks.lock().clear();
        self.lock_mgr.unlock_all(self.txn_id);
    }

    pub fn on_tx_rollback(&self) {
        self.index_locks.lock().clear();
        self.lock_mgr.unlock_all(self.txn_id);
    }

    fn remember(&self, key: LockKey) {
        self.index_locks.lock().insert(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeadlockPolicy;
    use std::time::Duration;

    fn setup() -> (Arc<LockManager>, ConcurrencyMgr, ConcurrencyMgr) {
        let lock_mgr = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
            Duration::from_millis(50),
        )));
        let cc1 = ConcurrencyMgr::new(1, Arc::clone(&lock_mgr));
        let cc2 = ConcurrencyMgr::new(2, Arc::clone(&lock_mgr));
        (lock_mgr, cc1, cc2)
    }

    fn dir_block(num: u64) -> LockKey {
        LockKey::Block {
            file: "idx_dir.idx".to_string(),
            num,
        }
    }

    #[test]
    fn release_index_locks_frees_crabbed_blocks() {
        let (lock_mgr, cc1, cc2) = setup();
        cc1.crab_down_dir_for_modification(dir_block(0)).unwrap();
        cc1.modify_leaf_block(LockKey::Block {
            file: "idx_leaf.idx".to_string(),
            num: 0,
        })
        .unwrap();
        assert_eq!(lock_mgr.held_keys_for(1).len(), 2);

        cc1.release_index_locks();
        assert!(lock_mgr.held_keys_for(1).is_empty());
        assert!(cc2.crab_down_dir_for_modification(dir_block(0)).is_ok());
    }

    #[test]
    fn crab_back_releases_only_the_parent() {
        let (lock_mgr, cc1, _) = setup();
        cc1.crab_down_dir_for_read(dir_block(0)).unwrap();
        cc1.crab_down_dir_for_read(dir_block(1)).unwrap();
        cc1.crab_back_dir_for_read(&dir_block(0));
        assert_eq!(lock_mgr.held_keys_for(1), vec![dir_block(1)]);
    }

    #[test]
    fn readers_share_the_descent_path() {
        let (_, cc1, cc2) = setup();
        cc1.crab_down_dir_for_read(dir_block(0)).unwrap();
        assert!(cc2.crab_down_dir_for_read(dir_block(0)).is_ok());
    }

    #[test]
    fn writer_descent_excludes_readers() {
        let (_, cc1, cc2) = setup();
        cc1.crab_down_dir_for_modification(dir_block(0)).unwrap();
        assert!(cc2.crab_down_dir_for_read(dir_block(0)).is_err());
    }

    #[test]
    fn commit_releases_everything() {
        let (lock_mgr, cc1, _) = setup();
        cc1.read_file("idx_leaf.idx").unwrap();
        cc1.modify_leaf_block(LockKey::Block {
            file: "idx_leaf.idx".to_string(),
            num: 3,
        })
        .unwrap();
        cc1.on_tx_commit();
        assert!(lock_mgr.held_keys_for(1).is_empty());
    }
}
