use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

mod concurrency;

pub use concurrency::ConcurrencyMgr;

/// Transaction identifier handed out by the transaction manager.
pub type TxnId = u64;

/// Granularity of a lock: a whole file or one block within a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    File(String),
    Block { file: String, num: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// How the lock manager resolves deadlocks. Waiting past the timeout aborts
/// the waiter; there is no cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock-abort signal: the transaction waited past the deadlock
    /// timeout and must roll back.
    #[error("lock abort: wait timed out")]
    DeadlockTimeout,
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    mode: Option<LockMode>,
    holders: HashSet<TxnId>,
    waiters: VecDeque<LockRequest>,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<LockKey, LockState>,
    held_keys: HashMap<TxnId, HashSet<LockKey>>,
}

/// Shared/exclusive lock table for files and blocks.
///
/// Waiters queue in FIFO order and each woken thread re-checks whether its
/// request is grantable; only the queue head may jump ahead of other waiters.
pub struct LockManager {
    table: Mutex<LockTable>,
    condvar: Condvar,
    policy: DeadlockPolicy,
}

impl LockManager {
    pub fn new(policy: DeadlockPolicy) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            condvar: Condvar::new(),
            policy,
        }
    }

    pub fn lock_shared(&self, txn_id: TxnId, key: LockKey) -> LockResult<()> {
        self.lock(txn_id, key, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, txn_id: TxnId, key: LockKey) -> LockResult<()> {
        self.lock(txn_id, key, LockMode::Exclusive)
    }

    /// Releases a single lock held by `txn_id` and wakes waiters.
    pub fn unlock(&self, txn_id: TxnId, key: &LockKey) {
        let mut table = self.table.lock();
        if let Some(lock_state) = table.locks.get_mut(key) {
            lock_state.holders.remove(&txn_id);
            if lock_state.holders.is_empty() {
                lock_state.mode = None;
            }
        }
        if let Some(keys) = table.held_keys.get_mut(&txn_id) {
            keys.remove(key);
        }
        self.condvar.notify_all();
    }

    /// Releases every lock held by `txn_id` and wakes waiters.
    pub fn unlock_all(&self, txn_id: TxnId) {
        let mut table = self.table.lock();
        let Some(keys) = table.held_keys.remove(&txn_id) else {
            return;
        };
        for key in keys {
            if let Some(lock_state) = table.locks.get_mut(&key) {
                lock_state.holders.remove(&txn_id);
                if lock_state.holders.is_empty() {
                    lock_state.mode = None;
                }
            }
        }
        self.condvar.notify_all();
    }

    pub fn held_keys_for(&self, txn_id: TxnId) -> Vec<LockKey> {
        let table = self.table.lock();
        table
            .held_keys
            .get(&txn_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self, txn_id: TxnId, key: LockKey, mode: LockMode) -> LockResult<()> {
        let mut table = self.table.lock();
        if Self::holds(&table, txn_id, &key, mode) {
            return Ok(());
        }
        let deadline = self.deadline();
        let mut enqueued = false;
        loop {
            let lock_state = table.locks.entry(key.clone()).or_default();
            let head_is_self = lock_state
                .waiters
                .front()
                .map_or(false, |request| request.txn_id == txn_id);
            if Self::can_grant(lock_state, txn_id, mode)
                && (lock_state.waiters.is_empty() || head_is_self)
            {
                if head_is_self {
                    lock_state.waiters.pop_front();
                }
                lock_state.mode = Some(mode);
                lock_state.holders.insert(txn_id);
                table.held_keys.entry(txn_id).or_default().insert(key);
                if enqueued {
                    // Another compatible waiter may now be at the head.
                    self.condvar.notify_all();
                }
                return Ok(());
            }
            if !enqueued {
                lock_state.waiters.push_back(LockRequest { txn_id, mode });
                enqueued = true;
            }
            if let Err(error) = self.wait_for_grant(&mut table, deadline) {
                if let Some(lock_state) = table.locks.get_mut(&key) {
                    lock_state
                        .waiters
                        .retain(|request| request.txn_id != txn_id);
                }
                self.condvar.notify_all();
                return Err(error);
            }
        }
    }

    fn wait_for_grant(
        &self,
        table: &mut MutexGuard<'_, LockTable>,
        deadline: Option<Instant>,
    ) -> LockResult<()> {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::DeadlockTimeout);
                }
                let timeout = self
                    .condvar
                    .wait_for(table, deadline.saturating_duration_since(now));
                if timeout.timed_out() {
                    return Err(LockError::DeadlockTimeout);
                }
                Ok(())
            }
            None => {
                self.condvar.wait(table);
                Ok(())
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.policy {
            DeadlockPolicy::Timeout(duration) => Some(Instant::now() + duration),
        }
    }

    fn can_grant(lock_state: &LockState, txn_id: TxnId, mode: LockMode) -> bool {
        match lock_state.mode {
            None => true,
            Some(LockMode::Shared) => {
                mode == LockMode::Shared
                    || (lock_state.holders.len() == 1 && lock_state.holders.contains(&txn_id))
            }
            Some(LockMode::Exclusive) => lock_state.holders.contains(&txn_id),
        }
    }

    fn holds(table: &LockTable, txn_id: TxnId, key: &LockKey, mode: LockMode) -> bool {
        let Some(lock_state) = table.locks.get(key) else {
            return false;
        };
        if !lock_state.holders.contains(&txn_id) {
            return false;
        }
        matches!(
            (lock_state.mode, mode),
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn manager() -> LockManager {
        LockManager::new(DeadlockPolicy::Timeout(Duration::from_millis(200)))
    }

    fn block(num: u64) -> LockKey {
        LockKey::Block {
            file: "t.tbl".to_string(),
            num,
        }
    }

    #[test]
    fn shared_shared_is_compatible() {
        let manager = manager();
        let key = block(42);
        assert!(manager.lock_shared(1, key.clone()).is_ok());
        assert!(manager.lock_shared(2, key.clone()).is_ok());
        assert_eq!(manager.held_keys_for(1), vec![key]);
    }

    #[test]
    fn exclusive_blocks_shared_until_released() {
        let manager = Arc::new(manager());
        let key = block(1);
        manager.lock_exclusive(1, key.clone()).unwrap();
        let handle = thread::spawn({
            let manager = Arc::clone(&manager);
            move || manager.lock_shared(2, key)
        });
        thread::sleep(Duration::from_millis(50));
        manager.unlock_all(1);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn shared_blocks_exclusive_timeout() {
        let manager = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
            Duration::from_millis(50),
        )));
        let key = block(9);
        manager.lock_shared(1, key.clone()).unwrap();
        let handle = thread::spawn({
            let manager = Arc::clone(&manager);
            move || manager.lock_exclusive(2, key)
        });
        assert_eq!(handle.join().unwrap(), Err(LockError::DeadlockTimeout));
    }

    #[test]
    fn upgrade_shared_to_exclusive_when_sole_holder() {
        let manager = manager();
        let key = block(11);
        manager.lock_shared(1, key.clone()).unwrap();
        manager.lock_exclusive(1, key.clone()).unwrap();
        assert_eq!(manager.held_keys_for(1), vec![key]);
    }

    #[test]
    fn relock_held_key_is_idempotent() {
        let manager = manager();
        let key = block(3);
        manager.lock_exclusive(1, key.clone()).unwrap();
        manager.lock_exclusive(1, key.clone()).unwrap();
        manager.lock_shared(1, key.clone()).unwrap();
        manager.unlock(1, &key);
        assert!(manager.held_keys_for(1).is_empty());
        // Now free for others.
        assert!(manager.lock_exclusive(2, key).is_ok());
    }

    #[test]
    fn unlock_single_key_wakes_waiter() {
        let manager = Arc::new(manager());
        let key = block(7);
        manager.lock_exclusive(1, key.clone()).unwrap();
        let handle = thread::spawn({
            let manager = Arc::clone(&manager);
            let key = key.clone();
            move || manager.lock_exclusive(2, key)
        });
        thread::sleep(Duration::from_millis(50));
        manager.unlock(1, &key);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn unlock_all_releases_every_key() {
        let manager = manager();
        let keys = vec![block(1), block(2), LockKey::File("t.tbl".to_string())];
        for key in &keys {
            manager.lock_exclusive(1, key.clone()).unwrap();
        }
        manager.unlock_all(1);
        assert!(manager.held_keys_for(1).is_empty());
    }

    #[test]
    fn timed_out_waiter_does_not_wedge_the_queue() {
        let manager = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
            Duration::from_millis(50),
        )));
        let key = block(5);
        manager.lock_shared(1, key.clone()).unwrap();
        // Tx 2 waits for exclusive and times out, leaving tx 1's shared lock.
        let handle = thread::spawn({
            let manager = Arc::clone(&manager);
            let key = key.clone();
            move || manager.lock_exclusive(2, key)
        });
        assert!(handle.join().unwrap().is_err());
        // Tx 3 must still be able to take a compatible shared lock.
        assert!(manager.lock_shared(3, key).is_ok());
    }
}
