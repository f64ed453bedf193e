#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use storage::{BufferConfig, BufferPool, FileManager, TransactionManager};
use txn::{DeadlockPolicy, LockManager};
use wal::LogManager;

pub struct TestDb {
    pub txn_mgr: Arc<TransactionManager>,
    pub wal_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Builds the full stack over a temp directory: file manager, log, buffer
/// pool, and lock table. Timeouts are short enough to keep failing tests
/// fast but long enough for contended runs on slow machines.
pub fn test_db(pool_size: usize) -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("db.wal");
    let file_mgr = Arc::new(FileManager::new(dir.path()).unwrap());
    let log_mgr = Arc::new(LogManager::open(&wal_path).unwrap());
    let pool = Arc::new(BufferPool::new(
        file_mgr,
        Some(Arc::clone(&log_mgr)),
        BufferConfig {
            pool_size,
            max_time: Duration::from_millis(500),
            epsilon: Duration::from_millis(5),
        },
    ));
    let lock_mgr = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
        Duration::from_secs(5),
    )));
    TestDb {
        txn_mgr: Arc::new(TransactionManager::new(pool, lock_mgr, log_mgr)),
        wal_path,
        _dir: dir,
    }
}
