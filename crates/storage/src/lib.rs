// MODULE DECLARATIONS
// These files exist internally but we decide what to expose below.
mod buffer;
mod buffer_mgr;
mod file;
mod page;
mod replacer;
mod transaction;

// PUBLIC API EXPORTS
pub use buffer::{Buffer, BufferConfig, BufferPool, PageFormatter};
pub use buffer_mgr::BufferMgr;
pub use file::FileManager;
pub use page::{Page, BLOCK_SIZE};
pub use replacer::{FrameId, LruReplacer, Replacer};
pub use transaction::{Transaction, TransactionManager};

use std::fmt;

use thiserror::Error;
use txn::LockKey;

pub use txn::TxnId;
pub use wal::Lsn;

/// Errors surfaced by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The transaction's own pin set would exhaust the buffer pool, or the
    /// wait for a free frame was interrupted.
    #[error("buffer abort: transaction pinned too many buffers")]
    BufferAbort,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wal(#[from] wal::WalError),
    #[error(transparent)]
    Lock(#[from] txn::LockError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Identifies one fixed-size block of a named file: the unit of disk I/O
/// and of block-level locking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    file_name: String,
    num: u64,
}

impl BlockId {
    pub fn new(file_name: impl Into<String>, num: u64) -> Self {
        Self {
            file_name: file_name.into(),
            num,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn number(&self) -> u64 {
        self.num
    }

    /// The key under which this block is locked.
    pub fn lock_key(&self) -> LockKey {
        LockKey::Block {
            file: self.file_name.clone(),
            num: self.num,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file_name, self.num)
    }
}

/// Identifies a row in a data file by block and slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rid {
    pub blk: BlockId,
    pub slot: u32,
}

impl Rid {
    pub fn new(blk: BlockId, slot: u32) -> Self {
        Self { blk, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} slot {}", self.blk, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_are_value_typed() {
        let a = BlockId::new("emp.tbl", 3);
        let b = BlockId::new("emp.tbl", 3);
        let c = BlockId::new("emp.tbl", 4);
        assert_eq!(a, b);
        assert!(a < c);
        assert_ne!(a, BlockId::new("dept.tbl", 3));
    }

    #[test]
    fn rids_order_by_block_then_slot() {
        let a = Rid::new(BlockId::new("emp.tbl", 1), 9);
        let b = Rid::new(BlockId::new("emp.tbl", 2), 0);
        assert!(a < b);
    }
}
