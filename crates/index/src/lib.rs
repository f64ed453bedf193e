mod btree;

pub use btree::{BTreeIndex, DirEntry, IndexInfo, SearchPurpose};

use sql::{Constant, ConstantRange};
use storage::{Rid, StorageError};
use thiserror::Error;
use txn::LockError;
use wal::WalError;

#[derive(Debug, Error)]
pub enum IndexError {
    /// A write was attempted through a read-only transaction.
    #[error("unsupported operation: write on a read-only transaction")]
    ReadOnlyTransaction,
    #[error("cursor is not positioned on a record")]
    NoCurrentRecord,
    #[error("corrupted index page: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Type(#[from] sql::TypeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Cursor-style index capability used by query execution. `before_first`
/// positions the cursor at the lower bound of a range; `next` advances it
/// and `get_data_rid` reads the current match.
pub trait Index {
    fn before_first(&mut self, search_range: &ConstantRange) -> IndexResult<()>;
    fn next(&mut self) -> IndexResult<bool>;
    fn get_data_rid(&self) -> IndexResult<Rid>;
    fn insert(&mut self, key: Constant, data_rid: Rid, do_logical_logging: bool)
        -> IndexResult<()>;
    fn delete(&mut self, key: Constant, data_rid: Rid, do_logical_logging: bool)
        -> IndexResult<()>;
    fn close(&mut self);
    fn pre_load_to_memory(&mut self) -> IndexResult<()>;
}
