mod dir;
mod leaf;
mod page;

use sql::{Constant, ConstantRange, ConstantType};
use storage::{BlockId, Rid, StorageError, Transaction, BLOCK_SIZE};

use crate::{Index, IndexError, IndexResult};
use dir::BTreeDir;
use leaf::BTreeLeaf;
use page::{dir_slot_size, leaf_slot_size, BTreePageFormatter};

/// Names the index and the table column it covers.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub index_name: String,
    pub table_name: String,
    pub field_name: String,
}

impl IndexInfo {
    pub fn new(
        index_name: impl Into<String>,
        table_name: impl Into<String>,
        field_name: impl Into<String>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            table_name: table_name.into(),
            field_name: field_name.into(),
        }
    }
}

/// A `(key, child block)` pair handed up when a node splits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    key: Constant,
    block_num: u64,
}

impl DirEntry {
    pub fn new(key: Constant, block_num: u64) -> Self {
        Self { key, block_num }
    }

    pub fn key(&self) -> &Constant {
        &self.key
    }

    pub fn block_number(&self) -> u64 {
        self.block_num
    }
}

/// What a directory descent is for; determines the crabbing lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPurpose {
    Read,
    Insert,
    Delete,
}

/// B-tree implementation of [`Index`].
///
/// The tree lives in two files: `<name>_leaf.idx` for the leaves and
/// `<name>_dir.idx` for the directory. The root is always block 0 of the
/// directory file; root splits preserve that identity by redirection.
pub struct BTreeIndex<'a> {
    tx: &'a Transaction,
    info: IndexInfo,
    key_type: ConstantType,
    leaf_file_name: String,
    dir_file_name: String,
    data_file_name: String,
    root_blk: BlockId,
    leaf: Option<BTreeLeaf<'a>>,
    dirs_may_be_updated: Vec<BlockId>,
}

impl<'a> BTreeIndex<'a> {
    /// Opens the index, creating and seeding its files on first use: one
    /// empty leaf, and a root whose single entry routes every key to it.
    pub fn new(info: IndexInfo, key_type: ConstantType, tx: &'a Transaction) -> IndexResult<Self> {
        let leaf_file_name = BTreeLeaf::file_name(&info.index_name);
        let dir_file_name = BTreeDir::file_name(&info.index_name);
        let data_file_name = format!("{}.tbl", info.table_name);

        if file_size(tx, &leaf_file_name)? == 0 {
            append_block(tx, &leaf_file_name, vec![-1, -1])?;
        }

        let root_blk = BlockId::new(dir_file_name.clone(), 0);
        if file_size(tx, &dir_file_name)? == 0 {
            append_block(tx, &dir_file_name, vec![0])?;
        }
        let mut root = BTreeDir::new(tx, root_blk.clone(), key_type)?;
        if root.num_records() == 0 {
            root.insert(DirEntry::new(key_type.min_value(), 0))?;
        }
        drop(root);

        Ok(Self {
            tx,
            info,
            key_type,
            leaf_file_name,
            dir_file_name,
            data_file_name,
            root_blk,
            leaf: None,
            dirs_may_be_updated: Vec::new(),
        })
    }

    /// Estimated block accesses for a search: directory descent plus the
    /// matching leaf blocks.
    pub fn search_cost(key_type: ConstantType, total_records: u64, matching_records: u64) -> u64 {
        let dir_rpb = (BLOCK_SIZE / dir_slot_size(key_type)) as f64;
        let leaf_rpb = (BLOCK_SIZE / leaf_slot_size(key_type)) as f64;
        let leaves = (total_records as f64 / leaf_rpb).ceil();
        let matching_leaves = (matching_records as f64 / leaf_rpb).ceil() as u64;
        if leaves <= 1.0 {
            return matching_leaves;
        }
        (leaves.ln() / dir_rpb.ln()).ceil() as u64 + matching_leaves
    }

    /// Closes any prior cursor and descends to the leaf covering the
    /// range's lower bound. An insertion descent also records the ancestor
    /// directory path for split propagation.
    fn search(&mut self, search_range: &ConstantRange, purpose: SearchPurpose) -> IndexResult<()> {
        self.close();
        let mut root = BTreeDir::new(self.tx, self.root_blk.clone(), self.key_type)?;
        let search_key = match search_range.low() {
            Some(low) => low.clone(),
            None => self.key_type.min_value(),
        };
        let leaf_blk = root.search(&search_key, &self.leaf_file_name, purpose)?;
        if purpose == SearchPurpose::Insert {
            self.dirs_may_be_updated = root.take_dirs_may_be_updated();
        }
        drop(root);
        self.leaf = Some(BTreeLeaf::new(
            self.tx,
            self.data_file_name.clone(),
            leaf_blk,
            self.key_type,
            search_range.clone(),
        )?);
        Ok(())
    }
}

impl Index for BTreeIndex<'_> {
    /// Positions the cursor before the first entry in `search_range`. An
    /// invalid range simply leaves the cursor empty.
    fn before_first(&mut self, search_range: &ConstantRange) -> IndexResult<()> {
        if !search_range.is_valid() {
            self.close();
            return Ok(());
        }
        self.search(search_range, SearchPurpose::Read)
    }

    fn next(&mut self) -> IndexResult<bool> {
        match self.leaf.as_mut() {
            Some(leaf) => leaf.next(),
            None => Ok(false),
        }
    }

    fn get_data_rid(&self) -> IndexResult<Rid> {
        match self.leaf.as_ref() {
            Some(leaf) => leaf.get_data_rid(),
            None => Err(IndexError::NoCurrentRecord),
        }
    }

    /// Inserts `(key, data_rid)`. A leaf split hands its directory entry up
    /// the recorded ancestor path, deepest first, until a directory absorbs
    /// it; a root split grows the tree through `make_new_root`.
    fn insert(
        &mut self,
        key: Constant,
        data_rid: Rid,
        do_logical_logging: bool,
    ) -> IndexResult<()> {
        if self.tx.is_readonly() {
            return Err(IndexError::ReadOnlyTransaction);
        }
        self.search(&ConstantRange::exact(key.clone()), SearchPurpose::Insert)?;
        let new_entry = match self.leaf.as_mut() {
            Some(leaf) => leaf.insert(data_rid.clone())?,
            None => None,
        };
        self.leaf = None;
        let Some(entry) = new_entry else {
            return Ok(());
        };

        if do_logical_logging {
            self.tx.recovery_mgr().log_logical_start()?;
        }

        let mut new_entry = Some(entry);
        for dir_blk in self.dirs_may_be_updated.iter().rev() {
            let Some(entry) = new_entry.take() else {
                break;
            };
            let mut dir = BTreeDir::new(self.tx, dir_blk.clone(), self.key_type)?;
            new_entry = dir.insert(entry)?;
        }
        if let Some(entry) = new_entry {
            let mut root = BTreeDir::new(self.tx, self.root_blk.clone(), self.key_type)?;
            root.make_new_root(entry)?;
        }
        self.dirs_may_be_updated.clear();

        if do_logical_logging {
            self.tx.recovery_mgr().log_index_insertion_end(
                &self.info.table_name,
                &self.info.field_name,
                self.key_type,
                key,
                data_rid.blk.number(),
                data_rid.slot,
            )?;
        }
        Ok(())
    }

    /// Deletes the entry for `(key, data_rid)` from the leaf that holds it.
    fn delete(
        &mut self,
        key: Constant,
        data_rid: Rid,
        do_logical_logging: bool,
    ) -> IndexResult<()> {
        if self.tx.is_readonly() {
            return Err(IndexError::ReadOnlyTransaction);
        }
        self.search(&ConstantRange::exact(key.clone()), SearchPurpose::Delete)?;

        if do_logical_logging {
            self.tx.recovery_mgr().log_logical_start()?;
        }
        if let Some(leaf) = self.leaf.as_mut() {
            leaf.delete(&data_rid)?;
        }
        if do_logical_logging {
            self.tx.recovery_mgr().log_index_deletion_end(
                &self.info.table_name,
                &self.info.field_name,
                self.key_type,
                key,
                data_rid.blk.number(),
                data_rid.slot,
            )?;
        }
        Ok(())
    }

    /// Closes the open leaf cursor and releases the index-structure locks
    /// held by this transaction. Closing twice is a no-op.
    fn close(&mut self) {
        self.leaf = None;
        self.tx.concurrency_mgr().release_index_locks();
        self.dirs_may_be_updated.clear();
    }

    /// Best-effort warm-up: pins every block of both index files once. The
    /// pins are released when the cursor closes or the transaction ends.
    fn pre_load_to_memory(&mut self) -> IndexResult<()> {
        let dir_size = file_size(self.tx, &self.dir_file_name)?;
        for num in 0..dir_size {
            let blk = BlockId::new(self.dir_file_name.clone(), num);
            match self.tx.buffer_mgr().pin(&blk) {
                Ok(_) => {}
                Err(StorageError::BufferAbort) => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
        let leaf_size = file_size(self.tx, &self.leaf_file_name)?;
        for num in 0..leaf_size {
            let blk = BlockId::new(self.leaf_file_name.clone(), num);
            match self.tx.buffer_mgr().pin(&blk) {
                Ok(_) => {}
                Err(StorageError::BufferAbort) => return Ok(()),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
}

/// Measures a file, taking the shared file lock first. A lock abort rolls
/// the transaction back before propagating.
fn file_size(tx: &Transaction, file_name: &str) -> IndexResult<u64> {
    if let Err(error) = tx.concurrency_mgr().read_file(file_name) {
        let _ = tx.rollback();
        return Err(error.into());
    }
    Ok(tx.buffer_mgr().pool().file_mgr().size(file_name)?)
}

/// Appends a formatted block to a B-tree file, taking the exclusive file
/// lock first. A lock abort rolls the transaction back before propagating.
fn append_block(tx: &Transaction, file_name: &str, flags: Vec<i64>) -> IndexResult<BlockId> {
    if let Err(error) = tx.concurrency_mgr().modify_file(file_name) {
        let _ = tx.rollback();
        return Err(error.into());
    }
    let formatter = BTreePageFormatter::new(flags);
    let buffer = tx.buffer_mgr().pin_new(file_name, &formatter)?;
    let blk = buffer.block();
    tx.buffer_mgr().unpin(&buffer);
    blk.ok_or_else(|| IndexError::Corrupt("appended block has no id".to_string()))
}
