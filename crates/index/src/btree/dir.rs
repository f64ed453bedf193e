use sql::{Constant, ConstantType};
use storage::{BlockId, Transaction};

use crate::btree::page::{dir_slot_size, BTreePage, DIR_FLAG_COUNT, FLAG_LEVEL};
use crate::btree::{DirEntry, SearchPurpose};
use crate::IndexResult;

/// An internal node holding `(key, child block)` entries in ascending key
/// order. The first entry's key acts as negative infinity for routing.
pub(crate) struct BTreeDir<'a> {
    tx: &'a Transaction,
    key_type: ConstantType,
    file_name: String,
    page: BTreePage<'a>,
    dirs_may_be_updated: Vec<BlockId>,
}

impl<'a> BTreeDir<'a> {
    pub fn file_name(index_name: &str) -> String {
        format!("{index_name}_dir.idx")
    }

    pub fn new(tx: &'a Transaction, blk: BlockId, key_type: ConstantType) -> IndexResult<Self> {
        let file_name = blk.file_name().to_string();
        let page = BTreePage::open(tx, blk, DIR_FLAG_COUNT, key_type, dir_slot_size(key_type))?;
        Ok(Self {
            tx,
            key_type,
            file_name,
            page,
            dirs_may_be_updated: Vec::new(),
        })
    }

    pub fn num_records(&self) -> usize {
        self.page.num_records()
    }

    fn level(&self) -> i64 {
        self.page.flag(FLAG_LEVEL)
    }

    /// Ancestor directory blocks recorded by an insertion descent, root
    /// first. A leaf split walks this list from the deepest entry up.
    pub fn take_dirs_may_be_updated(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.dirs_may_be_updated)
    }

    /// Descends to the leaf block that would hold `search_key`, crabbing
    /// block locks as it goes.
    ///
    /// Readers couple locks: the parent's shared lock is released once the
    /// child is latched. An insertion holds an exclusive lock on the whole
    /// descent path, because a leaf split may have to update any of it. A
    /// deletion reads the path but locks the target leaf exclusively; with
    /// no rebalancing, parents never change.
    pub fn search(
        &mut self,
        search_key: &Constant,
        leaf_file_name: &str,
        purpose: SearchPurpose,
    ) -> IndexResult<BlockId> {
        let cc = self.tx.concurrency_mgr();
        let mut current_blk = self.page.block().clone();
        match purpose {
            SearchPurpose::Insert => {
                cc.crab_down_dir_for_modification(current_blk.lock_key())?;
                self.dirs_may_be_updated.push(current_blk.clone());
            }
            _ => cc.crab_down_dir_for_read(current_blk.lock_key())?,
        }

        while self.level() > 0 {
            let child_num = self.child_block_number(search_key)?;
            let child_blk = BlockId::new(self.file_name.clone(), child_num);
            match purpose {
                SearchPurpose::Insert => {
                    cc.crab_down_dir_for_modification(child_blk.lock_key())?;
                    self.dirs_may_be_updated.push(child_blk.clone());
                }
                _ => cc.crab_down_dir_for_read(child_blk.lock_key())?,
            }
            self.move_to(child_blk.clone())?;
            if purpose != SearchPurpose::Insert {
                cc.crab_back_dir_for_read(&current_blk.lock_key());
            }
            current_blk = child_blk;
        }

        let leaf_num = self.child_block_number(search_key)?;
        let leaf_blk = BlockId::new(leaf_file_name.to_string(), leaf_num);
        match purpose {
            SearchPurpose::Read => cc.read_leaf_block(leaf_blk.lock_key())?,
            _ => cc.modify_leaf_block(leaf_blk.lock_key())?,
        }
        if purpose != SearchPurpose::Insert {
            cc.crab_back_dir_for_read(&current_blk.lock_key());
        }
        Ok(leaf_blk)
    }

    /// Inserts a directory entry, returning the split entry if this node
    /// overflowed.
    pub fn insert(&mut self, entry: DirEntry) -> IndexResult<Option<DirEntry>> {
        let slot = self.insertion_slot(entry.key())?;
        self.page.insert_slot(slot);
        self.page.set_key(slot, entry.key())?;
        self.page.set_i64_field(
            slot,
            self.key_type.serialized_size(),
            entry.block_number() as i64,
        );

        if !self.page.is_full() {
            return Ok(None);
        }
        let split_slot = self.page.num_records() / 2;
        let split_key = self.page.key(split_slot)?;
        let level = self.level();
        let new_blk = self.page.split(split_slot, vec![level])?;
        Ok(Some(DirEntry::new(split_key, new_blk.number())))
    }

    /// Grows the tree one level while keeping the root block's identity:
    /// the root's current records move to a fresh block, and the root is
    /// rebuilt with two entries covering the old root and the split-off
    /// sibling.
    pub fn make_new_root(&mut self, entry: DirEntry) -> IndexResult<()> {
        let first_key = self.page.key(0)?;
        let level = self.level();
        let old_root = self.page.split(0, vec![level])?;
        self.page.set_flag(FLAG_LEVEL, level + 1);
        self.insert(DirEntry::new(first_key, old_root.number()))?;
        self.insert(entry)?;
        Ok(())
    }

    fn move_to(&mut self, blk: BlockId) -> IndexResult<()> {
        self.page = BTreePage::open(
            self.tx,
            blk,
            DIR_FLAG_COUNT,
            self.key_type,
            dir_slot_size(self.key_type),
        )?;
        Ok(())
    }

    /// Child pointer of the largest entry with key at or below the search
    /// key; the first entry if every key is above it.
    fn child_block_number(&self, search_key: &Constant) -> IndexResult<u64> {
        let mut low = 0_isize;
        let mut high = self.page.num_records() as isize - 1;
        let mut slot = 0_isize;
        while low <= high {
            let mid = (low + high) / 2;
            if self.page.key(mid as usize)? <= *search_key {
                slot = mid;
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        Ok(self
            .page
            .get_i64_field(slot as usize, self.key_type.serialized_size()) as u64)
    }

    /// First slot past every entry with a key at or below the new one.
    fn insertion_slot(&self, key: &Constant) -> IndexResult<usize> {
        let mut low = 0;
        let mut high = self.page.num_records();
        while low < high {
            let mid = (low + high) / 2;
            if self.page.key(mid)? <= *key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }
}
