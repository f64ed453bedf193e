use std::sync::Arc;

use sql::{Constant, ConstantType};
use storage::{BlockId, Buffer, Page, PageFormatter, Transaction, BLOCK_SIZE};

use crate::btree::append_block;
use crate::IndexResult;

pub(crate) const LEAF_FLAG_COUNT: usize = 2;
pub(crate) const DIR_FLAG_COUNT: usize = 1;

/// Leaf flag 0: block number of the next sibling leaf, or -1.
pub(crate) const FLAG_SIBLING: usize = 0;
/// Leaf flag 1: head of the overflow chain for the first entry's key, or -1.
pub(crate) const FLAG_OVERFLOW: usize = 1;
/// Directory flag 0: tree level; level 0 points at leaves.
pub(crate) const FLAG_LEVEL: usize = 0;

/// Width of one leaf slot: key, data block number, data slot number.
pub(crate) fn leaf_slot_size(key_type: ConstantType) -> usize {
    key_type.serialized_size() + 8 + 4
}

/// Width of one directory slot: key, child block number.
pub(crate) fn dir_slot_size(key_type: ConstantType) -> usize {
    key_type.serialized_size() + 8
}

/// Initializes a fresh B-tree block: header flags, then a zero record count.
pub struct BTreePageFormatter {
    flags: Vec<i64>,
}

impl BTreePageFormatter {
    pub fn new(flags: Vec<i64>) -> Self {
        Self { flags }
    }
}

impl PageFormatter for BTreePageFormatter {
    fn format(&self, page: &mut Page) {
        for (index, flag) in self.flags.iter().enumerate() {
            page.set_i64(index * 8, *flag);
        }
        page.set_u32(self.flags.len() * 8, 0);
    }
}

/// Slotted view over one pinned block.
///
/// Layout: `flag_count` reserved 64-bit flags, a 32-bit record count, then
/// `num_records` fixed-width slots. The page pins its block on open and
/// unpins on drop; conflicting access is prevented by the crabbing locks
/// taken above this layer, not here.
pub(crate) struct BTreePage<'a> {
    tx: &'a Transaction,
    blk: BlockId,
    buffer: Arc<Buffer>,
    flag_count: usize,
    key_type: ConstantType,
    slot_size: usize,
}

impl<'a> BTreePage<'a> {
    pub fn open(
        tx: &'a Transaction,
        blk: BlockId,
        flag_count: usize,
        key_type: ConstantType,
        slot_size: usize,
    ) -> IndexResult<Self> {
        let buffer = tx.buffer_mgr().pin(&blk)?;
        Ok(Self {
            tx,
            blk,
            buffer,
            flag_count,
            key_type,
            slot_size,
        })
    }

    pub fn block(&self) -> &BlockId {
        &self.blk
    }

    fn header_size(&self) -> usize {
        self.flag_count * 8 + 4
    }

    fn slot_offset(&self, slot: usize) -> usize {
        self.header_size() + slot * self.slot_size
    }

    /// Records that physically fit in one block.
    pub fn max_slots(&self) -> usize {
        (BLOCK_SIZE - self.header_size()) / self.slot_size
    }

    pub fn num_records(&self) -> usize {
        self.buffer.get_u32(self.flag_count * 8) as usize
    }

    fn set_num_records(&self, count: usize) {
        self.buffer
            .set_u32(self.flag_count * 8, count as u32, self.tx.txn_id(), None);
    }

    pub fn flag(&self, index: usize) -> i64 {
        self.buffer.get_i64(index * 8)
    }

    pub fn set_flag(&self, index: usize, value: i64) {
        self.buffer.set_i64(index * 8, value, self.tx.txn_id(), None);
    }

    pub fn key(&self, slot: usize) -> IndexResult<Constant> {
        let bytes = self
            .buffer
            .get_bytes(self.slot_offset(slot), self.key_type.serialized_size());
        Ok(self.key_type.decode(&bytes)?)
    }

    pub fn set_key(&self, slot: usize, key: &Constant) -> IndexResult<()> {
        let bytes = self.key_type.encode(key)?;
        self.buffer
            .set_bytes(self.slot_offset(slot), &bytes, self.tx.txn_id(), None);
        Ok(())
    }

    pub fn get_i64_field(&self, slot: usize, field_offset: usize) -> i64 {
        self.buffer.get_i64(self.slot_offset(slot) + field_offset)
    }

    pub fn set_i64_field(&self, slot: usize, field_offset: usize, value: i64) {
        self.buffer.set_i64(
            self.slot_offset(slot) + field_offset,
            value,
            self.tx.txn_id(),
            None,
        );
    }

    pub fn get_i32_field(&self, slot: usize, field_offset: usize) -> i32 {
        self.buffer.get_i32(self.slot_offset(slot) + field_offset)
    }

    pub fn set_i32_field(&self, slot: usize, field_offset: usize, value: i32) {
        self.buffer.set_i32(
            self.slot_offset(slot) + field_offset,
            value,
            self.tx.txn_id(),
            None,
        );
    }

    /// Opens a hole at `slot`, shifting later records one slot right.
    pub fn insert_slot(&self, slot: usize) {
        let count = self.num_records();
        if slot < count {
            let start = self.slot_offset(slot);
            let bytes = self.buffer.get_bytes(start, (count - slot) * self.slot_size);
            self.buffer
                .set_bytes(start + self.slot_size, &bytes, self.tx.txn_id(), None);
        }
        self.set_num_records(count + 1);
    }

    /// Removes `slot`, shifting later records one slot left.
    pub fn delete_slot(&self, slot: usize) {
        let count = self.num_records();
        if slot >= count {
            return;
        }
        if slot + 1 < count {
            let start = self.slot_offset(slot + 1);
            let bytes = self
                .buffer
                .get_bytes(start, (count - slot - 1) * self.slot_size);
            self.buffer
                .set_bytes(self.slot_offset(slot), &bytes, self.tx.txn_id(), None);
        }
        self.set_num_records(count - 1);
    }

    pub fn is_full(&self) -> bool {
        self.num_records() >= self.max_slots()
    }

    /// Moves the records from `from_slot` onward into a freshly appended
    /// block formatted with `flags`, and returns the new block's id.
    pub fn split(&self, from_slot: usize, flags: Vec<i64>) -> IndexResult<BlockId> {
        let new_blk = append_block(self.tx, self.blk.file_name(), flags)?;
        let dest = BTreePage::open(
            self.tx,
            new_blk.clone(),
            self.flag_count,
            self.key_type,
            self.slot_size,
        )?;
        let count = self.num_records() - from_slot;
        if count > 0 {
            let bytes = self
                .buffer
                .get_bytes(self.slot_offset(from_slot), count * self.slot_size);
            dest.buffer
                .set_bytes(dest.slot_offset(0), &bytes, self.tx.txn_id(), None);
        }
        dest.set_num_records(count);
        self.set_num_records(from_slot);
        Ok(new_blk)
    }
}

impl Drop for BTreePage<'_> {
    fn drop(&mut self) {
        self.tx.buffer_mgr().unpin(&self.buffer);
    }
}
