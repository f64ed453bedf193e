use std::cmp::Ordering;

use sql::{Constant, ConstantRange, ConstantType};
use storage::{BlockId, Rid, Transaction};

use crate::btree::page::{
    leaf_slot_size, BTreePage, FLAG_OVERFLOW, FLAG_SIBLING, LEAF_FLAG_COUNT,
};
use crate::btree::DirEntry;
use crate::{IndexError, IndexResult};

/// Where to pick the scan back up after draining an overflow chain.
#[derive(Clone, Copy)]
struct OverflowReturn {
    home_blk: u64,
    resume_slot: isize,
}

/// Cursor over the sorted entries of one leaf block, its overflow chain, and
/// the sibling chain beyond it.
///
/// Leaf slots hold `(key, data block, data slot)` in ascending `(key, rid)`
/// order. Flag 0 links leaves in key order; flag 1 heads a chain of overflow
/// blocks whose records all carry the key of this leaf's first entry.
pub(crate) struct BTreeLeaf<'a> {
    tx: &'a Transaction,
    data_file_name: String,
    file_name: String,
    key_type: ConstantType,
    search_range: ConstantRange,
    page: BTreePage<'a>,
    current_slot: isize,
    overflow_home: Option<OverflowReturn>,
    chain_visited: bool,
}

impl<'a> BTreeLeaf<'a> {
    pub fn file_name(index_name: &str) -> String {
        format!("{index_name}_leaf.idx")
    }

    /// Opens `blk` and positions the cursor before the first entry that
    /// could match the search range's lower bound.
    pub fn new(
        tx: &'a Transaction,
        data_file_name: String,
        blk: BlockId,
        key_type: ConstantType,
        search_range: ConstantRange,
    ) -> IndexResult<Self> {
        let file_name = blk.file_name().to_string();
        let page = BTreePage::open(tx, blk, LEAF_FLAG_COUNT, key_type, leaf_slot_size(key_type))?;
        let mut leaf = Self {
            tx,
            data_file_name,
            file_name,
            key_type,
            search_range,
            page,
            current_slot: -1,
            overflow_home: None,
            chain_visited: false,
        };
        if let Some(low) = leaf.search_range.low().cloned() {
            leaf.current_slot = leaf.slot_before(&low)?;
        }
        Ok(leaf)
    }

    /// Advances to the next entry whose key lies in the search range.
    /// Returns false at the end of the chain or past the upper bound.
    pub fn next(&mut self) -> IndexResult<bool> {
        loop {
            self.current_slot += 1;

            if let Some(OverflowReturn {
                home_blk,
                resume_slot,
            }) = self.overflow_home
            {
                let count = self.page.num_records() as isize;
                if self.current_slot < count {
                    let key = self.page.key(self.current_slot as usize)?;
                    if self.search_range.contains(&key) {
                        return Ok(true);
                    }
                    continue;
                }
                let next = self.page.flag(FLAG_OVERFLOW);
                if next == -1 {
                    // Chain drained: pick the scan back up in the home leaf.
                    self.overflow_home = None;
                    self.move_to(home_blk)?;
                    self.current_slot = resume_slot - 1;
                } else {
                    self.move_to(next as u64)?;
                    self.current_slot = -1;
                }
                continue;
            }

            let count = self.page.num_records() as isize;

            // Right after the first slot, detour through the overflow chain:
            // every chained record carries the key of that first entry.
            let chain_trigger = if count == 0 { 0 } else { 1 };
            if !self.chain_visited && self.current_slot == chain_trigger {
                self.chain_visited = true;
                let overflow = self.page.flag(FLAG_OVERFLOW);
                if overflow != -1 {
                    let enter = if count == 0 {
                        true
                    } else {
                        self.search_range.contains(&self.page.key(0)?)
                    };
                    if enter {
                        self.overflow_home = Some(OverflowReturn {
                            home_blk: self.page.block().number(),
                            resume_slot: self.current_slot,
                        });
                        self.move_to(overflow as u64)?;
                        self.current_slot = -1;
                        continue;
                    }
                }
            }

            if self.current_slot >= count {
                let sibling = self.page.flag(FLAG_SIBLING);
                if sibling == -1 {
                    return Ok(false);
                }
                self.move_to(sibling as u64)?;
                self.current_slot = -1;
                self.chain_visited = false;
                continue;
            }

            let key = self.page.key(self.current_slot as usize)?;
            if self.search_range.is_beyond_high(&key) {
                return Ok(false);
            }
            if self.search_range.contains(&key) {
                return Ok(true);
            }
        }
    }

    /// RID of the row the cursor is positioned on.
    pub fn get_data_rid(&self) -> IndexResult<Rid> {
        if self.current_slot < 0 || self.current_slot as usize >= self.page.num_records() {
            return Err(IndexError::NoCurrentRecord);
        }
        self.rid_at(self.current_slot as usize)
    }

    /// Inserts the record for the search key, keeping slots sorted. Returns
    /// the directory entry of a new sibling if the leaf split.
    pub fn insert(&mut self, data_rid: Rid) -> IndexResult<Option<DirEntry>> {
        let Some(search_key) = self.search_range.low().cloned() else {
            return Err(IndexError::Corrupt(
                "leaf insertion without a search key".to_string(),
            ));
        };

        // A leaf that owns an overflow chain must keep its first key, since
        // the chained records carry it. A smaller key would become the new
        // first entry, so first move every current record (and chain
        // ownership) into a fresh sibling.
        let mut pending_entry = None;
        if self.page.flag(FLAG_OVERFLOW) != -1 && self.page.num_records() > 0 {
            let first_key = self.page.key(0)?;
            if search_key < first_key {
                let new_blk = self.page.split(
                    0,
                    vec![self.page.flag(FLAG_SIBLING), self.page.flag(FLAG_OVERFLOW)],
                )?;
                self.page.set_flag(FLAG_SIBLING, new_blk.number() as i64);
                self.page.set_flag(FLAG_OVERFLOW, -1);
                pending_entry = Some(DirEntry::new(first_key, new_blk.number()));
            }
        }

        let slot = self.insertion_slot(&search_key, &data_rid)?;
        self.page.insert_slot(slot);
        self.page.set_key(slot, &search_key)?;
        let key_size = self.key_type.serialized_size();
        self.page
            .set_i64_field(slot, key_size, data_rid.blk.number() as i64);
        self.page
            .set_i32_field(slot, key_size + 8, data_rid.slot as i32);

        if pending_entry.is_some() {
            return Ok(pending_entry);
        }
        if !self.page.is_full() {
            return Ok(None);
        }

        let count = self.page.num_records();
        let first_key = self.page.key(0)?;
        let last_key = self.page.key(count - 1)?;
        if first_key == last_key {
            // The whole block holds one key: chain an overflow block so the
            // key's records stay co-located instead of splitting them apart.
            let overflow = self.page.flag(FLAG_OVERFLOW);
            let new_blk = self.page.split(1, vec![-1, overflow])?;
            self.page.set_flag(FLAG_OVERFLOW, new_blk.number() as i64);
            return Ok(None);
        }

        // Standard split at the median, nudged so equal keys stay together.
        let mut split_slot = count / 2;
        let split_key = self.page.key(split_slot)?;
        if split_key == first_key {
            while self.page.key(split_slot)? == split_key {
                split_slot += 1;
            }
        } else {
            while self.page.key(split_slot - 1)? == split_key {
                split_slot -= 1;
            }
        }
        let split_key = self.page.key(split_slot)?;
        let sibling = self.page.flag(FLAG_SIBLING);
        let new_blk = self.page.split(split_slot, vec![sibling, -1])?;
        self.page.set_flag(FLAG_SIBLING, new_blk.number() as i64);
        Ok(Some(DirEntry::new(split_key, new_blk.number())))
    }

    /// Removes the entry pointing at `data_rid`, searching the leaf and its
    /// overflow chain. Leaves may end up partially empty; there is no
    /// rebalancing.
    pub fn delete(&mut self, data_rid: &Rid) -> IndexResult<()> {
        while self.next()? {
            if self.get_data_rid()? == *data_rid {
                self.tx
                    .concurrency_mgr()
                    .modify_leaf_block(self.page.block().lock_key())?;
                self.page.delete_slot(self.current_slot as usize);
                return Ok(());
            }
        }
        Ok(())
    }

    fn move_to(&mut self, blk_num: u64) -> IndexResult<()> {
        let blk = BlockId::new(self.file_name.clone(), blk_num);
        self.tx.concurrency_mgr().read_leaf_block(blk.lock_key())?;
        self.page = BTreePage::open(
            self.tx,
            blk,
            LEAF_FLAG_COUNT,
            self.key_type,
            leaf_slot_size(self.key_type),
        )?;
        Ok(())
    }

    /// Index of the last slot whose key is below `key`, or -1.
    fn slot_before(&self, key: &Constant) -> IndexResult<isize> {
        let mut low = 0_isize;
        let mut high = self.page.num_records() as isize - 1;
        let mut result = -1;
        while low <= high {
            let mid = (low + high) / 2;
            if self.page.key(mid as usize)? < *key {
                result = mid;
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        Ok(result)
    }

    /// First slot at which `(key, rid)` sorts before the stored entry; ties
    /// on the key break by rid so inserts are stable.
    fn insertion_slot(&self, key: &Constant, rid: &Rid) -> IndexResult<usize> {
        let mut low = 0;
        let mut high = self.page.num_records();
        while low < high {
            let mid = (low + high) / 2;
            let go_right = match self.page.key(mid)?.cmp(key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => self.rid_at(mid)? <= *rid,
            };
            if go_right {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        Ok(low)
    }

    fn rid_at(&self, slot: usize) -> IndexResult<Rid> {
        let key_size = self.key_type.serialized_size();
        let blk_num = self.page.get_i64_field(slot, key_size);
        let slot_id = self.page.get_i32_field(slot, key_size + 8);
        Ok(Rid::new(
            BlockId::new(self.data_file_name.clone(), blk_num as u64),
            slot_id as u32,
        ))
    }
}
