use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use txn::TxnId;
use wal::{LogManager, Lsn};

use crate::file::FileManager;
use crate::page::Page;
use crate::replacer::{FrameId, LruReplacer, Replacer};
use crate::{BlockId, StorageError, StorageResult};

/// Initializes the bytes of a freshly appended block before it reaches disk.
pub trait PageFormatter {
    fn format(&self, page: &mut Page);
}

/// Buffer manager tuning knobs.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// How long a pin may wait for a free frame before re-pin recovery.
    pub max_time: Duration,
    /// Slack added to the wait deadline.
    pub epsilon: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            max_time: Duration::from_millis(10_000),
            epsilon: Duration::from_millis(50),
        }
    }
}

impl BufferConfig {
    /// Loads the configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// Recognized keys: `BUFFER_POOL_SIZE`, `BUFFER_MAX_TIME_MS`,
    /// `BUFFER_EPSILON_MS`.
    pub fn from_env() -> Self {
        Self::from_env_reader(|key| std::env::var(key))
    }

    /// Loads the configuration using a custom environment reader function.
    pub fn from_env_reader(
        reader: impl Fn(&str) -> Result<String, std::env::VarError>,
    ) -> Self {
        let mut config = Self::default();
        if let Some(pool_size) = read_parsed(&reader, "BUFFER_POOL_SIZE") {
            config.pool_size = pool_size;
        }
        if let Some(millis) = read_parsed(&reader, "BUFFER_MAX_TIME_MS") {
            config.max_time = Duration::from_millis(millis);
        }
        if let Some(millis) = read_parsed(&reader, "BUFFER_EPSILON_MS") {
            config.epsilon = Duration::from_millis(millis);
        }
        config
    }
}

fn read_parsed<T: std::str::FromStr>(
    reader: &impl Fn(&str) -> Result<String, std::env::VarError>,
    key: &str,
) -> Option<T> {
    reader(key).ok().and_then(|value| value.parse().ok())
}

#[derive(Debug)]
struct FrameState {
    page: Page,
    blk: Option<BlockId>,
    pins: u32,
    dirty: bool,
    modified_by: Option<TxnId>,
    last_lsn: Option<Lsn>,
}

impl FrameState {
    fn new() -> Self {
        Self {
            page: Page::new(),
            blk: None,
            pins: 0,
            dirty: false,
            modified_by: None,
            last_lsn: None,
        }
    }
}

/// One frame of the buffer pool: a block image plus pin count, dirty flag,
/// the id of the last modifying transaction, and the LSN of the last change.
///
/// A block must be pinned before its getters and setters are used; the
/// crabbing protocol above the pool serializes conflicting accesses.
pub struct Buffer {
    id: FrameId,
    state: Mutex<FrameState>,
}

impl Buffer {
    fn new(id: FrameId) -> Self {
        Self {
            id,
            state: Mutex::new(FrameState::new()),
        }
    }

    /// The block currently held by this frame, if any.
    pub fn block(&self) -> Option<BlockId> {
        self.state.lock().blk.clone()
    }

    pub fn pin_count(&self) -> u32 {
        self.state.lock().pins
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn modifying_tx(&self) -> Option<TxnId> {
        self.state.lock().modified_by
    }

    pub fn last_lsn(&self) -> Option<Lsn> {
        self.state.lock().last_lsn
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        self.state.lock().page.get_i32(offset)
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        self.state.lock().page.get_u32(offset)
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        self.state.lock().page.get_i64(offset)
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.state.lock().page.get_bytes(offset, len).to_vec()
    }

    pub fn set_i32(&self, offset: usize, value: i32, txn_id: TxnId, lsn: Option<Lsn>) {
        let mut state = self.state.lock();
        state.page.set_i32(offset, value);
        Self::mark_modified(&mut state, txn_id, lsn);
    }

    pub fn set_u32(&self, offset: usize, value: u32, txn_id: TxnId, lsn: Option<Lsn>) {
        let mut state = self.state.lock();
        state.page.set_u32(offset, value);
        Self::mark_modified(&mut state, txn_id, lsn);
    }

    pub fn set_i64(&self, offset: usize, value: i64, txn_id: TxnId, lsn: Option<Lsn>) {
        let mut state = self.state.lock();
        state.page.set_i64(offset, value);
        Self::mark_modified(&mut state, txn_id, lsn);
    }

    pub fn set_bytes(&self, offset: usize, bytes: &[u8], txn_id: TxnId, lsn: Option<Lsn>) {
        let mut state = self.state.lock();
        state.page.set_bytes(offset, bytes);
        Self::mark_modified(&mut state, txn_id, lsn);
    }

    fn mark_modified(state: &mut FrameState, txn_id: TxnId, lsn: Option<Lsn>) {
        state.dirty = true;
        state.modified_by = Some(txn_id);
        if lsn.is_some() {
            state.last_lsn = lsn;
        }
    }
}

pub(crate) struct PoolState {
    block_map: HashMap<BlockId, FrameId>,
    replacer: LruReplacer,
    free_list: Vec<FrameId>,
    available: usize,
    pub(crate) waiters: VecDeque<ThreadId>,
}

/// Process-wide pool of buffer frames.
///
/// The pool maps blocks to frames and recycles unpinned frames; it never
/// waits. Callers that need blocking semantics (the per-transaction
/// `BufferMgr`) wait on `available_cond` and retry.
pub struct BufferPool {
    frames: Vec<Arc<Buffer>>,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) available_cond: Condvar,
    file_mgr: Arc<FileManager>,
    log_mgr: Option<Arc<LogManager>>,
    config: BufferConfig,
}

impl BufferPool {
    pub fn new(
        file_mgr: Arc<FileManager>,
        log_mgr: Option<Arc<LogManager>>,
        config: BufferConfig,
    ) -> Self {
        let frames: Vec<_> = (0..config.pool_size).map(|id| Arc::new(Buffer::new(id))).collect();
        let free_list: Vec<_> = (0..config.pool_size).rev().collect();
        Self {
            frames,
            state: Mutex::new(PoolState {
                block_map: HashMap::new(),
                replacer: LruReplacer::new(config.pool_size),
                free_list,
                available: config.pool_size,
                waiters: VecDeque::new(),
            }),
            available_cond: Condvar::new(),
            file_mgr,
            log_mgr,
            config,
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn file_mgr(&self) -> &Arc<FileManager> {
        &self.file_mgr
    }

    /// Number of unpinned frames.
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Pins `blk`, loading it into a recycled frame if necessary. Returns
    /// `None` when every frame is pinned.
    pub fn pin(&self, blk: &BlockId) -> StorageResult<Option<Arc<Buffer>>> {
        let mut state = self.state.lock();
        self.try_pin(&mut state, blk)
    }

    /// Appends a new block to `file_name`, formats it, and pins it. Returns
    /// `None` when every frame is pinned.
    pub fn pin_new(
        &self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StorageResult<Option<Arc<Buffer>>> {
        let mut state = self.state.lock();
        self.try_pin_new(&mut state, file_name, formatter)
    }

    pub(crate) fn try_pin(
        &self,
        state: &mut PoolState,
        blk: &BlockId,
    ) -> StorageResult<Option<Arc<Buffer>>> {
        if let Some(&frame_id) = state.block_map.get(blk) {
            let buffer = &self.frames[frame_id];
            let mut frame = buffer.state.lock();
            if frame.pins == 0 {
                state.replacer.pin(frame_id);
                state.available -= 1;
            }
            frame.pins += 1;
            return Ok(Some(Arc::clone(buffer)));
        }

        let Some(frame_id) = self.allocate_frame(state)? else {
            return Ok(None);
        };
        let buffer = &self.frames[frame_id];
        {
            let mut frame = buffer.state.lock();
            if let Err(error) = self.file_mgr.read(blk, &mut frame.page) {
                drop(frame);
                state.free_list.push(frame_id);
                state.available += 1;
                return Err(error.into());
            }
            frame.blk = Some(blk.clone());
            frame.pins = 1;
            frame.dirty = false;
            frame.modified_by = None;
            frame.last_lsn = None;
        }
        state.block_map.insert(blk.clone(), frame_id);
        Ok(Some(Arc::clone(buffer)))
    }

    pub(crate) fn try_pin_new(
        &self,
        state: &mut PoolState,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StorageResult<Option<Arc<Buffer>>> {
        let Some(frame_id) = self.allocate_frame(state)? else {
            return Ok(None);
        };
        let buffer = &self.frames[frame_id];
        let blk = {
            let mut frame = buffer.state.lock();
            frame.page.clear();
            formatter.format(&mut frame.page);
            let blk = match self.file_mgr.append(file_name, &frame.page) {
                Ok(blk) => blk,
                Err(error) => {
                    drop(frame);
                    state.free_list.push(frame_id);
                    state.available += 1;
                    return Err(error.into());
                }
            };
            frame.blk = Some(blk.clone());
            frame.pins = 1;
            frame.dirty = false;
            frame.modified_by = None;
            frame.last_lsn = None;
            blk
        };
        state.block_map.insert(blk, frame_id);
        Ok(Some(Arc::clone(buffer)))
    }

    /// Decrements the pin count of `buffer`. At zero the frame becomes
    /// evictable; waking waiters is the caller's responsibility.
    pub fn unpin(&self, buffer: &Buffer) {
        let mut state = self.state.lock();
        let mut frame = buffer.state.lock();
        if frame.pins == 0 {
            return;
        }
        frame.pins -= 1;
        if frame.pins == 0 {
            state.replacer.unpin(buffer.id);
            state.available += 1;
        }
    }

    /// Writes every dirty frame to disk.
    pub fn flush_all(&self) -> StorageResult<()> {
        for buffer in &self.frames {
            let mut frame = buffer.state.lock();
            self.flush_frame(&mut frame)?;
        }
        Ok(())
    }

    /// Writes the dirty frames last modified by `txn_id`.
    pub fn flush_all_for(&self, txn_id: TxnId) -> StorageResult<()> {
        for buffer in &self.frames {
            let mut frame = buffer.state.lock();
            if frame.modified_by == Some(txn_id) {
                self.flush_frame(&mut frame)?;
            }
        }
        Ok(())
    }

    pub(crate) fn notify_waiters(&self) {
        self.available_cond.notify_all();
    }

    fn allocate_frame(&self, state: &mut PoolState) -> StorageResult<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop() {
            state.available -= 1;
            return Ok(Some(frame_id));
        }
        if let Some(frame_id) = state.replacer.victim() {
            let buffer = &self.frames[frame_id];
            let mut frame = buffer.state.lock();
            if let Err(error) = self.flush_frame(&mut frame) {
                drop(frame);
                state.replacer.unpin(frame_id);
                return Err(error);
            }
            if let Some(old_blk) = frame.blk.take() {
                state.block_map.remove(&old_blk);
            }
            state.available -= 1;
            return Ok(Some(frame_id));
        }
        Ok(None)
    }

    /// Write-ahead rule: the frame's last LSN must be durable before its
    /// bytes reach disk.
    fn flush_frame(&self, frame: &mut FrameState) -> StorageResult<()> {
        if !frame.dirty {
            return Ok(());
        }
        if let (Some(log_mgr), Some(lsn)) = (&self.log_mgr, frame.last_lsn) {
            log_mgr.flush(lsn).map_err(StorageError::Wal)?;
        }
        if let Some(blk) = &frame.blk {
            self.file_mgr.write(blk, &frame.page)?;
        }
        frame.dirty = false;
        frame.modified_by = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pool_size: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempfile::tempdir().unwrap();
        let file_mgr = Arc::new(FileManager::new(dir.path()).unwrap());
        let config = BufferConfig {
            pool_size,
            ..BufferConfig::default()
        };
        (dir, BufferPool::new(file_mgr, None, config))
    }

    struct Zeroes;

    impl PageFormatter for Zeroes {
        fn format(&self, _page: &mut Page) {}
    }

    #[test]
    fn pin_new_assigns_consecutive_blocks() {
        let (_dir, pool) = pool(4);
        let a = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        let b = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        assert_eq!(a.block(), Some(BlockId::new("t.tbl", 0)));
        assert_eq!(b.block(), Some(BlockId::new("t.tbl", 1)));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn repeat_pin_shares_the_frame() {
        let (_dir, pool) = pool(4);
        let blk = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap().block().unwrap();
        let first = pool.pin(&blk).unwrap().unwrap();
        assert_eq!(first.pin_count(), 2);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn pin_returns_none_when_all_frames_are_pinned() {
        let (_dir, pool) = pool(2);
        let _a = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        let _b = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        assert_eq!(pool.available(), 0);
        let result = pool.pin(&BlockId::new("t.tbl", 5)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn eviction_flushes_dirty_frames_first() {
        let (_dir, pool) = pool(1);
        let buffer = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        let blk = buffer.block().unwrap();
        buffer.set_i32(0, 7734, 1, None);
        pool.unpin(&buffer);

        // Reusing the only frame forces the dirty page out.
        let other = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        pool.unpin(&other);

        let reloaded = pool.pin(&blk).unwrap().unwrap();
        assert_eq!(reloaded.get_i32(0), 7734);
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn unpinned_frames_become_available_again() {
        let (_dir, pool) = pool(3);
        let buffer = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        assert_eq!(pool.available(), 2);
        pool.unpin(&buffer);
        assert_eq!(pool.available(), 3);
        // Double unpin does not underflow.
        pool.unpin(&buffer);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn flush_all_for_only_touches_that_transaction() {
        let (_dir, pool) = pool(4);
        let a = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        let b = pool.pin_new("t.tbl", &Zeroes).unwrap().unwrap();
        a.set_i32(0, 1, 10, None);
        b.set_i32(0, 2, 20, None);
        pool.flush_all_for(10).unwrap();
        assert!(!a.is_dirty());
        assert_eq!(a.modifying_tx(), None);
        assert!(b.is_dirty());
        assert_eq!(b.modifying_tx(), Some(20));
    }

    #[test]
    fn config_from_env_reader_overrides_defaults() {
        let config = BufferConfig::from_env_reader(|key| match key {
            "BUFFER_POOL_SIZE" => Ok("8".to_string()),
            "BUFFER_MAX_TIME_MS" => Ok("250".to_string()),
            _ => Err(std::env::VarError::NotPresent),
        });
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.max_time, Duration::from_millis(250));
        assert_eq!(config.epsilon, Duration::from_millis(50));
    }
}
