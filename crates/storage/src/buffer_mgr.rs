use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;
use txn::TxnId;

use crate::buffer::{Buffer, BufferPool, PageFormatter, PoolState};
use crate::{BlockId, StorageError, StorageResult};

struct PinnedBuffer {
    buffer: Arc<Buffer>,
    count: u32,
}

/// Per-transaction view of the shared buffer pool.
///
/// Repeated pins of the same block by one transaction are reference-counted
/// here, so the pool sees exactly one pin per (transaction, block) pair.
/// When the pool is full the calling thread joins a process-wide FIFO and
/// waits; a thread that starves past `max_time` releases everything it holds
/// and re-pins, which is what breaks pin-wait deadlocks.
pub struct BufferMgr {
    pool: Arc<BufferPool>,
    txn_id: TxnId,
    pinned: Mutex<HashMap<BlockId, PinnedBuffer>>,
}

impl BufferMgr {
    pub fn new(pool: Arc<BufferPool>, txn_id: TxnId) -> Self {
        Self {
            pool,
            txn_id,
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Number of unpinned frames in the shared pool.
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    /// Pins `blk`, waiting for a frame if none is free. After `max_time`
    /// without a frame, releases and re-pins everything this transaction
    /// holds, then retries.
    pub fn pin(&self, blk: &BlockId) -> StorageResult<Arc<Buffer>> {
        {
            let mut pinned = self.pinned.lock();
            if let Some(entry) = pinned.get_mut(blk) {
                entry.count += 1;
                return Ok(Arc::clone(&entry.buffer));
            }
            // This transaction alone would exhaust the pool.
            if pinned.len() == self.pool.config().pool_size {
                return Err(StorageError::BufferAbort);
            }
        }

        let start = Instant::now();
        let mut waited = false;
        let mut buffer = self.pool.pin(blk)?;
        if buffer.is_none() {
            waited = true;
            buffer = self.wait_until_pinned(start, |pool, state| pool.try_pin(state, blk))?;
        }

        let buffer = match buffer {
            Some(buffer) => {
                self.pinned.lock().insert(
                    blk.clone(),
                    PinnedBuffer {
                        buffer: Arc::clone(&buffer),
                        count: 1,
                    },
                );
                buffer
            }
            None => {
                self.repin()?;
                self.pin(blk)?
            }
        };

        if waited {
            // A block may have been unpinned while this thread waited.
            self.pool.notify_waiters();
        }
        Ok(buffer)
    }

    /// Appends a new block to `file_name` and pins it, with the same waiting
    /// and re-pin behavior as `pin`.
    pub fn pin_new(
        &self,
        file_name: &str,
        formatter: &dyn PageFormatter,
    ) -> StorageResult<Arc<Buffer>> {
        if self.pinned.lock().len() == self.pool.config().pool_size {
            return Err(StorageError::BufferAbort);
        }

        let start = Instant::now();
        let mut waited = false;
        let mut buffer = self.pool.pin_new(file_name, formatter)?;
        if buffer.is_none() {
            waited = true;
            buffer = self.wait_until_pinned(start, |pool, state| {
                pool.try_pin_new(state, file_name, formatter)
            })?;
        }

        let buffer = match buffer {
            Some(buffer) => {
                if let Some(blk) = buffer.block() {
                    self.pinned.lock().insert(
                        blk,
                        PinnedBuffer {
                            buffer: Arc::clone(&buffer),
                            count: 1,
                        },
                    );
                }
                buffer
            }
            None => {
                self.repin()?;
                self.pin_new(file_name, formatter)?
            }
        };

        if waited {
            self.pool.notify_waiters();
        }
        Ok(buffer)
    }

    /// Decrements the local pin count; at zero the pool pin is released and
    /// waiters are woken.
    pub fn unpin(&self, buffer: &Buffer) {
        let Some(blk) = buffer.block() else {
            return;
        };
        let mut pinned = self.pinned.lock();
        if let Some(entry) = pinned.get_mut(&blk) {
            entry.count -= 1;
            if entry.count == 0 {
                let entry = pinned.remove(&blk);
                drop(pinned);
                if let Some(entry) = entry {
                    self.pool.unpin(&entry.buffer);
                }
                self.pool.notify_waiters();
            }
        }
    }

    /// Releases every pool pin held by this transaction regardless of local
    /// counts. Called from the transaction lifecycle hooks; this is the
    /// safety net for pins a caller forgot to release.
    pub fn unpin_all(&self) {
        let entries: Vec<PinnedBuffer> = {
            let mut pinned = self.pinned.lock();
            pinned.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            self.pool.unpin(&entry.buffer);
        }
        self.pool.notify_waiters();
    }

    pub fn on_tx_commit(&self) {
        self.unpin_all();
    }

    pub fn on_tx_rollback(&self) {
        self.unpin_all();
    }

    pub fn on_end_statement(&self) {
        // do nothing
    }

    /// Flushes the dirty frames modified by this transaction.
    pub fn flush_all(&self) -> StorageResult<()> {
        self.pool.flush_all_for(self.txn_id)
    }

    /// Number of distinct blocks this transaction has pinned.
    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().len()
    }

    fn wait_until_pinned(
        &self,
        start: Instant,
        mut attempt: impl FnMut(&BufferPool, &mut PoolState) -> StorageResult<Option<Arc<Buffer>>>,
    ) -> StorageResult<Option<Arc<Buffer>>> {
        let me = thread::current().id();
        let max_time = self.pool.config().max_time;
        let mut state = self.pool.state.lock();
        state.waiters.push_back(me);

        let mut buffer = None;
        let mut failure = None;
        while buffer.is_none() && !self.waiting_too_long(start) {
            self.pool.available_cond.wait_for(&mut state, max_time);
            // Only the FIFO head retries, so a freed frame goes to the
            // oldest waiter instead of a thundering herd.
            if state.waiters.front() == Some(&me) {
                match attempt(&self.pool, &mut state) {
                    Ok(pinned) => buffer = pinned,
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
        }
        state.waiters.retain(|waiter| *waiter != me);
        drop(state);

        match failure {
            Some(error) => Err(error),
            None => Ok(buffer),
        }
    }

    fn waiting_too_long(&self, start: Instant) -> bool {
        let config = self.pool.config();
        start.elapsed() + config.epsilon >= config.max_time
    }

    /// Deadlock avoidance: fully release every frame this transaction holds,
    /// give the other threads a scheduling window, then re-acquire. Local
    /// pin counts collapse to one per block; callers hold their own
    /// structural references so this is safe.
    fn repin(&self) -> StorageResult<()> {
        warn!(txn_id = self.txn_id, "re-pinning all buffers after starvation");

        let snapshot: Vec<(BlockId, u32, Arc<Buffer>)> = {
            let pinned = self.pinned.lock();
            pinned
                .iter()
                .map(|(blk, entry)| (blk.clone(), entry.count, Arc::clone(&entry.buffer)))
                .collect()
        };

        for (_, count, buffer) in &snapshot {
            for _ in 0..*count {
                self.unpin(buffer);
            }
        }

        // Wait for the other transactions to make progress.
        {
            let max_time = self.pool.config().max_time;
            let mut state = self.pool.state.lock();
            self.pool.available_cond.wait_for(&mut state, max_time);
        }

        for (blk, _, _) in &snapshot {
            self.pin(blk)?;
        }
        Ok(())
    }
}
