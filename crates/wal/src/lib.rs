use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sql::{Constant, ConstantType};
use thiserror::Error;

/// Log sequence number: the byte offset of a record in the log file.
pub type Lsn = u64;
pub type TxnId = u64;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal corruption: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Type(#[from] sql::TypeError),
}

pub type WalResult<T> = Result<T, WalError>;

const TYPE_START: u8 = 1;
const TYPE_COMMIT: u8 = 2;
const TYPE_ROLLBACK: u8 = 3;
const TYPE_LOGICAL_START: u8 = 4;
const TYPE_INDEX_INSERT_END: u8 = 5;
const TYPE_INDEX_DELETE_END: u8 = 6;

const KEY_TAG_INTEGER: u8 = 1;
const KEY_TAG_BIGINT: u8 = 2;
const KEY_TAG_DOUBLE: u8 = 3;
const KEY_TAG_VARCHAR: u8 = 4;

/// A logical log record. Index operations are logged at the API level: redo
/// or undo replays the operation against the current tree rather than
/// patching bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Start {
        txn_id: TxnId,
    },
    Commit {
        txn_id: TxnId,
    },
    Rollback {
        txn_id: TxnId,
    },
    /// Marks the start of a logical operation; it must precede its matching
    /// end record within the same transaction.
    LogicalStart {
        txn_id: TxnId,
    },
    IndexInsertEnd {
        txn_id: TxnId,
        table: String,
        field: String,
        key_type: ConstantType,
        key: Constant,
        block_num: u64,
        slot: u32,
    },
    IndexDeleteEnd {
        txn_id: TxnId,
        table: String,
        field: String,
        key_type: ConstantType,
        key: Constant,
        block_num: u64,
        slot: u32,
    },
}

impl LogRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Start { txn_id }
            | LogRecord::Commit { txn_id }
            | LogRecord::Rollback { txn_id }
            | LogRecord::LogicalStart { txn_id }
            | LogRecord::IndexInsertEnd { txn_id, .. }
            | LogRecord::IndexDeleteEnd { txn_id, .. } => *txn_id,
        }
    }

    pub fn to_bytes(&self) -> WalResult<Vec<u8>> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&0u32.to_le_bytes());
        match self {
            LogRecord::Start { txn_id } => {
                buffer.push(TYPE_START);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
            }
            LogRecord::Commit { txn_id } => {
                buffer.push(TYPE_COMMIT);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
            }
            LogRecord::Rollback { txn_id } => {
                buffer.push(TYPE_ROLLBACK);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
            }
            LogRecord::LogicalStart { txn_id } => {
                buffer.push(TYPE_LOGICAL_START);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
            }
            LogRecord::IndexInsertEnd {
                txn_id,
                table,
                field,
                key_type,
                key,
                block_num,
                slot,
            } => {
                buffer.push(TYPE_INDEX_INSERT_END);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
                write_index_payload(&mut buffer, table, field, key_type, key, *block_num, *slot)?;
            }
            LogRecord::IndexDeleteEnd {
                txn_id,
                table,
                field,
                key_type,
                key,
                block_num,
                slot,
            } => {
                buffer.push(TYPE_INDEX_DELETE_END);
                buffer.extend_from_slice(&txn_id.to_le_bytes());
                write_index_payload(&mut buffer, table, field, key_type, key, *block_num, *slot)?;
            }
        }
        let len = buffer.len() as u32;
        buffer[0..4].copy_from_slice(&len.to_le_bytes());
        Ok(buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 9 {
            return Err(WalError::Corrupt("log record too small".to_string()));
        }
        let record_type = bytes[0];
        let txn_id = read_u64(&bytes[1..9]);
        let payload = &bytes[9..];
        match record_type {
            TYPE_START => Ok(LogRecord::Start { txn_id }),
            TYPE_COMMIT => Ok(LogRecord::Commit { txn_id }),
            TYPE_ROLLBACK => Ok(LogRecord::Rollback { txn_id }),
            TYPE_LOGICAL_START => Ok(LogRecord::LogicalStart { txn_id }),
            TYPE_INDEX_INSERT_END => {
                let (table, field, key_type, key, block_num, slot) = read_index_payload(payload)?;
                Ok(LogRecord::IndexInsertEnd {
                    txn_id,
                    table,
                    field,
                    key_type,
                    key,
                    block_num,
                    slot,
                })
            }
            TYPE_INDEX_DELETE_END => {
                let (table, field, key_type, key, block_num, slot) = read_index_payload(payload)?;
                Ok(LogRecord::IndexDeleteEnd {
                    txn_id,
                    table,
                    field,
                    key_type,
                    key,
                    block_num,
                    slot,
                })
            }
            other => Err(WalError::Corrupt(format!(
                "invalid log record type {other}"
            ))),
        }
    }
}

fn write_string(buffer: &mut Vec<u8>, text: &str) {
    buffer.extend_from_slice(&(text.len() as u16).to_le_bytes());
    buffer.extend_from_slice(text.as_bytes());
}

fn write_index_payload(
    buffer: &mut Vec<u8>,
    table: &str,
    field: &str,
    key_type: &ConstantType,
    key: &Constant,
    block_num: u64,
    slot: u32,
) -> WalResult<()> {
    write_string(buffer, table);
    write_string(buffer, field);
    match key_type {
        ConstantType::Integer => buffer.push(KEY_TAG_INTEGER),
        ConstantType::BigInt => buffer.push(KEY_TAG_BIGINT),
        ConstantType::Double => buffer.push(KEY_TAG_DOUBLE),
        ConstantType::Varchar(cap) => {
            buffer.push(KEY_TAG_VARCHAR);
            buffer.extend_from_slice(&(*cap as u32).to_le_bytes());
        }
    }
    buffer.extend_from_slice(&key_type.encode(key)?);
    buffer.extend_from_slice(&block_num.to_le_bytes());
    buffer.extend_from_slice(&slot.to_le_bytes());
    Ok(())
}

struct PayloadReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    fn take(&mut self, len: usize) -> WalResult<&'a [u8]> {
        if self.offset + len > self.bytes.len() {
            return Err(WalError::Corrupt("log payload truncated".to_string()));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> WalResult<String> {
        let len_bytes = self.take(2)?;
        let len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let text = std::str::from_utf8(self.take(len)?)
            .map_err(|_| WalError::Corrupt("invalid utf8 in log record".to_string()))?;
        Ok(text.to_string())
    }
}

fn read_index_payload(
    payload: &[u8],
) -> WalResult<(String, String, ConstantType, Constant, u64, u32)> {
    let mut reader = PayloadReader {
        bytes: payload,
        offset: 0,
    };
    let table = reader.read_string()?;
    let field = reader.read_string()?;
    let key_type = match reader.take(1)?[0] {
        KEY_TAG_INTEGER => ConstantType::Integer,
        KEY_TAG_BIGINT => ConstantType::BigInt,
        KEY_TAG_DOUBLE => ConstantType::Double,
        KEY_TAG_VARCHAR => {
            let cap_bytes = reader.take(4)?;
            ConstantType::Varchar(u32::from_le_bytes([
                cap_bytes[0],
                cap_bytes[1],
                cap_bytes[2],
                cap_bytes[3],
            ]) as usize)
        }
        other => {
            return Err(WalError::Corrupt(format!("invalid key type tag {other}")));
        }
    };
    let key = key_type.decode(reader.take(key_type.serialized_size())?)?;
    let block_num = read_u64(reader.take(8)?);
    let slot_bytes = reader.take(4)?;
    let slot = u32::from_le_bytes([slot_bytes[0], slot_bytes[1], slot_bytes[2], slot_bytes[3]]);
    Ok((table, field, key_type, key, block_num, slot))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    u64::from_le_bytes(array)
}

struct LogState {
    file: File,
    active: Vec<u8>,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
}

/// Append-only log with an in-memory tail. A record is durable once
/// `flush` has been called with its LSN; the buffer pool relies on this to
/// enforce the write-ahead rule before reusing a dirty frame.
pub struct LogManager {
    state: Mutex<LogState>,
}

impl LogManager {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            state: Mutex::new(LogState {
                file,
                active: Vec::new(),
                next_lsn: len,
                flushed_lsn: len,
            }),
        })
    }

    /// Appends a record to the in-memory tail and returns its LSN. The
    /// record is not durable until `flush` covers the returned LSN.
    pub fn append(&self, record: &LogRecord) -> WalResult<Lsn> {
        let bytes = record.to_bytes()?;
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        state.active.extend_from_slice(&bytes);
        state.next_lsn += bytes.len() as u64;
        Ok(lsn)
    }

    /// Forces the log up to and including the record at `lsn`.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        let mut state = self.state.lock();
        if lsn < state.flushed_lsn {
            return Ok(());
        }
        Self::flush_active(&mut state)
    }

    /// Forces the entire in-memory tail.
    pub fn flush_all(&self) -> WalResult<()> {
        let mut state = self.state.lock();
        Self::flush_active(&mut state)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    fn flush_active(state: &mut LogState) -> WalResult<()> {
        if state.active.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut state.active);
        state.file.write_all(&bytes)?;
        state.file.sync_data()?;
        state.flushed_lsn = state.next_lsn;
        Ok(())
    }
}

/// Per-transaction recovery manager. Writes the transaction's lifecycle
/// records and the logical markers emitted by index operations.
pub struct RecoveryMgr {
    txn_id: TxnId,
    log_mgr: Arc<LogManager>,
}

impl RecoveryMgr {
    /// Creates the manager and logs the transaction start record.
    pub fn new(log_mgr: Arc<LogManager>, txn_id: TxnId) -> WalResult<Self> {
        log_mgr.append(&LogRecord::Start { txn_id })?;
        Ok(Self { txn_id, log_mgr })
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Commit is durable: the commit record is flushed before this returns.
    pub fn on_tx_commit(&self) -> WalResult<()> {
        let lsn = self.log_mgr.append(&LogRecord::Commit {
            txn_id: self.txn_id,
        })?;
        self.log_mgr.flush(lsn)
    }

    pub fn on_tx_rollback(&self) -> WalResult<()> {
        let lsn = self.log_mgr.append(&LogRecord::Rollback {
            txn_id: self.txn_id,
        })?;
        self.log_mgr.flush(lsn)
    }

    pub fn log_logical_start(&self) -> WalResult<Lsn> {
        self.log_mgr.append(&LogRecord::LogicalStart {
            txn_id: self.txn_id,
        })
    }

    pub fn log_index_insertion_end(
        &self,
        table: &str,
        field: &str,
        key_type: ConstantType,
        key: Constant,
        block_num: u64,
        slot: u32,
    ) -> WalResult<Lsn> {
        self.log_mgr.append(&LogRecord::IndexInsertEnd {
            txn_id: self.txn_id,
            table: table.to_string(),
            field: field.to_string(),
            key_type,
            key,
            block_num,
            slot,
        })
    }

    pub fn log_index_deletion_end(
        &self,
        table: &str,
        field: &str,
        key_type: ConstantType,
        key: Constant,
        block_num: u64,
        slot: u32,
    ) -> WalResult<Lsn> {
        self.log_mgr.append(&LogRecord::IndexDeleteEnd {
            txn_id: self.txn_id,
            table: table.to_string(),
            field: field.to_string(),
            key_type,
            key,
            block_num,
            slot,
        })
    }
}

/// Sequential reader over a log file, used by recovery and tests.
pub struct LogReader {
    file: File,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    pub fn next_record(&mut self) -> WalResult<Option<LogRecord>> {
        let mut len_bytes = [0u8; 4];
        let bytes_read = self.file.read(&mut len_bytes)?;
        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read < 4 {
            return Err(WalError::Corrupt("log record length truncated".to_string()));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < 4 {
            return Err(WalError::Corrupt("invalid log record length".to_string()));
        }
        let mut payload = vec![0u8; len - 4];
        self.file.read_exact(&mut payload)?;
        Ok(Some(LogRecord::from_bytes(&payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_markers_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let log_mgr = Arc::new(LogManager::open(&path).unwrap());
        let recovery = RecoveryMgr::new(Arc::clone(&log_mgr), 7).unwrap();

        recovery.log_logical_start().unwrap();
        recovery
            .log_index_insertion_end(
                "emp",
                "eid",
                ConstantType::Integer,
                Constant::Integer(42),
                3,
                5,
            )
            .unwrap();
        recovery.on_tx_commit().unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(
            records,
            vec![
                LogRecord::Start { txn_id: 7 },
                LogRecord::LogicalStart { txn_id: 7 },
                LogRecord::IndexInsertEnd {
                    txn_id: 7,
                    table: "emp".to_string(),
                    field: "eid".to_string(),
                    key_type: ConstantType::Integer,
                    key: Constant::Integer(42),
                    block_num: 3,
                    slot: 5,
                },
                LogRecord::Commit { txn_id: 7 },
            ]
        );
    }

    #[test]
    fn varchar_key_record_round_trips() {
        let record = LogRecord::IndexDeleteEnd {
            txn_id: 2,
            table: "dept".to_string(),
            field: "dname".to_string(),
            key_type: ConstantType::Varchar(20),
            key: Constant::Varchar("sales".to_string()),
            block_num: 9,
            slot: 1,
        };
        let bytes = record.to_bytes().unwrap();
        let decoded = LogRecord::from_bytes(&bytes[4..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn flush_is_idempotent_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let log_mgr = LogManager::open(&path).unwrap();
        let lsn1 = log_mgr.append(&LogRecord::Start { txn_id: 1 }).unwrap();
        let lsn2 = log_mgr.append(&LogRecord::Commit { txn_id: 1 }).unwrap();
        assert!(lsn1 < lsn2);
        log_mgr.flush(lsn2).unwrap();
        assert_eq!(log_mgr.flushed_lsn(), log_mgr.state.lock().next_lsn);
        // A second flush of an already-durable lsn is a no-op.
        log_mgr.flush(lsn1).unwrap();
    }

    #[test]
    fn reopen_continues_at_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let log_mgr = LogManager::open(&path).unwrap();
            let lsn = log_mgr.append(&LogRecord::Start { txn_id: 1 }).unwrap();
            log_mgr.flush(lsn).unwrap();
        }
        let log_mgr = LogManager::open(&path).unwrap();
        assert!(log_mgr.flushed_lsn() > 0);
        let lsn = log_mgr.append(&LogRecord::Commit { txn_id: 1 }).unwrap();
        log_mgr.flush(lsn).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let mut count = 0;
        while reader.next_record().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
