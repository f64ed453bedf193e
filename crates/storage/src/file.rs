use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::page::{Page, BLOCK_SIZE};
use crate::BlockId;

/// Block-oriented file manager. Each named file is a flat array of
/// fixed-size blocks; the manager reports file lengths in blocks and appends
/// whole blocks at the end.
pub struct FileManager {
    db_dir: PathBuf,
    open_files: Mutex<HashMap<String, File>>,
}

impl FileManager {
    pub fn new(db_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let db_dir = db_dir.into();
        std::fs::create_dir_all(&db_dir)?;
        Ok(Self {
            db_dir,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    /// Reads block `blk` into `page`. Reading past the end of the file
    /// yields zeroed bytes, matching the contents of a never-written block.
    pub fn read(&self, blk: &BlockId, page: &mut Page) -> io::Result<()> {
        self.with_file(blk.file_name(), |file| {
            let offset = blk.number() * BLOCK_SIZE as u64;
            let buf = page.as_mut_slice();
            buf.fill(0);
            let mut pos = 0;
            while pos < buf.len() {
                let read = file.read_at(&mut buf[pos..], offset + pos as u64)?;
                if read == 0 {
                    break;
                }
                pos += read;
            }
            Ok(())
        })
    }

    /// Writes `page` to block `blk`.
    pub fn write(&self, blk: &BlockId, page: &Page) -> io::Result<()> {
        self.with_file(blk.file_name(), |file| {
            let offset = blk.number() * BLOCK_SIZE as u64;
            file.write_all_at(page.as_slice(), offset)
        })
    }

    /// Appends `page` as a new block at the end of `file_name` and returns
    /// its id. Appends to the same file are serialized by the manager.
    pub fn append(&self, file_name: &str, page: &Page) -> io::Result<BlockId> {
        self.with_file(file_name, |file| {
            let num = file.metadata()?.len() / BLOCK_SIZE as u64;
            file.write_all_at(page.as_slice(), num * BLOCK_SIZE as u64)?;
            file.sync_data()?;
            Ok(BlockId::new(file_name, num))
        })
    }

    /// Length of `file_name` in blocks.
    pub fn size(&self, file_name: &str) -> io::Result<u64> {
        self.with_file(file_name, |file| {
            Ok(file.metadata()?.len() / BLOCK_SIZE as u64)
        })
    }

    fn with_file<T>(&self, name: &str, op: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let mut files = self.open_files.lock();
        let file = match files.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.db_dir.join(name);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                entry.insert(file)
            }
        };
        op(file)
    }
}
