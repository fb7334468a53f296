//! File-backed block store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sortheap_common::types::BlockId;
use tracing::debug;

use super::{check_len, BlockStore};
use crate::error::{StorageError, StorageResult};

/// A block store on a single file, block `n` at offset `n * block_size`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    num_blocks: AtomicU64,
}

impl FileStore {
    /// Opens or creates the store file.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(StorageError::invalid_argument(format!(
                "{} has length {len}, not a multiple of {block_size}",
                path.display()
            )));
        }
        let num_blocks = len / block_size as u64;
        debug!(path = %path.display(), num_blocks, "opened block store");

        Ok(Self {
            path,
            file: Mutex::new(file),
            block_size,
            num_blocks: AtomicU64::new(num_blocks),
        })
    }

    /// Path of the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks.load(Ordering::Acquire)
    }

    fn read_block(&self, block: BlockId, buf: &mut [u8]) -> StorageResult<()> {
        check_len(self, block, buf.len())?;
        if block.as_u64() >= self.num_blocks() {
            buf.fill(0);
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block.offset(self.block_size)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block: BlockId, buf: &[u8]) -> StorageResult<()> {
        check_len(self, block, buf.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(block.offset(self.block_size)))?;
        file.write_all(buf)?;
        self.num_blocks
            .fetch_max(block.as_u64() + 1, Ordering::AcqRel);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}
