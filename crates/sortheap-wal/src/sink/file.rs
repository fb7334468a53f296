//! File-backed log sink.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use sortheap_common::types::{Lsn, TxnId};
use tracing::{debug, info, warn};

use super::LogSink;
use crate::config::{SyncPolicy, WalConfig};
use crate::error::{WalError, WalResult};
use crate::record::{decode_records, encode_record, WalPayload, WalRecord};

/// A log stored in one append-only file.
///
/// Opening an existing file truncates any torn tail left by a crash. A write
/// failure closes the log: later appends fail with [`WalError::Closed`].
#[derive(Debug)]
pub struct FileWal {
    config: WalConfig,
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    writer: BufWriter<File>,
    next_lsn: Lsn,
    durable_lsn: Lsn,
    failed: bool,
}

impl FileWal {
    /// Opens (or creates) the log described by `config`.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        config
            .validate()
            .map_err(|reason| WalError::ConfigError {
                reason: reason.to_string(),
            })?;
        fs::create_dir_all(&config.dir)?;
        let path = config.path();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let contents = Bytes::from(contents);
        let (records, valid) = decode_records(&contents, config.verify_checksums);
        if valid < contents.len() {
            warn!(
                path = %path.display(),
                valid,
                total = contents.len(),
                "truncating torn WAL tail"
            );
            file.set_len(valid as u64)?;
        }
        file.seek(SeekFrom::Start(valid as u64))?;

        let last = records.last().map_or(Lsn::INVALID, WalRecord::lsn);
        info!(path = %path.display(), records = records.len(), last_lsn = %last, "opened WAL");

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                next_lsn: last.next(),
                durable_lsn: last,
                failed: false,
            }),
            config,
        })
    }

    /// Returns the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> WalResult<Bytes> {
        let mut file = File::open(&self.path)?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(Bytes::from(contents))
    }
}

impl Inner {
    fn sync(&mut self) -> WalResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.durable_lsn = Lsn::new(self.next_lsn.as_u64() - 1);
        Ok(())
    }
}

impl LogSink for FileWal {
    fn append(&self, txn_id: TxnId, payload: &WalPayload) -> WalResult<Lsn> {
        let mut inner = self.inner.lock();
        if inner.failed {
            return Err(WalError::Closed);
        }
        let lsn = inner.next_lsn;
        let frame = encode_record(lsn, txn_id, payload, self.config.max_record_size)?;

        let written = inner.writer.write_all(&frame);
        if let Err(err) = written {
            inner.failed = true;
            return Err(err.into());
        }
        inner.next_lsn = lsn.next();

        if self.config.sync_policy == SyncPolicy::EveryWrite {
            if let Err(err) = inner.sync() {
                inner.failed = true;
                return Err(err);
            }
        }
        Ok(lsn)
    }

    fn flush(&self) -> WalResult<()> {
        let mut inner = self.inner.lock();
        if inner.failed {
            return Err(WalError::Closed);
        }
        let result = inner.sync();
        if result.is_err() {
            inner.failed = true;
        }
        result
    }

    fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    fn durable_lsn(&self) -> Lsn {
        self.inner.lock().durable_lsn
    }

    fn records_from(&self, lsn: Lsn) -> WalResult<Vec<WalRecord>> {
        {
            let mut inner = self.inner.lock();
            if !inner.failed {
                inner.writer.flush()?;
            }
        }
        let contents = self.read_all()?;
        let (records, _) = decode_records(&contents, self.config.verify_checksums);
        debug!(from = %lsn, total = records.len(), "read WAL records");
        Ok(records.into_iter().filter(|r| r.lsn() >= lsn).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reopen_continues_lsns() {
        let dir = TempDir::new().unwrap();
        {
            let wal = FileWal::open(WalConfig::new(dir.path())).unwrap();
            assert_eq!(wal.append(TxnId::new(1), &WalPayload::Commit).unwrap(), Lsn::new(1));
            assert_eq!(wal.append(TxnId::new(2), &WalPayload::Abort).unwrap(), Lsn::new(2));
            assert_eq!(wal.durable_lsn(), Lsn::new(2));
        }
        let wal = FileWal::open(WalConfig::new(dir.path())).unwrap();
        assert_eq!(wal.next_lsn(), Lsn::new(3));
        let records = wal.records_from(Lsn::FIRST).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, WalPayload::Abort);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::for_testing(dir.path());
        {
            let wal = FileWal::open(config.clone()).unwrap();
            wal.append(TxnId::new(1), &WalPayload::Commit).unwrap();
            wal.append(TxnId::new(2), &WalPayload::Commit).unwrap();
            wal.flush().unwrap();
        }
        let len = fs::metadata(config.path()).unwrap().len();
        let file = OpenOptions::new().write(true).open(config.path()).unwrap();
        file.set_len(len - 5).unwrap();
        drop(file);

        let wal = FileWal::open(config.clone()).unwrap();
        assert_eq!(wal.records_from(Lsn::FIRST).unwrap().len(), 1);
        assert_eq!(wal.append(TxnId::new(3), &WalPayload::Abort).unwrap(), Lsn::new(2));
        wal.flush().unwrap();

        let records = wal.records_from(Lsn::FIRST).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].txn_id(), TxnId::new(3));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = WalConfig::new(dir.path()).with_max_record_size(1);
        assert!(matches!(
            FileWal::open(config),
            Err(WalError::ConfigError { .. })
        ));
    }
}
