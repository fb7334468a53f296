//! In-memory log sink.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use sortheap_common::constants::MAX_WAL_RECORD_SIZE;
use sortheap_common::types::{Lsn, TxnId};

use super::LogSink;
use crate::error::WalResult;
use crate::record::{decode_records, encode_record, WalPayload, WalRecord};

/// A log kept as one framed byte stream in memory.
///
/// The stream uses the same framing as [`super::FileWal`], so torn-tail and
/// checksum handling can be exercised without touching the filesystem.
#[derive(Debug)]
pub struct MemoryWal {
    inner: Mutex<Inner>,
    max_record_size: usize,
}

#[derive(Debug)]
struct Inner {
    stream: BytesMut,
    next_lsn: Lsn,
}

impl MemoryWal {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                stream: BytesMut::new(),
                next_lsn: Lsn::FIRST,
            }),
            max_record_size: MAX_WAL_RECORD_SIZE,
        }
    }

    /// Rebuilds a log from a previously captured stream, dropping any torn
    /// tail.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let (records, valid) = decode_records(&bytes, true);
        let next_lsn = records.last().map_or(Lsn::FIRST, |r| r.lsn().next());
        let mut stream = BytesMut::with_capacity(valid);
        stream.put_slice(&bytes[..valid]);
        Self {
            inner: Mutex::new(Inner { stream, next_lsn }),
            max_record_size: MAX_WAL_RECORD_SIZE,
        }
    }

    /// Returns a copy of the framed stream.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().stream)
    }

    /// Number of bytes in the stream.
    pub fn len(&self) -> usize {
        self.inner.lock().stream.len()
    }

    /// Returns true if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for MemoryWal {
    fn append(&self, txn_id: TxnId, payload: &WalPayload) -> WalResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let frame = encode_record(lsn, txn_id, payload, self.max_record_size)?;
        inner.stream.put_slice(&frame);
        inner.next_lsn = lsn.next();
        Ok(lsn)
    }

    fn flush(&self) -> WalResult<()> {
        Ok(())
    }

    fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().next_lsn.as_u64() - 1)
    }

    fn records_from(&self, lsn: Lsn) -> WalResult<Vec<WalRecord>> {
        let stream = self.to_bytes();
        let (records, _) = decode_records(&stream, true);
        Ok(records.into_iter().filter(|r| r.lsn() >= lsn).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_assigns_dense_lsns() {
        let wal = MemoryWal::new();
        assert!(wal.is_empty());
        assert_eq!(wal.append(TxnId::new(1), &WalPayload::Commit).unwrap(), Lsn::new(1));
        assert_eq!(wal.append(TxnId::new(2), &WalPayload::Abort).unwrap(), Lsn::new(2));
        assert_eq!(wal.next_lsn(), Lsn::new(3));
        assert_eq!(wal.durable_lsn(), Lsn::new(2));

        let records = wal.records_from(Lsn::new(2)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, WalPayload::Abort);
    }

    #[test]
    fn test_from_bytes_drops_torn_tail() {
        let wal = MemoryWal::new();
        wal.append(TxnId::new(1), &WalPayload::Commit).unwrap();
        wal.append(TxnId::new(2), &WalPayload::Commit).unwrap();
        let bytes = wal.to_bytes();
        let torn = bytes.slice(..bytes.len() - 1);

        let reopened = MemoryWal::from_bytes(torn);
        assert_eq!(reopened.records_from(Lsn::FIRST).unwrap().len(), 1);
        assert_eq!(reopened.next_lsn(), Lsn::new(2));
        assert_eq!(
            reopened.append(TxnId::new(3), &WalPayload::Commit).unwrap(),
            Lsn::new(2)
        );
    }
}
