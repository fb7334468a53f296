//! WAL record types and flags.
//!
//! This module defines the record types, the typed payload enum and the
//! framing used by every sink.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sortheap_common::types::{Lsn, TxnId};

use super::header::RecordHeader;
use super::page_op::PageOp;
use crate::error::{WalError, WalResult};

/// Record type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    /// An atomic group of page operations.
    PageOps = 1,
    /// Transaction commit.
    Commit = 2,
    /// Transaction abort/rollback.
    Abort = 3,
    /// Checkpoint.
    Checkpoint = 4,
}

impl RecordType {
    /// Converts the record type to a u8.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Creates a record type from a u8.
    pub fn from_u8(value: u8) -> WalResult<Self> {
        match value {
            1 => Ok(Self::PageOps),
            2 => Ok(Self::Commit),
            3 => Ok(Self::Abort),
            4 => Ok(Self::Checkpoint),
            _ => Err(WalError::deserialization_error(format!(
                "Unknown record type: {}",
                value
            ))),
        }
    }
}

bitflags::bitflags! {
    /// Flags for WAL records.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Record contains redo information.
        const REDO = 0b0000_0001;
        /// Record ends a transaction.
        const TXN_END = 0b0000_0010;
        /// Record marks a checkpoint.
        const CHECKPOINT = 0b0000_0100;
    }
}

/// WAL record payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalPayload {
    /// Page operations applied together.
    PageOps(Vec<PageOp>),
    /// Commit of the header's transaction.
    Commit,
    /// Abort of the header's transaction.
    Abort,
    /// Checkpoint: every record before `redo_lsn` is reflected on disk.
    Checkpoint {
        /// Where redo starts.
        redo_lsn: Lsn,
        /// Next transaction id to hand out.
        next_xid: TxnId,
    },
}

impl WalPayload {
    /// Returns the record type of this payload.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::PageOps(_) => RecordType::PageOps,
            Self::Commit => RecordType::Commit,
            Self::Abort => RecordType::Abort,
            Self::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    /// Returns the flags of this payload.
    pub fn flags(&self) -> RecordFlags {
        match self {
            Self::PageOps(_) => RecordFlags::REDO,
            Self::Commit | Self::Abort => RecordFlags::TXN_END,
            Self::Checkpoint { .. } => RecordFlags::CHECKPOINT,
        }
    }

    /// Serializes the payload.
    pub fn serialize(&self) -> Bytes {
        match self {
            Self::PageOps(ops) => {
                let size = 4 + ops.iter().map(PageOp::encoded_len).sum::<usize>();
                let mut buf = BytesMut::with_capacity(size);
                buf.put_u32(ops.len() as u32);
                for op in ops {
                    op.serialize(&mut buf);
                }
                buf.freeze()
            }
            Self::Commit | Self::Abort => Bytes::new(),
            Self::Checkpoint { redo_lsn, next_xid } => {
                let mut buf = BytesMut::with_capacity(16);
                buf.put_u64(redo_lsn.as_u64());
                buf.put_u64(next_xid.as_u64());
                buf.freeze()
            }
        }
    }

    /// Deserializes a payload of the given type.
    pub fn deserialize(record_type: RecordType, mut bytes: Bytes) -> WalResult<Self> {
        match record_type {
            RecordType::PageOps => {
                if bytes.remaining() < 4 {
                    return Err(WalError::deserialization_error("PageOps payload too short"));
                }
                let count = bytes.get_u32() as usize;
                let mut ops = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    ops.push(PageOp::deserialize(&mut bytes)?);
                }
                if bytes.has_remaining() {
                    return Err(WalError::deserialization_error(
                        "trailing bytes after page ops",
                    ));
                }
                Ok(Self::PageOps(ops))
            }
            RecordType::Commit => Ok(Self::Commit),
            RecordType::Abort => Ok(Self::Abort),
            RecordType::Checkpoint => {
                if bytes.remaining() < 16 {
                    return Err(WalError::deserialization_error(
                        "Checkpoint payload too short",
                    ));
                }
                Ok(Self::Checkpoint {
                    redo_lsn: Lsn::new(bytes.get_u64()),
                    next_xid: TxnId::new(bytes.get_u64()),
                })
            }
        }
    }
}

/// A complete WAL record with header and typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Record header.
    pub header: RecordHeader,
    /// Record payload.
    pub payload: WalPayload,
}

impl WalRecord {
    /// Returns the LSN of this record.
    pub fn lsn(&self) -> Lsn {
        self.header.lsn
    }

    /// Returns the transaction that wrote this record.
    pub fn txn_id(&self) -> TxnId {
        self.header.txn_id
    }
}

/// Encodes one framed record.
pub fn encode_record(
    lsn: Lsn,
    txn_id: TxnId,
    payload: &WalPayload,
    max_record_size: usize,
) -> WalResult<Bytes> {
    let body = payload.serialize();
    let total = RecordHeader::SIZE + body.len();
    if total > max_record_size {
        return Err(WalError::record_too_large(total, max_record_size));
    }
    let mut header = RecordHeader::new(
        lsn,
        txn_id,
        payload.record_type(),
        payload.flags(),
        body.len() as u32,
    );
    header.seal(&body);

    let mut buf = BytesMut::with_capacity(total);
    header.encode_into(&mut buf);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decodes framed records from a byte stream.
///
/// Returns the decoded records and the length of the valid prefix. Decoding
/// stops at the first truncated record or, when `verify` is set, at the first
/// checksum mismatch: that is a torn tail, not an error.
pub fn decode_records(stream: &Bytes, verify: bool) -> (Vec<WalRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while stream.len() - offset >= RecordHeader::SIZE {
        let header = match RecordHeader::decode(&stream[offset..offset + RecordHeader::SIZE]) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(offset, error = %err, "stopping WAL decode at unreadable header");
                break;
            }
        };
        let end = offset + header.total_size();
        if end > stream.len() {
            tracing::debug!(offset, lsn = %header.lsn, "torn WAL tail");
            break;
        }
        let body = stream.slice(offset + RecordHeader::SIZE..end);
        if verify && !header.verify(&body) {
            tracing::warn!(offset, lsn = %header.lsn, "WAL checksum mismatch, ignoring tail");
            break;
        }
        match WalPayload::deserialize(header.record_type, body) {
            Ok(payload) => records.push(WalRecord { header, payload }),
            Err(err) => {
                tracing::warn!(offset, error = %err, "stopping WAL decode at bad payload");
                break;
            }
        }
        offset = end;
    }

    (records, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sortheap_common::types::{BlockId, BlockType};

    fn sample_ops() -> WalPayload {
        WalPayload::PageOps(vec![
            PageOp::Init {
                block: BlockId::new(4),
                block_type: BlockType::Data,
            },
            PageOp::SlotAppend {
                block: BlockId::new(4),
                data: Bytes::from_static(b"abc"),
            },
        ])
    }

    #[test]
    fn test_payload_types() {
        assert_eq!(sample_ops().record_type(), RecordType::PageOps);
        assert_eq!(WalPayload::Commit.flags(), RecordFlags::TXN_END);
        for raw in 1..=4u8 {
            assert_eq!(RecordType::from_u8(raw).unwrap().as_u8(), raw);
        }
        assert!(RecordType::from_u8(0).is_err());
    }

    #[test]
    fn test_stream_decode() {
        let mut stream = BytesMut::new();
        let payloads = [
            sample_ops(),
            WalPayload::Commit,
            WalPayload::Checkpoint {
                redo_lsn: Lsn::new(2),
                next_xid: TxnId::new(9),
            },
        ];
        for (i, payload) in payloads.iter().enumerate() {
            let frame =
                encode_record(Lsn::new(i as u64 + 1), TxnId::new(5), payload, 1 << 20).unwrap();
            stream.put_slice(&frame);
        }
        let stream = stream.freeze();
        let (records, valid) = decode_records(&stream, true);
        assert_eq!(valid, stream.len());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].payload, payloads[0]);
        assert_eq!(records[2].lsn(), Lsn::new(3));
        assert_eq!(records[1].txn_id(), TxnId::new(5));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let a = encode_record(Lsn::new(1), TxnId::new(1), &sample_ops(), 1 << 20).unwrap();
        let b = encode_record(Lsn::new(2), TxnId::new(1), &WalPayload::Commit, 1 << 20).unwrap();
        let mut stream = BytesMut::new();
        stream.put_slice(&a);
        stream.put_slice(&b[..b.len() - 3]);
        let stream = stream.freeze();
        let (records, valid) = decode_records(&stream, true);
        assert_eq!(records.len(), 1);
        assert_eq!(valid, a.len());
    }

    #[test]
    fn test_corrupt_record_ends_log() {
        let a = encode_record(Lsn::new(1), TxnId::new(1), &sample_ops(), 1 << 20).unwrap();
        let b = encode_record(Lsn::new(2), TxnId::new(1), &sample_ops(), 1 << 20).unwrap();
        let mut stream = BytesMut::new();
        stream.put_slice(&a);
        stream.put_slice(&b);
        let last = stream.len() - 1;
        stream[last] ^= 0xFF;
        let (records, valid) = decode_records(&stream.freeze(), true);
        assert_eq!(records.len(), 1);
        assert_eq!(valid, a.len());
    }

    #[test]
    fn test_record_too_large() {
        let big = WalPayload::PageOps(vec![PageOp::SlotAppend {
            block: BlockId::new(1),
            data: Bytes::from(vec![0u8; 4096]),
        }]);
        assert!(matches!(
            encode_record(Lsn::new(1), TxnId::new(1), &big, 1024),
            Err(WalError::RecordTooLarge { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_any_prefix_decodes_whole_records(cut in 0usize..400) {
            let mut stream = BytesMut::new();
            for i in 1..=5u64 {
                let frame = encode_record(Lsn::new(i), TxnId::new(i), &sample_ops(), 1 << 20).unwrap();
                stream.put_slice(&frame);
            }
            let stream = stream.freeze();
            let cut = cut.min(stream.len());
            let prefix = stream.slice(..cut);
            let (records, valid) = decode_records(&prefix, true);
            proptest::prop_assert!(valid <= cut);
            for (i, record) in records.iter().enumerate() {
                proptest::prop_assert_eq!(record.lsn(), Lsn::new(i as u64 + 1));
            }
        }
    }
}
