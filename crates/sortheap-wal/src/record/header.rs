//! Fixed frame in front of every log record.
//!
//! ```text
//!  0      4        8       16       24     25       26     27        32
//!  | crc  | length | lsn   | txn    | type | version | flags | zero... |
//! ```
//!
//! All integers are little-endian. The CRC covers bytes `4..32` of the
//! frame followed by the payload, so a torn length or type is caught the
//! same way as a torn payload.

use bytes::{Buf, BufMut};
use sortheap_common::constants::{WAL_FORMAT_VERSION, WAL_RECORD_HEADER_SIZE};
use sortheap_common::types::{Lsn, TxnId};

use super::types::{RecordFlags, RecordType};
use crate::error::{WalError, WalResult};

const CRC_END: usize = 4;
const RESERVED_START: usize = 27;

/// Decoded record frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Position of the record in the log.
    pub lsn: Lsn,
    /// Writer of the record, `INVALID` for system records.
    pub txn_id: TxnId,
    /// Payload kind.
    pub record_type: RecordType,
    /// Frame format version.
    pub version: u8,
    /// Record flags.
    pub flags: RecordFlags,
    /// Payload bytes after the frame.
    pub payload_length: u32,
    /// CRC32 of the frame tail and payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Encoded frame size.
    pub const SIZE: usize = WAL_RECORD_HEADER_SIZE;

    /// Frame for a payload of `payload_length` bytes; the checksum is
    /// filled in by [`RecordHeader::seal`].
    pub fn new(
        lsn: Lsn,
        txn_id: TxnId,
        record_type: RecordType,
        flags: RecordFlags,
        payload_length: u32,
    ) -> Self {
        Self {
            lsn,
            txn_id,
            record_type,
            version: WAL_FORMAT_VERSION,
            flags,
            payload_length,
            checksum: 0,
        }
    }

    fn encode_tail(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.payload_length);
        buf.put_u64_le(self.lsn.as_u64());
        buf.put_u64_le(self.txn_id.as_u64());
        buf.put_u8(self.record_type.as_u8());
        buf.put_u8(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_bytes(0, Self::SIZE - RESERVED_START);
    }

    /// Appends the encoded frame.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.checksum);
        self.encode_tail(buf);
    }

    /// Encoded frame.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        self.encode_into(&mut &mut out[..]);
        out
    }

    /// Decodes a frame. The checksum is not verified here.
    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(WalError::deserialization_error(format!(
                "record frame needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        if bytes[RESERVED_START..Self::SIZE].iter().any(|&b| b != 0) {
            return Err(WalError::deserialization_error("record frame padding is not zero"));
        }
        let mut buf = &bytes[..Self::SIZE];
        let checksum = buf.get_u32_le();
        let payload_length = buf.get_u32_le();
        let lsn = Lsn::new(buf.get_u64_le());
        let txn_id = TxnId::new(buf.get_u64_le());
        let record_type = RecordType::from_u8(buf.get_u8())?;
        let version = buf.get_u8();
        if version != WAL_FORMAT_VERSION {
            return Err(WalError::UnsupportedVersion {
                expected: WAL_FORMAT_VERSION,
                found: version,
            });
        }
        Ok(Self {
            lsn,
            txn_id,
            record_type,
            version,
            flags: RecordFlags::from_bits_truncate(buf.get_u8()),
            payload_length,
            checksum,
        })
    }

    /// Frame plus payload length.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.payload_length as usize
    }

    fn crc(&self, payload: &[u8]) -> u32 {
        let mut tail = [0u8; WAL_RECORD_HEADER_SIZE - CRC_END];
        self.encode_tail(&mut &mut tail[..]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&tail);
        hasher.update(payload);
        hasher.finalize()
    }

    /// Stores the checksum of the frame and `payload`.
    pub fn seal(&mut self, payload: &[u8]) {
        self.checksum = self.crc(payload);
    }

    /// Returns true if `payload` and the frame match the stored checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum == self.crc(payload)
    }
}
