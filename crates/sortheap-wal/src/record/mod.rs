//! WAL record definitions.
//!
//! A record is a [`RecordHeader`] followed by the serialized
//! [`WalPayload`]. [`encode_record`] and [`decode_records`] implement the
//! framing shared by every log sink.

mod header;
mod page_op;
mod types;

pub use header::RecordHeader;
pub use page_op::PageOp;
pub use types::{decode_records, encode_record, RecordFlags, RecordType, WalPayload, WalRecord};
