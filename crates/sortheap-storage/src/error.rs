//! Storage errors.

use std::io;

use sortheap_common::error::{ErrorCode, SortHeapError};
use sortheap_common::types::{BlockId, BlockType};
use sortheap_wal::WalError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by pages, the buffer pool, the allocator and tapes.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum StorageError {
    /// I/O error from the block store.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Page checksum mismatch on load.
    #[error("checksum mismatch on block {block}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        block: BlockId,
        expected: u32,
        actual: u32,
    },

    /// Page contents are structurally invalid.
    #[error("block {block} is corrupted: {reason}")]
    Corrupted { block: BlockId, reason: String },

    /// Page read as the wrong type.
    #[error("block {block} has type {actual}, expected {expected}")]
    InvalidBlockType {
        block: BlockId,
        expected: BlockType,
        actual: BlockType,
    },

    /// Block beyond the end of the store.
    #[error("block {block} not found")]
    BlockNotFound { block: BlockId },

    /// Recycle of a block that is already free.
    #[error("double free of block {block}")]
    DoubleFree { block: BlockId },

    /// Allocate or recycle touching metadata or allocator pages.
    #[error("block {block} is reserved for metadata")]
    ReservedBlock { block: BlockId },

    /// Record can never fit in a block.
    #[error("record of {size} bytes exceeds maximum {max_size}")]
    RowTooLarge { size: usize, max_size: usize },

    /// Record does not fit in the remaining space of a page.
    #[error("block {block} has no room for {needed} bytes")]
    PageFull { block: BlockId, needed: usize },

    /// Slot index past the end of the slot array.
    #[error("slot {slot} out of range in block {block}")]
    SlotOutOfRange { block: BlockId, slot: u16 },

    /// Encoded row or tuple could not be decoded.
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// Column chunk could not be decompressed.
    #[error("compression error: {reason}")]
    Compression { reason: String },

    /// The pool refuses writes after a failed log append.
    #[error("buffer pool is poisoned after a failed log append")]
    Poisoned,

    /// Invalid argument or configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Log failure.
    #[error(transparent)]
    Wal(#[from] WalError),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(block: BlockId, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            block,
            reason: reason.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode {
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::Io,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumMismatch,
            Self::Corrupted { .. }
            | Self::ReservedBlock { .. }
            | Self::SlotOutOfRange { .. }
            | Self::Decode { .. }
            | Self::Compression { .. } => ErrorCode::Corruption,
            Self::InvalidBlockType { .. } => ErrorCode::InvalidBlockType,
            Self::BlockNotFound { .. } => ErrorCode::BlockNotFound,
            Self::DoubleFree { .. } => ErrorCode::DoubleFree,
            Self::RowTooLarge { .. } => ErrorCode::RowTooLarge,
            Self::PageFull { .. } => ErrorCode::Internal,
            Self::Poisoned => ErrorCode::WalWriteFailed,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Wal(err) => err.code(),
        }
    }

    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Returns true if the error is a structural invariant violation.
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

impl From<StorageError> for SortHeapError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io { source } => SortHeapError::Io { source },
            StorageError::ChecksumMismatch {
                block,
                expected,
                actual,
            } => SortHeapError::ChecksumMismatch {
                block,
                expected,
                actual,
            },
            StorageError::InvalidBlockType {
                block,
                expected,
                actual,
            } => SortHeapError::InvalidBlockType {
                block,
                expected,
                actual,
            },
            StorageError::DoubleFree { block } => SortHeapError::DoubleFree { block },
            StorageError::RowTooLarge { size, max_size } => {
                SortHeapError::RowTooLarge { size, max_size }
            }
            StorageError::BlockNotFound { block } => SortHeapError::BlockNotFound { block },
            StorageError::Wal(err) => err.into(),
            other => SortHeapError::component(other.code(), &other),
        }
    }
}
