//! WAL error types.
//!
//! This module defines all error types for the Write-Ahead Log.

use std::io;
use thiserror::Error;

use sortheap_common::error::{ErrorCode, SortHeapError};
use sortheap_common::types::Lsn;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during WAL operations.
    #[error("WAL I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// WAL record checksum mismatch.
    #[error("WAL record checksum mismatch at LSN {lsn}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        lsn: Lsn,
        expected: u32,
        computed: u32,
    },

    /// WAL record too large.
    #[error("WAL record too large: {size} bytes exceeds maximum {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    /// Unsupported record version.
    #[error("unsupported WAL record version {found}, expected {expected}")]
    UnsupportedVersion { expected: u8, found: u8 },

    /// WAL is closed after a failed write.
    #[error("WAL is closed after a failed write")]
    Closed,

    /// WAL record deserialization error.
    #[error("Failed to deserialize WAL record: {reason}")]
    DeserializationError { reason: String },

    /// Injected or simulated failure.
    #[error("WAL append failed: {reason}")]
    AppendFailed { reason: String },

    /// Configuration error.
    #[error("WAL configuration error: {reason}")]
    ConfigError { reason: String },
}

impl WalError {
    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    /// Creates a record too large error.
    pub fn record_too_large(size: usize, max: usize) -> Self {
        Self::RecordTooLarge { size, max }
    }

    /// Creates a deserialization error.
    pub fn deserialization_error(reason: impl Into<String>) -> Self {
        Self::DeserializationError {
            reason: reason.into(),
        }
    }

    /// Creates an append failure.
    pub fn append_failed(reason: impl Into<String>) -> Self {
        Self::AppendFailed {
            reason: reason.into(),
        }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } | Self::Closed | Self::AppendFailed { .. } => ErrorCode::WalWriteFailed,
            Self::RecordTooLarge { .. } => ErrorCode::InvalidArgument,
            Self::ConfigError { .. } => ErrorCode::InvalidConfig,
            Self::ChecksumMismatch { .. }
            | Self::UnsupportedVersion { .. }
            | Self::DeserializationError { .. } => ErrorCode::WalCorrupted,
        }
    }

    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Returns true if this error indicates damaged log contents.
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

impl From<WalError> for SortHeapError {
    fn from(err: WalError) -> Self {
        SortHeapError::component(err.code(), &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let err = WalError::checksum_mismatch(Lsn::new(3), 1, 2);
        assert_eq!(err.code(), ErrorCode::WalCorrupted);
        assert!(err.is_fatal());
        assert!(!WalError::Closed.is_fatal());
        assert_eq!(WalError::Closed.code().category(), "WAL");
    }

    #[test]
    fn test_into_sortheap_error() {
        let err: SortHeapError = WalError::append_failed("disk gone").into();
        assert_eq!(err.code(), ErrorCode::WalWriteFailed);
        assert_eq!(err.to_string(), "WAL append failed: disk gone");
    }
}
