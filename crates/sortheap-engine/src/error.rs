//! Engine errors.

use sortheap_common::error::{ErrorCode, SortHeapError};
use sortheap_common::types::{RelationId, TxnId};
use sortheap_storage::StorageError;
use sortheap_txn::TransactionError;
use sortheap_wal::WalError;
use thiserror::Error;

use crate::tapeset::TapeSetStatus;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the TapeSet engine and the façade.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum EngineError {
    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Transaction service failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Log failure.
    #[error(transparent)]
    Wal(#[from] WalError),

    /// Every TapeSet is locked by someone else.
    #[error("all TapeSets busy: {reason}")]
    TapeSetBusy { reason: String },

    /// A transaction the operation depends on is not visible yet.
    #[error("not yet: {reason}")]
    NotYet { reason: String },

    /// The operation is rejected unconditionally.
    #[error("operation not supported: {operation}")]
    NotSupported { operation: &'static str },

    /// Illegal TapeSet status transition.
    #[error("TapeSet {tapeset}: illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        tapeset: usize,
        from: TapeSetStatus,
        to: TapeSetStatus,
    },

    /// Persistent state contradicts itself.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Bad argument or configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The session is not usable.
    #[error("session for {relation} is closed")]
    SessionClosed { relation: RelationId },

    /// A background task panicked or was lost.
    #[error("worker failed: {message}")]
    Worker { message: String },
}

impl EngineError {
    pub(crate) fn not_yet(xid: TxnId, what: &str) -> Self {
        Self::NotYet {
            reason: format!("{what} transaction {xid} is not visible yet"),
        }
    }

    pub(crate) fn busy(reason: impl Into<String>) -> Self {
        Self::TapeSetBusy {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(err) => err.code(),
            Self::Transaction(err) => err.code(),
            Self::Wal(err) => err.code(),
            Self::TapeSetBusy { .. } => ErrorCode::TapeSetBusy,
            Self::NotYet { .. } => ErrorCode::NotYet,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidTransition { .. } | Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::SessionClosed { .. } => ErrorCode::TransactionNotActive,
            Self::Worker { .. } => ErrorCode::Internal,
        }
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Returns true if the error is a structural invariant violation.
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

impl From<EngineError> for SortHeapError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Storage(err) => err.into(),
            EngineError::Transaction(err) => err.into(),
            EngineError::TapeSetBusy { reason } => SortHeapError::TapeSetBusy { reason },
            EngineError::NotYet { reason } => SortHeapError::NotYet { reason },
            EngineError::NotSupported { operation } => SortHeapError::not_supported(operation),
            EngineError::InvalidArgument { message } => SortHeapError::invalid_argument(message),
            EngineError::InvalidState { message } => SortHeapError::InvalidState { message },
            other => SortHeapError::component(other.code(), &other),
        }
    }
}
