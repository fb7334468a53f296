//! Transaction error types.

use thiserror::Error;

use sortheap_common::error::{ErrorCode, SortHeapError};
use sortheap_common::types::TxnId;

use crate::manager::TxnStatus;

/// Errors that can occur during transaction operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// Transaction not found.
    #[error("transaction not found: {0:?}")]
    NotFound(TxnId),
    /// Transaction is not active.
    #[error("transaction {txn_id:?} is not active ({status:?})")]
    NotActive {
        /// The transaction ID.
        txn_id: TxnId,
        /// Its current status.
        status: TxnStatus,
    },
    /// The commit or abort record could not be logged.
    #[error("failed to log transaction outcome: {0}")]
    Log(String),
    /// An advisory lock is held elsewhere.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),
}

impl TransactionError {
    /// Returns the stable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            TransactionError::NotFound(_) => ErrorCode::TransactionNotFound,
            TransactionError::NotActive { .. } => ErrorCode::TransactionNotActive,
            TransactionError::Log(_) => ErrorCode::WalWriteFailed,
            TransactionError::LockUnavailable(_) => ErrorCode::LockUnavailable,
        }
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// Returns true if the error must abort the operation.
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }
}

impl From<TransactionError> for SortHeapError {
    fn from(err: TransactionError) -> Self {
        SortHeapError::component(err.code(), &err)
    }
}

/// Result type for transaction operations.
pub type TxnResult<T> = Result<T, TransactionError>;
