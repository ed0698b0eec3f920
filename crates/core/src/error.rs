//! Error types for Tephra
//!
//! One unified error enum for the whole engine, built on `thiserror`.
//! Errors fall into two groups:
//!
//! - **Statement errors** (`DuplicateKey`, `MissingReplace`): the failed
//!   statement is rolled back by the caller, the transaction stays open.
//! - **State errors** (`TransactionConflict`, `TransactionCommitted`,
//!   `TransactionRolledBack`, `NoActiveTransaction`, `TransactionActive`):
//!   the requested lifecycle transition is not allowed.
//!
//! Internal invariant violations (a corrupt version chain, a failed
//! physical index rebind) are not represented here: they panic, because
//! no safe recovery exists from corrupted chain state.

use crate::types::SpaceId;
use thiserror::Error;

/// Result type alias for Tephra operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the Tephra engine
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A uniqueness violation in some index of a space.
    ///
    /// The index is identified by its position inside the space
    /// (0 is the primary index).
    #[error("duplicate key exists in unique index {index} of space {space}")]
    DuplicateKey {
        /// Space the statement was executed against
        space: SpaceId,
        /// Position of the violated index inside the space
        index: u32,
    },

    /// A replace required an existing tuple but found none.
    #[error("attempt to replace a missing tuple in primary index of space {space}")]
    MissingReplace {
        /// Space the statement was executed against
        space: SpaceId,
    },

    /// DML or commit/rollback issued while no transaction is open.
    #[error("no active transaction")]
    NoActiveTransaction,

    /// `txn_begin` while the fiber already carries a transaction.
    #[error("operation is not permitted when there is an active transaction")]
    TransactionActive,

    /// The transaction was aborted by a conflict with a concurrent
    /// writer. Observed when the owner tries to continue or complete it.
    #[error("transaction has been aborted by conflict")]
    TransactionConflict,

    /// The transaction was already committed.
    #[error("transaction was committed")]
    TransactionCommitted,

    /// The transaction was already rolled back.
    #[error("transaction was rolled back")]
    TransactionRolledBack,
}

impl Error {
    /// Check if this error is a serialization conflict.
    ///
    /// Conflicts are the only retryable failures: the caller may roll
    /// back and run the transaction again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::TransactionConflict)
    }

    /// Check if this error is a uniqueness violation
    /// (`DuplicateKey` or `MissingReplace`).
    pub fn is_duplicate_key(&self) -> bool {
        matches!(
            self,
            Error::DuplicateKey { .. } | Error::MissingReplace { .. }
        )
    }

    /// Check if this error reports an invalid lifecycle transition.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            Error::NoActiveTransaction
                | Error::TransactionActive
                | Error::TransactionCommitted
                | Error::TransactionRolledBack
        )
    }
}
