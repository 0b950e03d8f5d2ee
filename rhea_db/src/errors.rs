use std::io;

use strata::lock_manager::LockError;
use strata::transaction::TxnId;
use strata::{PageNo, StorageError};

use crate::types::ColType;

/// Every error the core surfaces to callers. Data errors leave the
/// transaction alive for the caller to decide; lock violations must be
/// answered by aborting the transaction.
#[derive(Debug)]
pub enum Error {
    RecordNotFound { page_no: PageNo, slot_no: u32 },
    PageNotExist { page_no: PageNo },
    InvalidValueCount { expected: usize, given: usize },
    IncompatibleType { expected: ColType, given: ColType },
    ColumnNotFound(String),
    TableExists(String),
    TableNotFound(String),
    IndexExists(String),
    IndexNotFound(String),
    IndexEntryNotFound,
    LockOnShrinking(TxnId),
    DeadlockPrevention(TxnId),
    Internal(String),
    Io(io::Error),
}

impl Error {
    /// True for the concurrency errors that must abort the transaction.
    pub fn is_lock_violation(&self) -> bool {
        matches!(
            self,
            Error::LockOnShrinking(_) | Error::DeadlockPrevention(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        match err {
            LockError::LockOnShrinking(id) => Error::LockOnShrinking(id),
            LockError::DeadlockPrevention(id) => Error::DeadlockPrevention(id),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => Error::Io(e),
            StorageError::PageNotExist { page_no } => Error::PageNotExist { page_no },
            StorageError::RecordNotFound { page_no, slot_no } => {
                Error::RecordNotFound { page_no, slot_no }
            }
            StorageError::IndexEntryNotFound => Error::IndexEntryNotFound,
            StorageError::Lock(e) => e.into(),
            StorageError::Corrupted(msg) => Error::Internal(msg.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
