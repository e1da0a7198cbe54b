use crate::application::engine::{Side, TransferStep};
use crate::domain::account::{AccountId, AccountName};
use crate::domain::ports::StoreOperation;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failures reported by a storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no open transaction on this handle")]
    NoTransaction,
    #[error("handle is closed")]
    HandleClosed,
    #[error("account name already taken: {0}")]
    DuplicateAccount(String),
    #[error("unknown account id {0}")]
    UnknownAccount(AccountId),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error(
        "balance of account {account} ({balance}) does not match the sum of its payments ({posted})"
    )]
    InvariantViolation {
        account: AccountId,
        balance: Decimal,
        posted: Decimal,
    },
    #[error("injected fault at {0}")]
    Injected(StoreOperation),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        let message: String = message.into();
        StoreError::Backend(message.into())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

#[cfg(feature = "storage-postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Errors surfaced by the ledger's application layer.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),
    #[error("invalid account name: {0:?}")]
    InvalidAccountName(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("account already exists: {0}")]
    DuplicateAccount(String),
    #[error("{side} account not found: {name}")]
    AccountNotFound { side: Side, name: AccountName },
    #[error("insufficient funds on account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountName,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("transfer failed at step '{step}': {source}")]
    TransactionFailure {
        step: TransferStep,
        #[source]
        source: StoreError,
    },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Whether the caller, rather than the ledger, is at fault.
    ///
    /// Client errors are final; server errors may be retried by the caller
    /// at its own discretion.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidTransfer(_)
                | LedgerError::InvalidAccountName(_)
                | LedgerError::InvalidCommand(_)
                | LedgerError::DuplicateAccount(_)
                | LedgerError::AccountNotFound { .. }
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::Csv(_)
        )
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
