use super::account::{Account, AccountId, AccountName, Balance};
use super::payment::{NewPayment, Payment, Transaction};
use crate::error::StoreResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Operations a [`Ledger`] handle exposes, used to label store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    Begin,
    CreateAccount,
    LockAccount,
    InsertTransaction,
    InsertPayment,
    UpdateBalance,
    Commit,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOperation::Begin => "begin",
            StoreOperation::CreateAccount => "create account",
            StoreOperation::LockAccount => "lock account",
            StoreOperation::InsertTransaction => "insert transaction",
            StoreOperation::InsertPayment => "insert payment",
            StoreOperation::UpdateBalance => "update balance",
            StoreOperation::Commit => "commit",
        };
        f.write_str(name)
    }
}

/// An execution handle on the ledger store.
///
/// A handle is either a plain connection, where every write is its own
/// atomic unit, or transaction-scoped, where writes stay invisible until
/// [`Ledger::commit`] and row locks are held until the handle commits, rolls
/// back or is dropped. Dropping an uncommitted transaction handle discards
/// its writes.
#[async_trait]
pub trait Ledger: Send {
    /// Whether this handle currently has an open transaction.
    fn in_transaction(&self) -> bool;

    /// Makes all staged writes visible atomically and releases row locks.
    ///
    /// Once issued, the commit runs to completion even if the caller's
    /// future is dropped.
    async fn commit(&mut self) -> StoreResult<()>;

    /// Discards staged writes. Fails with `NoTransaction` when there is
    /// nothing to roll back; callers may treat that as benign.
    async fn rollback(&mut self) -> StoreResult<()>;

    async fn create_account(&mut self, name: &AccountName) -> StoreResult<Account>;

    /// Takes an exclusive row lock on the named account and returns its
    /// current balance. Blocks while another transaction holds the lock.
    async fn lock_account_for_update(&mut self, name: &AccountName)
    -> StoreResult<Option<Account>>;

    async fn insert_transaction(&mut self) -> StoreResult<Transaction>;

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<()>;

    async fn update_balance(&mut self, account: AccountId, balance: Balance) -> StoreResult<()>;

    /// Committed accounts in creation order.
    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>>;

    /// Committed payments ordered by transaction, outgoing before incoming.
    async fn list_payments(&mut self) -> StoreResult<Vec<Payment>>;
}

pub type LedgerBox = Box<dyn Ledger>;

/// Hands out execution handles. Implemented by every storage backend.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// A plain, auto-committing handle.
    async fn connect(&self) -> StoreResult<LedgerBox>;

    /// A transaction-scoped handle.
    async fn begin(&self) -> StoreResult<LedgerBox>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
