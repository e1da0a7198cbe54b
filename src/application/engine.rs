use crate::domain::account::{Account, AccountName, Amount, Balance};
use crate::domain::payment::{NewPayment, Transaction};
use crate::domain::policy::OverdraftPolicy;
use crate::domain::ports::{Ledger, LedgerStore};
use crate::error::{LedgerError, Result, StoreError};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, error, info, warn};

/// A request to move `amount` from one account to another.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferRequest {
    pub from: AccountName,
    pub to: AccountName,
    pub amount: Decimal,
}

impl TransferRequest {
    pub fn new(from: AccountName, to: AccountName, amount: Decimal) -> Self {
        Self { from, to, amount }
    }
}

/// Which end of a transfer an account is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Sender,
    Receiver,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Sender => f.write_str("sender"),
            Side::Receiver => f.write_str("receiver"),
        }
    }
}

/// The step of a transfer that a store failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Begin,
    Lock(Side),
    InsertTransaction,
    InsertPayment(Side),
    UpdateBalance(Side),
    Commit,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStep::Begin => f.write_str("open transaction"),
            TransferStep::Lock(side) => write!(f, "lock {side} account"),
            TransferStep::InsertTransaction => f.write_str("insert transaction"),
            TransferStep::InsertPayment(Side::Sender) => f.write_str("insert outgoing payment"),
            TransferStep::InsertPayment(Side::Receiver) => f.write_str("insert incoming payment"),
            TransferStep::UpdateBalance(side) => write!(f, "update {side} balance"),
            TransferStep::Commit => f.write_str("commit"),
        }
    }
}

/// Moves funds between two accounts as one atomic, double-entry unit.
///
/// The engine holds no store of its own: every call receives the store it
/// should run against, and all coordination between concurrent transfers is
/// left to the store's row locks.
#[derive(Debug)]
pub struct TransferEngine {
    overdraft: Box<dyn OverdraftPolicy>,
}

impl TransferEngine {
    /// Creates a new `TransferEngine`.
    ///
    /// # Arguments
    ///
    /// * `overdraft` - Decides which accounts may end a transfer below zero.
    pub fn new(overdraft: impl OverdraftPolicy + 'static) -> Self {
        Self {
            overdraft: Box::new(overdraft),
        }
    }

    /// Transfers `request.amount` from `request.from` to `request.to`.
    ///
    /// On success exactly one transaction, two opposite payments and two
    /// balance updates have been committed. On failure nothing has.
    /// Same-account and non-positive transfers are rejected before the store
    /// is touched.
    pub async fn transfer(
        &self,
        store: &dyn LedgerStore,
        request: &TransferRequest,
    ) -> Result<Transaction> {
        let amount = validate(request)?;

        let mut ledger = store.begin().await.map_err(|source| {
            error!(step = %TransferStep::Begin, error = %source, "Failed to open transfer transaction");
            LedgerError::TransactionFailure {
                step: TransferStep::Begin,
                source,
            }
        })?;

        match self
            .execute(ledger.as_mut(), &request.from, &request.to, amount)
            .await
        {
            Ok(transaction) => {
                info!(
                    from = %request.from,
                    to = %request.to,
                    amount = %amount,
                    transaction_id = %transaction.id,
                    "Transfer committed"
                );
                Ok(transaction)
            }
            Err(err) => {
                rollback(ledger.as_mut()).await;
                if err.is_client_error() {
                    warn!(from = %request.from, to = %request.to, amount = %amount, error = %err, "Transfer rejected");
                } else {
                    error!(from = %request.from, to = %request.to, amount = %amount, error = %err, "Transfer failed");
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        ledger: &mut dyn Ledger,
        from: &AccountName,
        to: &AccountName,
        amount: Amount,
    ) -> Result<Transaction> {
        let [first, second] = lock_order(from, to);
        let first_account = lock(ledger, first).await?;
        let second_account = lock(ledger, second).await?;
        let (sender, receiver) = match first.0 {
            Side::Sender => (first_account, second_account),
            Side::Receiver => (second_account, first_account),
        };

        // Checked against the balance read under lock, never a cached one.
        if sender.balance < Balance::from(amount) && !self.overdraft.may_go_below_zero(&sender) {
            return Err(LedgerError::InsufficientFunds {
                account: sender.name,
                balance: sender.balance.value(),
                requested: amount.value(),
            });
        }

        let (sender_after, receiver_after) = sender
            .balance
            .checked_sub(amount)
            .zip(receiver.balance.checked_add(amount))
            .ok_or_else(|| {
                LedgerError::InvalidTransfer(format!(
                    "transferring {amount} would overflow a balance"
                ))
            })?;

        let transaction = ledger
            .insert_transaction()
            .await
            .map_err(failure(TransferStep::InsertTransaction))?;

        let [outgoing, incoming] = NewPayment::pair(transaction.id, &sender, &receiver, amount);
        ledger
            .insert_payment(&outgoing)
            .await
            .map_err(failure(TransferStep::InsertPayment(Side::Sender)))?;
        ledger
            .insert_payment(&incoming)
            .await
            .map_err(failure(TransferStep::InsertPayment(Side::Receiver)))?;

        ledger
            .update_balance(sender.id, sender_after)
            .await
            .map_err(failure(TransferStep::UpdateBalance(Side::Sender)))?;
        ledger
            .update_balance(receiver.id, receiver_after)
            .await
            .map_err(failure(TransferStep::UpdateBalance(Side::Receiver)))?;

        ledger
            .commit()
            .await
            .map_err(failure(TransferStep::Commit))?;

        Ok(transaction)
    }
}

fn validate(request: &TransferRequest) -> Result<Amount> {
    if request.from == request.to {
        return Err(LedgerError::InvalidTransfer(format!(
            "can't transfer funds from account {} to itself",
            request.from
        )));
    }
    Amount::new(request.amount)
}

/// Lock order for a transfer: the lexicographically greater name first,
/// whichever side it is on. Every concurrent transfer over the same pair of
/// accounts therefore locks them in the same order.
fn lock_order<'a>(from: &'a AccountName, to: &'a AccountName) -> [(Side, &'a AccountName); 2] {
    let sender = (Side::Sender, from);
    let receiver = (Side::Receiver, to);
    if from > to {
        [sender, receiver]
    } else {
        [receiver, sender]
    }
}

async fn lock(ledger: &mut dyn Ledger, (side, name): (Side, &AccountName)) -> Result<Account> {
    debug!(side = %side, account = %name, "Locking account");
    ledger
        .lock_account_for_update(name)
        .await
        .map_err(failure(TransferStep::Lock(side)))?
        .ok_or_else(|| LedgerError::AccountNotFound {
            side,
            name: name.clone(),
        })
}

async fn rollback(ledger: &mut dyn Ledger) {
    match ledger.rollback().await {
        Ok(()) => debug!("Transfer rolled back"),
        // A failed commit already closed the transaction.
        Err(StoreError::NoTransaction) => debug!("Nothing to roll back"),
        Err(err) => warn!(error = %err, "Rollback failed"),
    }
}

fn failure(step: TransferStep) -> impl FnOnce(StoreError) -> LedgerError {
    move |source| LedgerError::TransactionFailure { step, source }
}
