use crate::domain::account::{Account, AccountId, Balance};
use crate::domain::payment::{NewPayment, Transaction, TransactionId};
use crate::error::{StoreError, StoreResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An account row together with the signed sum of its committed payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAccount {
    pub account: Account,
    pub posted: Decimal,
}

impl StoredAccount {
    pub fn new(account: Account) -> Self {
        let posted = account.balance.value();
        Self { account, posted }
    }
}

/// Writes buffered by a transaction-scoped handle until commit.
#[derive(Debug, Default)]
pub struct Staged {
    pub accounts: Vec<Account>,
    pub transactions: Vec<Transaction>,
    pub payments: Vec<NewPayment>,
    pub balances: BTreeMap<AccountId, Balance>,
}

impl Staged {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.transactions.is_empty()
            && self.payments.is_empty()
            && self.balances.is_empty()
    }

    pub fn balance(&self, account: AccountId) -> Option<Balance> {
        self.balances.get(&account).copied()
    }

    pub fn has_account(&self, account: AccountId) -> bool {
        self.accounts.iter().any(|a| a.id == account)
    }

    pub fn has_transaction(&self, transaction: TransactionId) -> bool {
        self.transactions.iter().any(|t| t.id == transaction)
    }

    /// Applies the staged writes on top of the committed rows returned by
    /// `committed` and returns every account row the unit changes.
    ///
    /// Fails without side effects if any resulting balance differs from the
    /// signed sum of that account's payments.
    pub fn settle<F>(&self, mut committed: F) -> StoreResult<Vec<StoredAccount>>
    where
        F: FnMut(AccountId) -> StoreResult<Option<StoredAccount>>,
    {
        let mut rows: BTreeMap<AccountId, StoredAccount> = self
            .accounts
            .iter()
            .map(|account| (account.id, StoredAccount::new(account.clone())))
            .collect();

        let touched = self
            .payments
            .iter()
            .map(|p| p.account)
            .chain(self.balances.keys().copied());
        for id in touched {
            if !rows.contains_key(&id) {
                let row = committed(id)?.ok_or(StoreError::UnknownAccount(id))?;
                rows.insert(id, row);
            }
        }

        for payment in &self.payments {
            if !rows.contains_key(&payment.counterparty) && committed(payment.counterparty)?.is_none()
            {
                return Err(StoreError::Constraint(format!(
                    "payment counterparty {} does not exist",
                    payment.counterparty
                )));
            }
            if let Some(row) = rows.get_mut(&payment.account) {
                row.posted = row
                    .posted
                    .checked_add(payment.signed_amount())
                    .ok_or_else(|| {
                        StoreError::Constraint(format!(
                            "payments of account {} overflow",
                            payment.account
                        ))
                    })?;
            }
        }

        for (id, balance) in &self.balances {
            if let Some(row) = rows.get_mut(id) {
                row.account.balance = *balance;
            }
        }

        for row in rows.values() {
            if row.account.balance.value() != row.posted {
                return Err(StoreError::InvariantViolation {
                    account: row.account.id,
                    balance: row.account.balance.value(),
                    posted: row.posted,
                });
            }
        }

        Ok(rows.into_values().collect())
    }
}
