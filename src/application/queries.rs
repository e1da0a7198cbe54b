//! Read accessors and account creation. None of these take row locks; reads
//! see committed state only.

use crate::domain::account::{Account, AccountName};
use crate::domain::payment::Payment;
use crate::domain::ports::LedgerStore;
use crate::error::{LedgerError, Result, StoreError};
use tracing::info;

/// Opens a new account with a zero balance.
pub async fn create_account(store: &dyn LedgerStore, name: &str) -> Result<Account> {
    let name = AccountName::new(name)?;
    let mut ledger = store.connect().await?;
    match ledger.create_account(&name).await {
        Ok(account) => {
            info!(account = %account.name, id = %account.id, "Account created");
            Ok(account)
        }
        Err(StoreError::DuplicateAccount(name)) => Err(LedgerError::DuplicateAccount(name)),
        Err(err) => Err(err.into()),
    }
}

pub async fn list_accounts(store: &dyn LedgerStore) -> Result<Vec<Account>> {
    let mut ledger = store.connect().await?;
    Ok(ledger.list_accounts().await?)
}

pub async fn list_payments(store: &dyn LedgerStore) -> Result<Vec<Payment>> {
    let mut ledger = store.connect().await?;
    Ok(ledger.list_payments().await?)
}
