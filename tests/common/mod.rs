#![allow(dead_code)]

use ledgerd::application::bank::Bank;
use ledgerd::application::engine::{TransferEngine, TransferRequest};
use ledgerd::domain::account::{Account, AccountName, Balance};
use ledgerd::domain::policy::DesignatedAccount;
use ledgerd::domain::ports::LedgerStoreRef;
use ledgerd::infrastructure::in_memory::InMemoryLedgerStore;
use rust_decimal::Decimal;
use std::io::{Error, Write};
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const SYSTEM: &str = "SYSTEM";

pub fn name(value: &str) -> AccountName {
    AccountName::new(value).unwrap()
}

pub fn request(from: &str, to: &str, amount: Decimal) -> TransferRequest {
    TransferRequest::new(name(from), name(to), amount)
}

/// A bank over `store` where only `SYSTEM` may go below zero.
pub fn bank(store: &InMemoryLedgerStore) -> Bank {
    let store: LedgerStoreRef = Arc::new(store.clone());
    Bank::new(store, TransferEngine::new(DesignatedAccount::default()))
}

/// Opens `SYSTEM` plus the given accounts, funding each from `SYSTEM`.
pub async fn seed(bank: &Bank, accounts: &[(&str, Decimal)]) {
    bank.create_account(SYSTEM).await.unwrap();
    for (account, balance) in accounts {
        bank.create_account(account).await.unwrap();
        if !balance.is_zero() {
            bank.transfer(&request(SYSTEM, account, *balance))
                .await
                .unwrap();
        }
    }
}

pub async fn balance_of(bank: &Bank, account: &str) -> Balance {
    find(&bank.accounts().await.unwrap(), account).balance
}

pub fn find<'a>(accounts: &'a [Account], account: &str) -> &'a Account {
    accounts
        .iter()
        .find(|a| a.name.as_str() == account)
        .unwrap_or_else(|| panic!("account {account} not listed"))
}

/// Writes a command file with a header row.
pub fn command_file(rows: &[&str]) -> Result<NamedTempFile, Error> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "type, from, to, amount")?;
    for row in rows {
        writeln!(file, "{row}")?;
    }
    file.flush()?;
    Ok(file)
}
