use super::engine::{TransferEngine, TransferRequest};
use super::queries;
use crate::domain::account::Account;
use crate::domain::payment::{Payment, Transaction};
use crate::domain::ports::LedgerStoreRef;
use crate::error::Result;

/// Entry point for callers of the ledger.
///
/// `Bank` pairs an injected store with a transfer engine. It is cheap to
/// share behind an `Arc`; concurrent calls are coordinated by the store.
pub struct Bank {
    store: LedgerStoreRef,
    engine: TransferEngine,
}

impl Bank {
    pub fn new(store: LedgerStoreRef, engine: TransferEngine) -> Self {
        Self { store, engine }
    }

    pub async fn create_account(&self, name: &str) -> Result<Account> {
        queries::create_account(self.store.as_ref(), name).await
    }

    pub async fn accounts(&self) -> Result<Vec<Account>> {
        queries::list_accounts(self.store.as_ref()).await
    }

    pub async fn payments(&self) -> Result<Vec<Payment>> {
        queries::list_payments(self.store.as_ref()).await
    }

    pub async fn transfer(&self, request: &TransferRequest) -> Result<Transaction> {
        self.engine.transfer(self.store.as_ref(), request).await
    }
}
