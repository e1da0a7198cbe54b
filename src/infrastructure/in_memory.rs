use super::row_locks::{RowGuard, RowLocks};
use super::staging::{Staged, StoredAccount};
use crate::domain::account::{Account, AccountId, AccountName, Balance};
use crate::domain::payment::{AccountRef, NewPayment, Payment, Transaction, TransactionId};
use crate::domain::ports::{Ledger, LedgerBox, LedgerStore, StoreOperation};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, StoredAccount>,
    names: HashMap<AccountName, AccountId>,
    transactions: BTreeMap<TransactionId, Transaction>,
    payments: Vec<NewPayment>,
    last_account: i64,
    last_transaction: i64,
}

impl State {
    fn apply(&mut self, staged: Staged) -> StoreResult<()> {
        if let Some(taken) = staged
            .accounts
            .iter()
            .find(|a| self.names.contains_key(&a.name))
        {
            return Err(StoreError::DuplicateAccount(taken.name.to_string()));
        }

        let rows = staged.settle(|id| Ok(self.accounts.get(&id).cloned()))?;

        for row in rows {
            self.names.insert(row.account.name.clone(), row.account.id);
            self.accounts.insert(row.account.id, row);
        }
        self.transactions
            .extend(staged.transactions.into_iter().map(|t| (t.id, t)));
        self.payments.extend(staged.payments);
        Ok(())
    }

    fn account_ref(&self, id: AccountId) -> StoreResult<AccountRef> {
        self.accounts
            .get(&id)
            .map(|row| AccountRef::from(&row.account))
            .ok_or(StoreError::UnknownAccount(id))
    }

    fn resolve(&self, payment: &NewPayment) -> StoreResult<Payment> {
        let transaction = self
            .transactions
            .get(&payment.transaction)
            .cloned()
            .ok_or_else(|| {
                StoreError::Constraint(format!("unknown transaction {}", payment.transaction))
            })?;
        Ok(Payment {
            account: self.account_ref(payment.account)?,
            counterparty: self.account_ref(payment.counterparty)?,
            transaction,
            direction: payment.direction,
            amount: payment.amount.value(),
            currency: payment.currency,
        })
    }
}

#[derive(Debug)]
struct Fault {
    operation: StoreOperation,
    after: usize,
}

/// A thread-safe in-memory ledger store.
///
/// Behaves like a relational store with row-level locking: transaction
/// handles stage their writes, hold exclusive row locks on the accounts they
/// lock, and apply everything atomically on commit after checking that every
/// balance still equals the sum of its payments.
///
/// Doubles as a test store: faults can be injected into any operation,
/// commits can be paused and every call is counted.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<State>>,
    locks: RowLocks,
    faults: Arc<Mutex<Vec<Fault>>>,
    calls: Arc<AtomicUsize>,
    commit_gate: Arc<RwLock<()>>,
}

/// Holds every issued commit before it is applied, until dropped.
pub struct CommitPause {
    _gate: OwnedRwLockWriteGuard<()>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `operation` fail once, after it has succeeded `after` more
    /// times.
    pub async fn inject_fault(&self, operation: StoreOperation, after: usize) {
        self.faults.lock().await.push(Fault { operation, after });
    }

    /// Parks issued commits until the returned guard is dropped.
    pub async fn pause_commits(&self) -> CommitPause {
        CommitPause {
            _gate: Arc::clone(&self.commit_gate).write_owned().await,
        }
    }

    /// Number of store calls made so far, including opening handles.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn trip(&self, operation: StoreOperation) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock().await;
        if let Some(pos) = faults.iter().position(|f| f.operation == operation) {
            if faults[pos].after == 0 {
                faults.remove(pos);
                return Err(StoreError::Injected(operation));
            }
            faults[pos].after -= 1;
        }
        Ok(())
    }

    fn handle(&self, scope: Scope) -> LedgerBox {
        Box::new(InMemoryLedger {
            store: self.clone(),
            scope,
        })
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn connect(&self) -> StoreResult<LedgerBox> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.handle(Scope::Connection))
    }

    async fn begin(&self) -> StoreResult<LedgerBox> {
        self.trip(StoreOperation::Begin).await?;
        Ok(self.handle(Scope::Transaction {
            staged: Staged::default(),
            guards: HashMap::new(),
        }))
    }
}

enum Scope {
    Connection,
    Transaction {
        staged: Staged,
        guards: HashMap<AccountId, RowGuard>,
    },
    Finished,
}

/// Execution handle on an [`InMemoryLedgerStore`].
pub struct InMemoryLedger {
    store: InMemoryLedgerStore,
    scope: Scope,
}

impl InMemoryLedger {
    fn ensure_open(&self) -> StoreResult<()> {
        match self.scope {
            Scope::Finished => Err(StoreError::HandleClosed),
            _ => Ok(()),
        }
    }

    fn staged(&self) -> Option<&Staged> {
        match &self.scope {
            Scope::Transaction { staged, .. } => Some(staged),
            _ => None,
        }
    }

    /// Stages a write, or applies it at once on a plain connection.
    async fn write<F>(&mut self, write: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Staged) + Send,
    {
        match &mut self.scope {
            Scope::Transaction { staged, .. } => {
                write(staged);
                Ok(())
            }
            Scope::Connection => {
                let mut staged = Staged::default();
                write(&mut staged);
                self.store.state.write().await.apply(staged)
            }
            Scope::Finished => Err(StoreError::HandleClosed),
        }
    }

    async fn account_exists(&self, id: AccountId) -> bool {
        self.staged().is_some_and(|s| s.has_account(id))
            || self.store.state.read().await.accounts.contains_key(&id)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    fn in_transaction(&self) -> bool {
        matches!(self.scope, Scope::Transaction { .. })
    }

    async fn commit(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.scope, Scope::Finished) {
            Scope::Transaction { staged, guards } => {
                self.store.trip(StoreOperation::Commit).await?;
                let state = Arc::clone(&self.store.state);
                let gate = Arc::clone(&self.store.commit_gate);
                // Detached so that a dropped caller can't interrupt the apply.
                tokio::spawn(async move {
                    let _open = gate.read().await;
                    let result = state.write().await.apply(staged);
                    debug!(locks = guards.len(), ok = result.is_ok(), "In-memory commit applied");
                    drop(guards);
                    result
                })
                .await?
            }
            other => {
                self.scope = other;
                Err(StoreError::NoTransaction)
            }
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.scope, Scope::Finished) {
            Scope::Transaction { .. } => Ok(()),
            other => {
                self.scope = other;
                Err(StoreError::NoTransaction)
            }
        }
    }

    async fn create_account(&mut self, name: &AccountName) -> StoreResult<Account> {
        self.store.trip(StoreOperation::CreateAccount).await?;
        self.ensure_open()?;
        if self
            .staged()
            .is_some_and(|s| s.accounts.iter().any(|a| &a.name == name))
        {
            return Err(StoreError::DuplicateAccount(name.to_string()));
        }

        let account = {
            let mut state = self.store.state.write().await;
            if state.names.contains_key(name) {
                return Err(StoreError::DuplicateAccount(name.to_string()));
            }
            state.last_account += 1;
            Account::open(AccountId(state.last_account), name.clone())
        };

        let staged = account.clone();
        self.write(move |s| s.accounts.push(staged)).await?;
        Ok(account)
    }

    async fn lock_account_for_update(
        &mut self,
        name: &AccountName,
    ) -> StoreResult<Option<Account>> {
        self.store.trip(StoreOperation::LockAccount).await?;
        self.ensure_open()?;
        if let Some(account) = self
            .staged()
            .and_then(|s| s.accounts.iter().find(|a| &a.name == name))
        {
            return Ok(Some(account.clone()));
        }

        let id = {
            let state = self.store.state.read().await;
            match state.names.get(name) {
                Some(id) => *id,
                None => return Ok(None),
            }
        };

        if let Scope::Transaction { guards, .. } = &mut self.scope
            && !guards.contains_key(&id)
        {
            let guard = self.store.locks.acquire(id).await;
            guards.insert(id, guard);
        }

        let mut account = {
            let state = self.store.state.read().await;
            match state.accounts.get(&id) {
                Some(row) => row.account.clone(),
                None => return Ok(None),
            }
        };
        if let Some(balance) = self.staged().and_then(|s| s.balance(id)) {
            account.balance = balance;
        }
        Ok(Some(account))
    }

    async fn insert_transaction(&mut self) -> StoreResult<Transaction> {
        self.store.trip(StoreOperation::InsertTransaction).await?;
        self.ensure_open()?;
        let transaction = {
            let mut state = self.store.state.write().await;
            state.last_transaction += 1;
            Transaction {
                id: TransactionId(state.last_transaction),
                created_at: Utc::now(),
            }
        };
        let staged = transaction.clone();
        self.write(move |s| s.transactions.push(staged)).await?;
        Ok(transaction)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<()> {
        self.store.trip(StoreOperation::InsertPayment).await?;
        self.ensure_open()?;
        let transaction_known = self
            .staged()
            .is_some_and(|s| s.has_transaction(payment.transaction))
            || self
                .store
                .state
                .read()
                .await
                .transactions
                .contains_key(&payment.transaction);
        if !transaction_known {
            return Err(StoreError::Constraint(format!(
                "payment references unknown transaction {}",
                payment.transaction
            )));
        }
        for id in [payment.account, payment.counterparty] {
            if !self.account_exists(id).await {
                return Err(StoreError::Constraint(format!(
                    "payment references unknown account {id}"
                )));
            }
        }

        let staged = payment.clone();
        self.write(move |s| s.payments.push(staged)).await
    }

    async fn update_balance(&mut self, account: AccountId, balance: Balance) -> StoreResult<()> {
        self.store.trip(StoreOperation::UpdateBalance).await?;
        self.ensure_open()?;
        if !self.account_exists(account).await {
            return Err(StoreError::UnknownAccount(account));
        }
        // A plain connection still waits for any transaction holding the row.
        let _guard = match self.scope {
            Scope::Connection => Some(self.store.locks.acquire(account).await),
            _ => None,
        };
        self.write(move |s| {
            s.balances.insert(account, balance);
        })
        .await
    }

    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>> {
        self.store.calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        let state = self.store.state.read().await;
        Ok(state.accounts.values().map(|r| r.account.clone()).collect())
    }

    async fn list_payments(&mut self) -> StoreResult<Vec<Payment>> {
        self.store.calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        let state = self.store.state.read().await;
        let mut payments = state
            .payments
            .iter()
            .map(|p| state.resolve(p))
            .collect::<StoreResult<Vec<_>>>()?;
        payments.sort_by_key(|p| (p.transaction.id, p.direction.rank()));
        Ok(payments)
    }
}
