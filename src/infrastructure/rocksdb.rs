use super::row_locks::{RowGuard, RowLocks};
use super::staging::{Staged, StoredAccount};
use crate::domain::account::{Account, AccountId, AccountName, Balance};
use crate::domain::payment::{AccountRef, Direction, NewPayment, Payment, Transaction, TransactionId};
use crate::domain::ports::{Ledger, LedgerBox, LedgerStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Column Family for account rows, keyed by account id.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family mapping account names to ids.
pub const CF_ACCOUNT_NAMES: &str = "account_names";
/// Column Family for ledger transactions, keyed by transaction id.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for payments, keyed by transaction id and direction.
pub const CF_PAYMENTS: &str = "payments";

/// A persistent ledger store implementation using RocksDB.
///
/// Keys are big-endian ids so iteration follows creation order. RocksDB has
/// no row locks of its own; transaction handles take them from an in-process
/// lock table and commit through a single atomic `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    locks: RowLocks,
    last_account: Arc<AtomicI64>,
    last_transaction: Arc<AtomicI64>,
    commits: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist and resumes id
    /// allocation after the highest stored ids.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ACCOUNTS, CF_ACCOUNT_NAMES, CF_TRANSACTIONS, CF_PAYMENTS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        let last_account = last_id(&db, CF_ACCOUNTS)?;
        let last_transaction = last_id(&db, CF_TRANSACTIONS)?;
        info!(last_account, last_transaction, "RocksDB ledger store opened");

        Ok(Self {
            db: Arc::new(db),
            locks: RowLocks::new(),
            last_account: Arc::new(AtomicI64::new(last_account)),
            last_transaction: Arc::new(AtomicI64::new(last_transaction)),
            commits: Arc::new(Mutex::new(())),
        })
    }

    fn handle(&self, scope: Scope) -> LedgerBox {
        Box::new(RocksDBLedger {
            store: self.clone(),
            scope,
        })
    }

    fn account(&self, id: AccountId) -> StoreResult<Option<StoredAccount>> {
        get_json(&self.db, CF_ACCOUNTS, &id.0.to_be_bytes())
    }

    fn account_id(&self, name: &AccountName) -> StoreResult<Option<AccountId>> {
        let cf = cf(&self.db, CF_ACCOUNT_NAMES)?;
        match self.db.get_cf(cf, name.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(AccountId(decode_id(&bytes)?))),
            None => Ok(None),
        }
    }

    fn transaction_exists(&self, id: TransactionId) -> StoreResult<bool> {
        let cf = cf(&self.db, CF_TRANSACTIONS)?;
        Ok(self.db.get_pinned_cf(cf, id.0.to_be_bytes())?.is_some())
    }

    /// Applies `staged` with a single atomic write on a blocking thread.
    ///
    /// The write runs to completion even if the awaiting future is dropped.
    async fn apply(&self, staged: Staged, guards: Vec<RowGuard>) -> StoreResult<()> {
        let db = Arc::clone(&self.db);
        let commits = Arc::clone(&self.commits);
        tokio::task::spawn_blocking(move || {
            let result = apply_blocking(&db, &commits, staged);
            drop(guards);
            result
        })
        .await?
    }
}

fn apply_blocking(db: &DB, commits: &Mutex<()>, staged: Staged) -> StoreResult<()> {
    let _serialized = commits
        .lock()
        .map_err(|_| StoreError::backend("commit lock poisoned"))?;

    let names = cf(db, CF_ACCOUNT_NAMES)?;
    for account in &staged.accounts {
        if db.get_pinned_cf(names, account.name.as_str().as_bytes())?.is_some() {
            return Err(StoreError::DuplicateAccount(account.name.to_string()));
        }
    }

    let rows = staged.settle(|id| get_json(db, CF_ACCOUNTS, &id.0.to_be_bytes()))?;

    let mut batch = WriteBatch::default();
    let accounts = cf(db, CF_ACCOUNTS)?;
    for row in &rows {
        batch.put_cf(accounts, row.account.id.0.to_be_bytes(), to_json(row)?);
    }
    for account in &staged.accounts {
        batch.put_cf(names, account.name.as_str().as_bytes(), account.id.0.to_be_bytes());
    }
    let transactions = cf(db, CF_TRANSACTIONS)?;
    for transaction in &staged.transactions {
        batch.put_cf(transactions, transaction.id.0.to_be_bytes(), to_json(transaction)?);
    }
    let payments = cf(db, CF_PAYMENTS)?;
    for payment in &staged.payments {
        batch.put_cf(
            payments,
            payment_key(payment.transaction, payment.direction),
            to_json(payment)?,
        );
    }

    db.write(batch)?;
    debug!(accounts = rows.len(), payments = staged.payments.len(), "RocksDB batch written");
    Ok(())
}

fn cf<'a>(db: &'a DB, name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::backend(format!("{name} column family not found")))
}

fn get_json<T: DeserializeOwned>(db: &DB, family: &str, key: &[u8]) -> StoreResult<Option<T>> {
    match db.get_cf(cf(db, family)?, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn to_json<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

fn decode_id(bytes: &[u8]) -> StoreResult<i64> {
    let bytes: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::backend("malformed id key"))?;
    Ok(i64::from_be_bytes(bytes))
}

fn last_id(db: &DB, family: &str) -> StoreResult<i64> {
    match db.iterator_cf(cf(db, family)?, IteratorMode::End).next() {
        Some(item) => {
            let (key, _) = item?;
            decode_id(&key)
        }
        None => Ok(0),
    }
}

fn payment_key(transaction: TransactionId, direction: Direction) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[..8].copy_from_slice(&transaction.0.to_be_bytes());
    key[8] = direction.rank();
    key
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn connect(&self) -> StoreResult<LedgerBox> {
        Ok(self.handle(Scope::Connection))
    }

    async fn begin(&self) -> StoreResult<LedgerBox> {
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

/// Execution handle on a [`RocksDBStore`].
pub struct RocksDBLedger {
    store: RocksDBStore,
    scope: Scope,
}

impl RocksDBLedger {
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

    /// Stages a write, or writes it at once on a plain connection.
    async fn write<F>(&mut self, write: F, guard: Option<RowGuard>) -> StoreResult<()>
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
                self.store.apply(staged, guard.into_iter().collect()).await
            }
            Scope::Finished => Err(StoreError::HandleClosed),
        }
    }

    fn account_exists(&self, id: AccountId) -> StoreResult<bool> {
        if self.staged().is_some_and(|s| s.has_account(id)) {
            return Ok(true);
        }
        Ok(self.store.account(id)?.is_some())
    }
}

#[async_trait]
impl Ledger for RocksDBLedger {
    fn in_transaction(&self) -> bool {
        matches!(self.scope, Scope::Transaction { .. })
    }

    async fn commit(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.scope, Scope::Finished) {
            Scope::Transaction { staged, guards } => {
                if staged.is_empty() {
                    return Ok(());
                }
                self.store
                    .apply(staged, guards.into_values().collect())
                    .await
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
        self.ensure_open()?;
        let staged_duplicate = self
            .staged()
            .is_some_and(|s| s.accounts.iter().any(|a| &a.name == name));
        if staged_duplicate || self.store.account_id(name)?.is_some() {
            return Err(StoreError::DuplicateAccount(name.to_string()));
        }

        let id = self.store.last_account.fetch_add(1, Ordering::SeqCst) + 1;
        let account = Account::open(AccountId(id), name.clone());
        let staged = account.clone();
        self.write(move |s| s.accounts.push(staged), None).await?;
        Ok(account)
    }

    async fn lock_account_for_update(
        &mut self,
        name: &AccountName,
    ) -> StoreResult<Option<Account>> {
        self.ensure_open()?;
        if let Some(account) = self
            .staged()
            .and_then(|s| s.accounts.iter().find(|a| &a.name == name))
        {
            return Ok(Some(account.clone()));
        }

        let Some(id) = self.store.account_id(name)? else {
            return Ok(None);
        };

        if let Scope::Transaction { guards, .. } = &mut self.scope
            && !guards.contains_key(&id)
        {
            let guard = self.store.locks.acquire(id).await;
            guards.insert(id, guard);
        }

        let Some(row) = self.store.account(id)? else {
            return Ok(None);
        };
        let mut account = row.account;
        if let Some(balance) = self.staged().and_then(|s| s.balance(id)) {
            account.balance = balance;
        }
        Ok(Some(account))
    }

    async fn insert_transaction(&mut self) -> StoreResult<Transaction> {
        self.ensure_open()?;
        let id = self.store.last_transaction.fetch_add(1, Ordering::SeqCst) + 1;
        let transaction = Transaction {
            id: TransactionId(id),
            created_at: Utc::now(),
        };
        let staged = transaction.clone();
        self.write(move |s| s.transactions.push(staged), None).await?;
        Ok(transaction)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<()> {
        self.ensure_open()?;
        let transaction_known = self
            .staged()
            .is_some_and(|s| s.has_transaction(payment.transaction))
            || self.store.transaction_exists(payment.transaction)?;
        if !transaction_known {
            return Err(StoreError::Constraint(format!(
                "payment references unknown transaction {}",
                payment.transaction
            )));
        }
        for id in [payment.account, payment.counterparty] {
            if !self.account_exists(id)? {
                return Err(StoreError::Constraint(format!(
                    "payment references unknown account {id}"
                )));
            }
        }

        let staged = payment.clone();
        self.write(move |s| s.payments.push(staged), None).await
    }

    async fn update_balance(&mut self, account: AccountId, balance: Balance) -> StoreResult<()> {
        self.ensure_open()?;
        if !self.account_exists(account)? {
            return Err(StoreError::UnknownAccount(account));
        }
        let guard = match self.scope {
            Scope::Connection => Some(self.store.locks.acquire(account).await),
            _ => None,
        };
        self.write(
            move |s| {
                s.balances.insert(account, balance);
            },
            guard,
        )
        .await
    }

    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>> {
        self.ensure_open()?;
        let db = &self.store.db;
        let mut accounts = Vec::new();
        for item in db.iterator_cf(cf(db, CF_ACCOUNTS)?, IteratorMode::Start) {
            let (_key, value) = item?;
            let row: StoredAccount = serde_json::from_slice(&value)?;
            accounts.push(row.account);
        }
        Ok(accounts)
    }

    async fn list_payments(&mut self) -> StoreResult<Vec<Payment>> {
        let accounts: HashMap<AccountId, AccountRef> = self
            .list_accounts()
            .await?
            .iter()
            .map(|a| (a.id, AccountRef::from(a)))
            .collect();
        let resolve = |id: AccountId| {
            accounts
                .get(&id)
                .cloned()
                .ok_or(StoreError::UnknownAccount(id))
        };

        let db = &self.store.db;
        let mut payments = Vec::new();
        for item in db.iterator_cf(cf(db, CF_PAYMENTS)?, IteratorMode::Start) {
            let (_key, value) = item?;
            let payment: NewPayment = serde_json::from_slice(&value)?;
            let transaction: Transaction =
                get_json(db, CF_TRANSACTIONS, &payment.transaction.0.to_be_bytes())?.ok_or_else(
                    || StoreError::Constraint(format!("unknown transaction {}", payment.transaction)),
                )?;
            payments.push(Payment {
                account: resolve(payment.account)?,
                counterparty: resolve(payment.counterparty)?,
                transaction,
                direction: payment.direction,
                amount: payment.amount.value(),
                currency: payment.currency,
            });
        }
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Amount;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn name(value: &str) -> AccountName {
        AccountName::new(value).unwrap()
    }

    async fn transfer(store: &RocksDBStore, from: &str, to: &str, amount: Amount) {
        let mut tx = store.begin().await.unwrap();
        let sender = tx.lock_account_for_update(&name(from)).await.unwrap().unwrap();
        let receiver = tx.lock_account_for_update(&name(to)).await.unwrap().unwrap();
        let t = tx.insert_transaction().await.unwrap();
        for payment in NewPayment::pair(t.id, &sender, &receiver, amount) {
            tx.insert_payment(&payment).await.unwrap();
        }
        tx.update_balance(sender.id, sender.balance - Balance::from(amount))
            .await
            .unwrap();
        tx.update_balance(receiver.id, receiver.balance + Balance::from(amount))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");

        for family in [CF_ACCOUNTS, CF_ACCOUNT_NAMES, CF_TRANSACTIONS, CF_PAYMENTS] {
            assert!(store.db.cf_handle(family).is_some());
        }
    }

    #[tokio::test]
    async fn test_rocksdb_transfer_is_committed_atomically() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let mut conn = store.connect().await.unwrap();
        conn.create_account(&name("SYSTEM")).await.unwrap();
        conn.create_account(&name("john")).await.unwrap();

        transfer(&store, "SYSTEM", "john", Amount::new(dec!(9999)).unwrap()).await;

        let accounts = conn.list_accounts().await.unwrap();
        assert_eq!(accounts[0].balance, Balance::new(dec!(-9999)));
        assert_eq!(accounts[1].balance, Balance::new(dec!(9999)));
        let payments = conn.list_payments().await.unwrap();
        assert_eq!(payments.len(), 2);
        assert_eq!(payments[0].direction, Direction::Outgoing);
        assert_eq!(payments[1].direction, Direction::Incoming);
    }

    #[tokio::test]
    async fn test_rocksdb_rollback_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let mut conn = store.connect().await.unwrap();
        conn.create_account(&name("a")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.lock_account_for_update(&name("a")).await.unwrap();
        tx.insert_transaction().await.unwrap();
        tx.rollback().await.unwrap();

        assert!(matches!(tx.rollback().await, Err(StoreError::NoTransaction)));
        assert!(conn.list_payments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rocksdb_rejects_unbalanced_update() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();
        let mut conn = store.connect().await.unwrap();
        let account = conn.create_account(&name("a")).await.unwrap();

        let err = conn
            .update_balance(account.id, Balance::new(dec!(10)))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn test_rocksdb_reopen_resumes_ids() {
        let dir = tempdir().unwrap();
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            let mut conn = store.connect().await.unwrap();
            conn.create_account(&name("SYSTEM")).await.unwrap();
            conn.create_account(&name("john")).await.unwrap();
            transfer(&store, "SYSTEM", "john", Amount::new(dec!(5)).unwrap()).await;
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        let mut conn = store.connect().await.unwrap();
        let next = conn.create_account(&name("jane")).await.unwrap();
        assert_eq!(next.id, AccountId(3));
        assert!(matches!(
            conn.create_account(&name("john")).await,
            Err(StoreError::DuplicateAccount(_))
        ));
        transfer(&store, "john", "jane", Amount::new(dec!(2)).unwrap()).await;

        let payments = conn.list_payments().await.unwrap();
        assert_eq!(payments.len(), 4);
        assert_eq!(payments[2].transaction.id, TransactionId(2));
    }
}
