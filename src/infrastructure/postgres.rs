use crate::domain::account::{Account, AccountId, AccountName, Balance, Currency};
use crate::domain::payment::{AccountRef, Direction, NewPayment, Payment, Transaction, TransactionId};
use crate::domain::ports::{Ledger, LedgerBox, LedgerStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgDatabaseError, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// SQLSTATE raised by the balance trigger in `migrations/0001_ledger.sql`.
const INVARIANT_SQLSTATE: &str = "LD001";

const MIGRATION: &str = include_str!("../../migrations/0001_ledger.sql");

const SELECT_ACCOUNT_FOR_UPDATE: &str =
    "SELECT id, name, balance, currency FROM accounts WHERE name = $1 FOR UPDATE";

const SELECT_PAYMENTS: &str = r#"
    SELECT
        owners.id AS owner_id,
        owners.name AS owner_name,
        counterparties.id AS counterparty_id,
        counterparties.name AS counterparty_name,
        transactions.id AS transaction_id,
        transactions.created_at,
        payments.direction,
        payments.amount,
        payments.currency
    FROM payments
    INNER JOIN accounts AS owners ON payments.account_id = owners.id
    INNER JOIN accounts AS counterparties ON payments.counterparty_id = counterparties.id
    INNER JOIN transactions ON payments.transaction_id = transactions.id
    ORDER BY transactions.id, CASE payments.direction WHEN 'outgoing' THEN 0 ELSE 1 END
"#;

/// Ledger store backed by PostgreSQL.
///
/// Row locks are `SELECT ... FOR UPDATE`; the balance invariant is a
/// deferred constraint trigger checked when the database transaction
/// commits.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connects a pool to `database_url`.
    pub async fn open(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the ledger schema if it does not exist yet.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn connect(&self) -> StoreResult<LedgerBox> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgLedger {
            scope: Scope::Connection(conn),
        }))
    }

    async fn begin(&self) -> StoreResult<LedgerBox> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedger {
            scope: Scope::Transaction(tx),
        }))
    }
}

enum Scope {
    Connection(PoolConnection<Postgres>),
    Transaction(sqlx::Transaction<'static, Postgres>),
    Finished,
}

/// Execution handle on a [`PgLedgerStore`]. Dropping an open transaction
/// handle rolls the database transaction back.
pub struct PgLedger {
    scope: Scope,
}

impl PgLedger {
    fn conn(&mut self) -> StoreResult<&mut PgConnection> {
        match &mut self.scope {
            Scope::Connection(conn) => Ok(&mut **conn),
            Scope::Transaction(tx) => Ok(&mut **tx),
            Scope::Finished => Err(StoreError::HandleClosed),
        }
    }
}

/// Translates constraint failures into their store-level meaning.
fn store_error(err: sqlx::Error) -> StoreError {
    let sqlx::Error::Database(db) = &err else {
        return err.into();
    };

    if db.code().as_deref() == Some(INVARIANT_SQLSTATE) {
        let violation = db
            .try_downcast_ref::<PgDatabaseError>()
            .and_then(|e| e.detail())
            .and_then(parse_violation);
        if let Some(violation) = violation {
            return violation;
        }
    }
    if db.is_foreign_key_violation() || db.is_check_violation() || db.is_unique_violation() {
        return StoreError::Constraint(db.message().to_string());
    }
    err.into()
}

fn parse_violation(detail: &str) -> Option<StoreError> {
    let mut parts = detail.split('|');
    let account = parts.next()?.parse().ok()?;
    let balance = Decimal::from_str(parts.next()?).ok()?;
    let posted = Decimal::from_str(parts.next()?).ok()?;
    Some(StoreError::InvariantViolation {
        account: AccountId(account),
        balance,
        posted,
    })
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let name: String = row.try_get("name")?;
    let currency: String = row.try_get("currency")?;
    Ok(Account {
        id: AccountId(row.try_get("id")?),
        name: AccountName::new(name).map_err(|e| StoreError::backend(e.to_string()))?,
        balance: Balance::new(row.try_get("balance")?),
        currency: Currency::from_str(&currency).map_err(StoreError::backend)?,
    })
}

fn payment_from_row(row: &PgRow) -> StoreResult<Payment> {
    let named = |id: &str, name: &str| -> StoreResult<AccountRef> {
        let value: String = row.try_get(name)?;
        Ok(AccountRef {
            id: AccountId(row.try_get(id)?),
            name: AccountName::new(value).map_err(|e| StoreError::backend(e.to_string()))?,
        })
    };
    let direction: String = row.try_get("direction")?;
    let currency: String = row.try_get("currency")?;

    Ok(Payment {
        account: named("owner_id", "owner_name")?,
        counterparty: named("counterparty_id", "counterparty_name")?,
        transaction: Transaction {
            id: TransactionId(row.try_get("transaction_id")?),
            created_at: row.try_get("created_at")?,
        },
        direction: Direction::from_str(&direction).map_err(StoreError::backend)?,
        amount: row.try_get("amount")?,
        currency: Currency::from_str(&currency).map_err(StoreError::backend)?,
    })
}

#[async_trait]
impl Ledger for PgLedger {
    fn in_transaction(&self) -> bool {
        matches!(self.scope, Scope::Transaction(_))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.scope, Scope::Finished) {
            Scope::Transaction(tx) => {
                // Detached so that dropping the caller cannot abandon a commit
                // already sent to the server.
                tokio::spawn(async move { tx.commit().await })
                    .await?
                    .map_err(store_error)?;
                debug!("PostgreSQL transaction committed");
                Ok(())
            }
            other => {
                self.scope = other;
                Err(StoreError::NoTransaction)
            }
        }
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        match std::mem::replace(&mut self.scope, Scope::Finished) {
            Scope::Transaction(tx) => Ok(tx.rollback().await?),
            other => {
                self.scope = other;
                Err(StoreError::NoTransaction)
            }
        }
    }

    async fn create_account(&mut self, name: &AccountName) -> StoreResult<Account> {
        let currency = Currency::default();
        let result = sqlx::query(
            "INSERT INTO accounts(name, balance, currency) VALUES ($1, 0, $2) RETURNING id",
        )
        .bind(name.as_str())
        .bind(currency.as_str())
        .fetch_one(self.conn()?)
        .await;

        match result {
            Ok(row) => Ok(Account::open(AccountId(row.try_get("id")?), name.clone())),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateAccount(name.to_string()))
            }
            Err(err) => Err(store_error(err)),
        }
    }

    async fn lock_account_for_update(
        &mut self,
        name: &AccountName,
    ) -> StoreResult<Option<Account>> {
        let row = sqlx::query(SELECT_ACCOUNT_FOR_UPDATE)
            .bind(name.as_str())
            .fetch_optional(self.conn()?)
            .await
            .map_err(store_error)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn insert_transaction(&mut self) -> StoreResult<Transaction> {
        let row = sqlx::query("INSERT INTO transactions(created_at) VALUES (NOW()) RETURNING id, created_at")
            .fetch_one(self.conn()?)
            .await
            .map_err(store_error)?;
        Ok(Transaction {
            id: TransactionId(row.try_get("id")?),
            created_at: row.try_get("created_at")?,
        })
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments(
                transaction_id,
                account_id,
                counterparty_id,
                direction,
                amount,
                currency
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(payment.transaction.0)
        .bind(payment.account.0)
        .bind(payment.counterparty.0)
        .bind(payment.direction.as_str())
        .bind(payment.amount.value())
        .bind(payment.currency.as_str())
        .execute(self.conn()?)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn update_balance(&mut self, account: AccountId, balance: Balance) -> StoreResult<()> {
        let result = sqlx::query("UPDATE accounts SET balance = $1 WHERE id = $2")
            .bind(balance.value())
            .bind(account.0)
            .execute(self.conn()?)
            .await
            .map_err(store_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownAccount(account));
        }
        Ok(())
    }

    async fn list_accounts(&mut self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT id, name, balance, currency FROM accounts ORDER BY id")
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn list_payments(&mut self) -> StoreResult<Vec<Payment>> {
        let rows = sqlx::query(SELECT_PAYMENTS)
            .fetch_all(self.conn()?)
            .await
            .map_err(store_error)?;
        rows.iter().map(payment_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::Amount;
    use rust_decimal_macros::dec;

    async fn store() -> PgLedgerStore {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/ledgerd?sslmode=disable".to_string());
        let store = PgLedgerStore::open(&url).await.expect("database not reachable");
        store.migrate().await.unwrap();
        store
    }

    fn unique(prefix: &str) -> AccountName {
        AccountName::new(format!("{prefix}-{}", rand::random::<u32>())).unwrap()
    }

    #[test]
    fn test_parse_violation_detail() {
        let parsed = parse_violation("7|10.5|0");
        assert!(matches!(
            parsed,
            Some(StoreError::InvariantViolation { account: AccountId(7), balance, posted })
                if balance == dec!(10.5) && posted == dec!(0)
        ));
        assert!(parse_violation("garbage").is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_transfer_round() {
        let store = store().await;
        let mut conn = store.connect().await.unwrap();
        let (a, b) = (unique("sender"), unique("receiver"));
        conn.create_account(&a).await.unwrap();
        conn.create_account(&b).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let sender = tx.lock_account_for_update(&a).await.unwrap().unwrap();
        let receiver = tx.lock_account_for_update(&b).await.unwrap().unwrap();
        let t = tx.insert_transaction().await.unwrap();
        let amount = Amount::new(dec!(3)).unwrap();
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

        let payments = conn.list_payments().await.unwrap();
        let ours: Vec<_> = payments.iter().filter(|p| p.transaction.id == t.id).collect();
        assert_eq!(ours.len(), 2);
        assert_eq!(ours[0].direction, Direction::Outgoing);
        assert_eq!(ours[0].account.name, a);
    }

    #[tokio::test]
    #[ignore]
    async fn test_postgres_duplicate_and_invariant() {
        let store = store().await;
        let mut conn = store.connect().await.unwrap();
        let name = unique("dup");
        let account = conn.create_account(&name).await.unwrap();

        assert!(matches!(
            conn.create_account(&name).await,
            Err(StoreError::DuplicateAccount(_))
        ));
        assert!(matches!(
            conn.update_balance(account.id, Balance::new(dec!(1))).await,
            Err(StoreError::InvariantViolation { .. })
        ));
        assert!(matches!(conn.commit().await, Err(StoreError::NoTransaction)));
    }
}
