use crate::domain::account::AccountId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Exclusive per-account row locks for stores without native ones.
///
/// A lock is held by its [`RowGuard`]; waiting for a held lock suspends the
/// caller until the guard is dropped.
#[derive(Default, Clone)]
pub struct RowLocks {
    rows: Arc<Mutex<HashMap<AccountId, Arc<Mutex<()>>>>>,
}

/// Proof of an exclusive lock on one account row.
#[derive(Debug)]
pub struct RowGuard {
    account: AccountId,
    _guard: OwnedMutexGuard<()>,
}

impl RowGuard {
    pub fn account(&self) -> AccountId {
        self.account
    }
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock on `account`, waiting for any current holder.
    pub async fn acquire(&self, account: AccountId) -> RowGuard {
        let row = {
            let mut rows = self.rows.lock().await;
            rows.entry(account).or_default().clone()
        };
        let guard = row.lock_owned().await;
        debug!(%account, "Row lock acquired");
        RowGuard {
            account,
            _guard: guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_locker_waits_for_release() {
        let locks = RowLocks::new();
        let guard = locks.acquire(AccountId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(AccountId(1)).await.account() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let acquired = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("lock was not released")
            .unwrap();
        assert_eq!(acquired, AccountId(1));
    }

    #[tokio::test]
    async fn test_distinct_rows_do_not_contend() {
        let locks = RowLocks::new();
        let _first = locks.acquire(AccountId(1)).await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.acquire(AccountId(2))).await;
        assert!(second.is_ok());
    }
}
