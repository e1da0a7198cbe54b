#![cfg(feature = "storage-rocksdb")]

mod common;

use common::{find, request, seed};
use ledgerd::application::bank::Bank;
use ledgerd::application::engine::TransferEngine;
use ledgerd::domain::account::Balance;
use ledgerd::domain::policy::DesignatedAccount;
use ledgerd::domain::ports::LedgerStoreRef;
use ledgerd::infrastructure::rocksdb::RocksDBStore;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rocksdb_opposite_transfers_do_not_deadlock() {
    let dir = tempdir().unwrap();
    let store: LedgerStoreRef = Arc::new(RocksDBStore::open(dir.path()).unwrap());
    let bank = Arc::new(Bank::new(
        store,
        TransferEngine::new(DesignatedAccount::default()),
    ));
    seed(&bank, &[("alice", dec!(100)), ("bob", dec!(100))]).await;

    let mut tasks = JoinSet::new();
    for i in 0..100 {
        let bank = Arc::clone(&bank);
        let (from, to) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
        tasks.spawn(async move { bank.transfer(&request(from, to, dec!(1))).await });
    }

    let results = tokio::time::timeout(Duration::from_secs(30), tasks.join_all())
        .await
        .expect("opposite transfers deadlocked");
    assert!(results.iter().all(|r| r.is_ok()));

    let accounts = bank.accounts().await.unwrap();
    assert_eq!(find(&accounts, "alice").balance, Balance::new(dec!(100)));
    assert_eq!(find(&accounts, "bob").balance, Balance::new(dec!(100)));

    let payments = bank.payments().await.unwrap();
    assert_eq!(payments.len(), 4 + 200);
    assert!(
        payments
            .chunks(2)
            .all(|pair| pair[0].transaction == pair[1].transaction)
    );
}

#[tokio::test]
async fn test_rocksdb_failed_transfer_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let store: LedgerStoreRef = Arc::new(RocksDBStore::open(dir.path()).unwrap());
    let bank = Bank::new(store, TransferEngine::new(DesignatedAccount::default()));
    seed(&bank, &[("sender", dec!(15.00)), ("receiver", dec!(0))]).await;

    assert!(
        bank.transfer(&request("sender", "receiver", dec!(50)))
            .await
            .is_err()
    );

    let accounts = bank.accounts().await.unwrap();
    assert_eq!(find(&accounts, "sender").balance, Balance::new(dec!(15.00)));
    assert_eq!(find(&accounts, "receiver").balance, Balance::ZERO);
    assert_eq!(bank.payments().await.unwrap().len(), 2);
}
