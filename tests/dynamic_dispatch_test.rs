mod common;

use common::name;
use ledgerd::domain::account::{Amount, Balance};
use ledgerd::domain::payment::NewPayment;
use ledgerd::domain::ports::LedgerStoreRef;
use ledgerd::error::StoreError;
use ledgerd::infrastructure::in_memory::InMemoryLedgerStore;
use rust_decimal_macros::dec;
use std::sync::Arc;

#[tokio::test]
async fn test_store_as_trait_object() {
    let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());

    let mut conn = store.connect().await.unwrap();
    assert!(!conn.in_transaction());
    conn.create_account(&name("SYSTEM")).await.unwrap();
    conn.create_account(&name("john")).await.unwrap();

    // Verify Send + Sync by driving a transaction from another task
    let handle = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.in_transaction());
            let sender = tx.lock_account_for_update(&name("SYSTEM")).await.unwrap().unwrap();
            let receiver = tx.lock_account_for_update(&name("john")).await.unwrap().unwrap();
            let transaction = tx.insert_transaction().await.unwrap();
            let amount = Amount::new(dec!(12.5)).unwrap();
            for payment in NewPayment::pair(transaction.id, &sender, &receiver, amount) {
                tx.insert_payment(&payment).await.unwrap();
            }
            tx.update_balance(sender.id, sender.balance - Balance::from(amount))
                .await
                .unwrap();
            tx.update_balance(receiver.id, receiver.balance + Balance::from(amount))
                .await
                .unwrap();
            tx.commit().await.unwrap();
            assert!(matches!(tx.commit().await, Err(StoreError::NoTransaction)));
            transaction
        })
    };

    let transaction = handle.await.unwrap();
    let payments = conn.list_payments().await.unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0].transaction, transaction);
    assert!(matches!(conn.rollback().await, Err(StoreError::NoTransaction)));
}
