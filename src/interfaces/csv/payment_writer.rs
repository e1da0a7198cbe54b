use crate::domain::payment::Payment;
use serde::Serialize;
use std::io::Write;

const HEADER: [&str; 6] = [
    "transaction",
    "account",
    "counterparty",
    "direction",
    "amount",
    "currency",
];

#[derive(Serialize)]
struct PaymentRow<'a> {
    transaction: i64,
    account: &'a str,
    counterparty: &'a str,
    direction: &'a str,
    amount: String,
    currency: &'a str,
}

/// Writes the payment listing as CSV, one row per payment.
pub struct PaymentWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> PaymentWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_payments(&mut self, payments: &[Payment]) -> csv::Result<()> {
        if payments.is_empty() {
            self.writer.write_record(HEADER)?;
        }
        for payment in payments {
            self.writer.serialize(PaymentRow {
                transaction: payment.transaction.id.0,
                account: payment.account.name.as_str(),
                counterparty: payment.counterparty.name.as_str(),
                direction: payment.direction.as_str(),
                amount: payment.amount.normalize().to_string(),
                currency: payment.currency.as_str(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::{AccountId, AccountName, Currency};
    use crate::domain::payment::{AccountRef, Direction, Transaction, TransactionId};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn named(id: i64, name: &str) -> AccountRef {
        AccountRef {
            id: AccountId(id),
            name: AccountName::new(name).unwrap(),
        }
    }

    #[test]
    fn test_write_payments() {
        let transaction = Transaction {
            id: TransactionId(1),
            created_at: Utc::now(),
        };
        let payments = [
            Payment {
                account: named(1, "alice"),
                counterparty: named(2, "bob"),
                transaction: transaction.clone(),
                direction: Direction::Outgoing,
                amount: dec!(0.50),
                currency: Currency::Usd,
            },
            Payment {
                account: named(2, "bob"),
                counterparty: named(1, "alice"),
                transaction,
                direction: Direction::Incoming,
                amount: dec!(0.50),
                currency: Currency::Usd,
            },
        ];

        let mut out = Vec::new();
        PaymentWriter::new(&mut out).write_payments(&payments).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "transaction,account,counterparty,direction,amount,currency\n\
             1,alice,bob,outgoing,0.5,USD\n\
             1,bob,alice,incoming,0.5,USD\n"
        );
    }
}
