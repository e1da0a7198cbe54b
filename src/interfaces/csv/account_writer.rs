use crate::domain::account::Account;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AccountRow<'a> {
    name: &'a str,
    balance: String,
    currency: &'a str,
}

/// Writes the account listing as CSV: `name,balance,currency`.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes the header and one row per account, in the given order.
    pub fn write_accounts(&mut self, accounts: &[Account]) -> csv::Result<()> {
        if accounts.is_empty() {
            self.writer.write_record(["name", "balance", "currency"])?;
        }
        for account in accounts {
            self.writer.serialize(AccountRow {
                name: account.name.as_str(),
                balance: account.balance.value().normalize().to_string(),
                currency: account.currency.as_str(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
