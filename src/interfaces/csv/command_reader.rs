use crate::application::engine::TransferRequest;
use crate::domain::account::AccountName;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Open,
    Transfer,
}

/// One row of a command file: `type, from, to, amount`.
///
/// `open` only uses `from`, the name of the account to create.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct Command {
    pub r#type: CommandType,
    pub from: String,
    pub to: Option<String>,
    pub amount: Option<Decimal>,
}

/// A validated command, ready for the [`crate::application::bank::Bank`].
#[derive(Debug, PartialEq, Clone)]
pub enum Action {
    Open(AccountName),
    Transfer(TransferRequest),
}

impl TryFrom<Command> for Action {
    type Error = LedgerError;

    fn try_from(command: Command) -> Result<Self> {
        let from = AccountName::new(command.from)?;
        match command.r#type {
            CommandType::Open => Ok(Action::Open(from)),
            CommandType::Transfer => {
                let to = command
                    .to
                    .ok_or_else(|| LedgerError::InvalidCommand("transfer without receiver".into()))?;
                let amount = command
                    .amount
                    .ok_or_else(|| LedgerError::InvalidCommand("transfer without amount".into()))?;
                Ok(Action::Transfer(TransferRequest::new(
                    from,
                    AccountName::new(to)?,
                    amount,
                )))
            }
        }
    }
}

/// Reads ledger commands from a CSV source.
///
/// Whitespace around fields is trimmed and trailing fields may be omitted,
/// so `open, alice` is a valid row.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and validates commands, one result per row.
    pub fn actions(self) -> impl Iterator<Item = Result<Action>> {
        self.reader.into_deserialize().map(|result| {
            let command: Command = result.map_err(LedgerError::from)?;
            Action::try_from(command)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn name(value: &str) -> AccountName {
        AccountName::new(value).unwrap()
    }

    #[test]
    fn test_reader_valid_stream() {
        let data = "type, from, to, amount\nopen, john\ntransfer, SYSTEM, john, 9999\n";
        let results: Vec<Result<Action>> = CommandReader::new(data.as_bytes()).actions().collect();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &Action::Open(name("john")));
        assert_eq!(
            results[1].as_ref().unwrap(),
            &Action::Transfer(TransferRequest::new(name("SYSTEM"), name("john"), dec!(9999)))
        );
    }

    #[test]
    fn test_reader_malformed_line() {
        let data = "type, from, to, amount\nrefund, john, jane, 1.0\ntransfer, john, jane, abc";
        let results: Vec<Result<Action>> = CommandReader::new(data.as_bytes()).actions().collect();

        assert!(matches!(results[0], Err(LedgerError::Csv(_))));
        assert!(matches!(results[1], Err(LedgerError::Csv(_))));
    }

    #[test]
    fn test_reader_incomplete_transfer() {
        let data = "type, from, to, amount\ntransfer, john, jane,\ntransfer, john,, 5\nopen,  ,,";
        let results: Vec<Result<Action>> = CommandReader::new(data.as_bytes()).actions().collect();

        assert!(matches!(results[0], Err(LedgerError::InvalidCommand(_))));
        assert!(matches!(results[1], Err(LedgerError::InvalidCommand(_))));
        assert!(matches!(results[2], Err(LedgerError::InvalidAccountName(_))));
    }
}
