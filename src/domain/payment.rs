use super::account::{Account, AccountId, AccountName, Amount, Currency};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Surrogate identifier of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Links the two opposite payments produced by one transfer.
///
/// Not to be confused with a database transaction. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub created_at: DateTime<Utc>,
}

/// Direction of money movement from the owning account's perspective.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outgoing => "outgoing",
            Direction::Incoming => "incoming",
        }
    }

    /// Applies the direction's sign to `amount`.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Outgoing => -amount,
            Direction::Incoming => amount,
        }
    }

    /// Listing order within one transaction: outgoing first.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Direction::Outgoing => 0,
            Direction::Incoming => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outgoing" => Ok(Direction::Outgoing),
            "incoming" => Ok(Direction::Incoming),
            other => Err(format!("unknown payment direction: {other}")),
        }
    }
}

/// A payment row as written by the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPayment {
    pub transaction: TransactionId,
    pub account: AccountId,
    pub counterparty: AccountId,
    pub direction: Direction,
    pub amount: Amount,
    pub currency: Currency,
}

impl NewPayment {
    /// Builds the double-entry pair for a transfer: the sender's outgoing
    /// payment first, then the receiver's incoming one.
    pub fn pair(
        transaction: TransactionId,
        sender: &Account,
        receiver: &Account,
        amount: Amount,
    ) -> [NewPayment; 2] {
        let currency = sender.currency;
        [
            NewPayment {
                transaction,
                account: sender.id,
                counterparty: receiver.id,
                direction: Direction::Outgoing,
                amount,
                currency,
            },
            NewPayment {
                transaction,
                account: receiver.id,
                counterparty: sender.id,
                direction: Direction::Incoming,
                amount,
                currency,
            },
        ]
    }

    /// Contribution of this payment to its owner's balance.
    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.amount.value())
    }
}

/// Account identity as shown in payment listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRef {
    pub id: AccountId,
    pub name: AccountName,
}

impl From<&Account> for AccountRef {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            name: account.name.clone(),
        }
    }
}

/// A payment with both sides and its transaction resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub account: AccountRef,
    pub counterparty: AccountRef,
    pub transaction: Transaction,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: Currency,
}
