use super::account::{Account, AccountName};
use std::fmt::Debug;

/// Name of the account that may go below zero by default.
pub const DEFAULT_SYSTEM_ACCOUNT: &str = "SYSTEM";

/// Decides which accounts may end a transfer with a negative balance.
pub trait OverdraftPolicy: Send + Sync + Debug {
    fn may_go_below_zero(&self, account: &Account) -> bool;
}

/// No account may be overdrawn.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOverdraft;

impl OverdraftPolicy for NoOverdraft {
    fn may_go_below_zero(&self, _account: &Account) -> bool {
        false
    }
}

/// Exactly one designated account (usually the system account funding the
/// ledger) may be overdrawn.
#[derive(Debug, Clone)]
pub struct DesignatedAccount {
    name: AccountName,
}

impl DesignatedAccount {
    pub fn new(name: AccountName) -> Self {
        Self { name }
    }
}

impl Default for DesignatedAccount {
    fn default() -> Self {
        Self::new(AccountName(DEFAULT_SYSTEM_ACCOUNT.to_string()))
    }
}

impl OverdraftPolicy for DesignatedAccount {
    fn may_go_below_zero(&self, account: &Account) -> bool {
        account.name == self.name
    }
}
