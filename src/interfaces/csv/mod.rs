//! CSV batch surface of the `ledgerd` binary: commands in, listings out.

pub mod account_writer;
pub mod command_reader;
pub mod payment_writer;
