mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::command_file;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn test_cli_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg("tests/fixtures/transfers.csv");

    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("name,balance,currency\n"))
        .stdout(predicate::str::contains("SYSTEM,-1500,USD"))
        .stdout(predicate::str::contains("sender,1484.5,USD"))
        .stdout(predicate::str::contains("receiver,15.5,USD"))
        // The overdrawing transfer is reported and skipped.
        .stderr(predicate::str::contains("Failed to process command"))
        .stderr(predicate::str::contains("insufficient funds"));

    Ok(())
}

#[test]
fn test_cli_prints_payments() -> Result<(), Box<dyn std::error::Error>> {
    let csv = command_file(&["open, SYSTEM", "open, john", "transfer, SYSTEM, john, 9999"])?;

    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg(csv.path()).arg("--payments");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("john,9999,USD"))
        .stdout(predicate::str::contains(
            "transaction,account,counterparty,direction,amount,currency\n\
             1,SYSTEM,john,outgoing,9999,USD\n\
             1,john,SYSTEM,incoming,9999,USD\n",
        ));

    Ok(())
}

#[test]
fn test_cli_malformed_rows_are_skipped() -> Result<(), Box<dyn std::error::Error>> {
    let csv = command_file(&[
        "open, SYSTEM",
        "open, alice",
        "refund, alice, SYSTEM, 1",
        "transfer, SYSTEM, alice, not_a_number",
        "transfer, SYSTEM, alice,",
        "transfer, alice, alice, 1",
        "open, alice",
        "transfer, SYSTEM, alice, 2.50",
    ])?;

    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg(csv.path());

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("alice,2.5,USD"))
        .stdout(predicate::str::contains("SYSTEM,-2.5,USD"))
        .stderr(predicate::str::contains("account already exists: alice"))
        .stderr(predicate::str::contains("to itself"));

    Ok(())
}

#[test]
fn test_cli_no_overdraft() -> Result<(), Box<dyn std::error::Error>> {
    let csv = command_file(&["open, SYSTEM", "open, john", "transfer, SYSTEM, john, 1"])?;

    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg(csv.path()).arg("--no-overdraft");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("SYSTEM,0,USD"))
        .stdout(predicate::str::contains("john,0,USD"));

    Ok(())
}

#[test]
fn test_cli_custom_system_account() -> Result<(), Box<dyn std::error::Error>> {
    let csv = command_file(&["open, treasury", "open, john", "transfer, treasury, john, 7"])?;

    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg(csv.path()).arg("--system-account").arg("treasury");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("treasury,-7,USD"))
        .stdout(predicate::str::contains("john,7,USD"));

    Ok(())
}

#[test]
fn test_cli_missing_input_fails() {
    let mut cmd = Command::new(cargo_bin!("ledgerd"));
    cmd.arg("tests/fixtures/does_not_exist.csv");

    cmd.assert().failure();
}
