use clap::Parser;
use ledgerd::application::bank::Bank;
use ledgerd::application::engine::TransferEngine;
use ledgerd::domain::account::AccountName;
use ledgerd::domain::policy::{DEFAULT_SYSTEM_ACCOUNT, DesignatedAccount, NoOverdraft};
use ledgerd::domain::ports::LedgerStoreRef;
use ledgerd::infrastructure::in_memory::InMemoryLedgerStore;
use ledgerd::interfaces::csv::account_writer::AccountWriter;
use ledgerd::interfaces::csv::command_reader::{Action, CommandReader};
use ledgerd::interfaces::csv::payment_writer::PaymentWriter;
use ledgerd::logging;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file (`type, from, to, amount`)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// PostgreSQL connection string (optional). Takes precedence over --db-path.
    #[arg(long)]
    database_url: Option<String>,

    /// The one account allowed to go below zero.
    #[arg(long, default_value = DEFAULT_SYSTEM_ACCOUNT)]
    system_account: String,

    /// Reject every transfer that would overdraw its sender.
    #[arg(long, conflicts_with = "system_account")]
    no_overdraft: bool,

    /// Also print every payment after the account listing.
    #[arg(long)]
    payments: bool,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level).into_diagnostic()?;

    let store = open_store(&cli).await?;
    let engine = if cli.no_overdraft {
        TransferEngine::new(NoOverdraft)
    } else {
        let system = AccountName::new(cli.system_account.as_str()).into_diagnostic()?;
        TransferEngine::new(DesignatedAccount::new(system))
    };
    let bank = Bank::new(store, engine);

    let file = File::open(&cli.input).into_diagnostic()?;
    let (mut applied, mut failed) = (0usize, 0usize);
    for (row, action) in CommandReader::new(file).actions().enumerate() {
        let result = match action {
            Ok(Action::Open(name)) => bank.create_account(name.as_str()).await.map(|_| ()),
            Ok(Action::Transfer(request)) => bank.transfer(&request).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => {
                failed += 1;
                warn!(row = row + 1, error = %e, "Failed to process command");
            }
        }
    }
    info!(applied, failed, "Batch processed");

    let accounts = bank.accounts().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    AccountWriter::new(&mut out)
        .write_accounts(&accounts)
        .into_diagnostic()?;

    if cli.payments {
        let payments = bank.payments().await.into_diagnostic()?;
        writeln!(out).into_diagnostic()?;
        PaymentWriter::new(&mut out)
            .write_payments(&payments)
            .into_diagnostic()?;
    }

    Ok(())
}

/// Picks the backend: Postgres, then RocksDB, then in-memory.
async fn open_store(cli: &Cli) -> Result<LedgerStoreRef> {
    if let Some(url) = &cli.database_url
        && let Some(store) = postgres_store(url, cli.db_path.is_some()).await?
    {
        return Ok(store);
    }
    if let Some(path) = &cli.db_path
        && let Some(store) = rocksdb_store(path)?
    {
        return Ok(store);
    }
    Ok(Arc::new(InMemoryLedgerStore::new()))
}

#[cfg(feature = "storage-postgres")]
async fn postgres_store(url: &str, _has_db_path: bool) -> Result<Option<LedgerStoreRef>> {
    use ledgerd::infrastructure::postgres::PgLedgerStore;

    let store = PgLedgerStore::open(url).await.into_diagnostic()?;
    store.migrate().await.into_diagnostic()?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "storage-postgres"))]
async fn postgres_store(_url: &str, has_db_path: bool) -> Result<Option<LedgerStoreRef>> {
    let fallback = if has_db_path {
        "trying --db-path"
    } else {
        "falling back to in-memory storage"
    };
    warn!("--database-url given but the 'storage-postgres' feature is not enabled, {fallback}");
    Ok(None)
}

#[cfg(feature = "storage-rocksdb")]
fn rocksdb_store(path: &std::path::Path) -> Result<Option<LedgerStoreRef>> {
    use ledgerd::infrastructure::rocksdb::RocksDBStore;

    let store = RocksDBStore::open(path).into_diagnostic()?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn rocksdb_store(_path: &std::path::Path) -> Result<Option<LedgerStoreRef>> {
    warn!("--db-path given but the 'storage-rocksdb' feature is not enabled, falling back to in-memory storage");
    Ok(None)
}
