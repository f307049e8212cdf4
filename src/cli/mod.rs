use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::TryStreamExt;
use serde::Serialize;

use crate::application::{History, LedgerService};
use crate::config::{DatabaseConfig, LedgerConfig};
use crate::domain::{AuditReport, TransactionRecord, format_minor_units, parse_minor_units};
use crate::storage::TransactionLogReader;

/// Wallet Ledger - balances, top-ups and transfers
#[derive(Parser)]
#[command(name = "wallet-ledger")]
#[command(about = "A wallet ledger with atomic top-ups, transfers and an append-only transaction log")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "wallet-ledger.db", env = "WALLET_LEDGER_DB")]
    pub database: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Longest wait for an account lock, in milliseconds
    #[arg(long, global = true, env = "WALLET_LEDGER_LOCK_TIMEOUT_MS", default_value_t = 5_000)]
    pub lock_timeout_ms: u64,

    /// Compare-and-set attempts per top-up before reporting contention
    #[arg(long, global = true, env = "WALLET_LEDGER_CAS_ATTEMPTS", default_value_t = 5)]
    pub cas_attempts: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Deposit money into an account, opening it if needed
    TopUp {
        /// Account identifier
        account: String,

        /// Amount to deposit (e.g., "50.00" or "50")
        amount: String,
    },

    /// Move money between two accounts
    Transfer {
        /// Amount to transfer (e.g., "50.00" or "50")
        amount: String,

        /// Source account
        #[arg(long)]
        from: String,

        /// Destination account
        #[arg(long)]
        to: String,
    },

    /// Show balance for an account or all accounts
    Balance {
        /// Account identifier (omit for all accounts)
        account: Option<String>,
    },

    /// List an account's transactions, oldest first
    History {
        /// Account identifier
        account: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Verify ledger integrity
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
}

impl Cli {
    fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            max_cas_attempts: self.cas_attempts,
            lock_timeout_ms: self.lock_timeout_ms,
            ..LedgerConfig::default()
        }
    }

    async fn open(&self) -> Result<LedgerService> {
        let database = DatabaseConfig {
            create_if_missing: false,
            ..DatabaseConfig::for_path(&self.database)
        };
        LedgerService::connect(&database, self.ledger_config())
            .await
            .with_context(|| format!("Cannot open {}. Run `init` first?", self.database))
    }

    pub async fn run(self) -> Result<()> {
        crate::telemetry::init(self.verbose);

        match &self.command {
            Commands::Init => {
                let database = DatabaseConfig::for_path(&self.database);
                LedgerService::init(&database, self.ledger_config()).await?;
                println!("Database initialized: {}", self.database);
            }

            Commands::TopUp { account, amount } => {
                let service = self.open().await?;
                let amount = parse_amount(amount)?;
                let receipt = service.top_up(account, amount).await?;
                println!(
                    "Topped up {} with {} (balance {}, record {})",
                    receipt.account,
                    format_minor_units(amount),
                    format_minor_units(receipt.balance),
                    receipt.record.id
                );
            }

            Commands::Transfer { amount, from, to } => {
                let service = self.open().await?;
                let amount = parse_amount(amount)?;
                let receipt = service.transfer(from, to, amount).await?;
                println!(
                    "Transferred {} {} -> {} ({})",
                    format_minor_units(amount),
                    from,
                    to,
                    receipt.correlation_id
                );
                println!("  {:<20} {:>14}", from, format_minor_units(receipt.from_balance));
                println!("  {:<20} {:>14}", to, format_minor_units(receipt.to_balance));
            }

            Commands::Balance { account } => {
                let service = self.open().await?;
                run_balance_command(&service, account.as_deref()).await?;
            }

            Commands::History { account, format } => {
                let service = self.open().await?;
                let history = service.queries().history(account)?;
                let stdout = std::io::stdout();
                let count = write_history(&history, *format, stdout.lock()).await?;
                if *format == OutputFormat::Table && count == 0 {
                    println!("No transactions for {}.", account);
                }
            }

            Commands::Check => {
                let service = self.open().await?;
                let report = service.audit().await?;
                print_audit_report(&report);
                if !report.is_healthy() {
                    bail!("ledger integrity check failed");
                }
            }
        }

        Ok(())
    }
}

fn parse_amount(input: &str) -> Result<i64> {
    parse_minor_units(input).with_context(|| format!("Invalid amount '{input}'. Use '50.00' or '50'"))
}

async fn run_balance_command(service: &LedgerService, account: Option<&str>) -> Result<()> {
    match account {
        Some(account) => {
            let balance = service.get_balance(account).await?;
            println!("{}: {}", account, format_minor_units(balance));
        }
        None => {
            let accounts = service.list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts found.");
                return Ok(());
            }
            println!("{:<24} {:>14}", "ACCOUNT", "BALANCE");
            println!("{}", "-".repeat(39));
            let mut total: i128 = 0;
            for account in &accounts {
                total += i128::from(account.balance);
                println!("{:<24} {:>14}", account.id, format_minor_units(account.balance));
            }
            println!("{}", "-".repeat(39));
            println!("{:<24} {:>14}", "TOTAL", format_total(total));
        }
    }
    Ok(())
}

/// Flat row for CSV output.
#[derive(Serialize)]
struct HistoryRow<'a> {
    id: i64,
    account: &'a str,
    kind: &'static str,
    amount: i64,
    balance_after: i64,
    correlation_id: String,
    timestamp: String,
}

impl<'a> From<&'a TransactionRecord> for HistoryRow<'a> {
    fn from(record: &'a TransactionRecord) -> Self {
        Self {
            id: record.id,
            account: record.account.as_str(),
            kind: record.kind.as_str(),
            amount: record.amount,
            balance_after: record.balance_after,
            correlation_id: record.correlation_id.to_string(),
            timestamp: record.timestamp.to_rfc3339(),
        }
    }
}

/// Write one pass over `history` in the given format. Table and CSV rows are
/// written as they stream in. Returns the number of records written.
pub async fn write_history<R, W>(
    history: &History<R>,
    format: OutputFormat,
    mut writer: W,
) -> Result<usize>
where
    R: TransactionLogReader,
    W: Write,
{
    let mut records = history.stream();
    let mut count = 0;

    match format {
        OutputFormat::Table => {
            writeln!(
                writer,
                "{:<8} {:<16} {:>14} {:>14}  {:<36}  {}",
                "ID", "KIND", "AMOUNT", "BALANCE", "CORRELATION", "TIMESTAMP"
            )?;
            while let Some(record) = records.try_next().await? {
                writeln!(
                    writer,
                    "{:<8} {:<16} {:>14} {:>14}  {:<36}  {}",
                    record.id,
                    record.kind,
                    format_minor_units(record.amount),
                    format_minor_units(record.balance_after),
                    record.correlation_id,
                    record.timestamp.format("%Y-%m-%d %H:%M:%S")
                )?;
                count += 1;
            }
        }
        OutputFormat::Csv => {
            let mut csv_writer = csv::Writer::from_writer(writer);
            while let Some(record) = records.try_next().await? {
                csv_writer.serialize(HistoryRow::from(&record))?;
                count += 1;
            }
            csv_writer.flush()?;
        }
        OutputFormat::Json => {
            let all: Vec<TransactionRecord> = records.try_collect().await?;
            count = all.len();
            serde_json::to_writer_pretty(&mut writer, &all)?;
            writeln!(writer)?;
        }
    }

    Ok(count)
}

fn format_total(total: i128) -> String {
    match i64::try_from(total) {
        Ok(total) => format_minor_units(total),
        Err(_) => format!("{total} (minor units)"),
    }
}

fn print_audit_report(report: &AuditReport) {
    println!("Ledger Integrity Check");
    println!("======================");
    println!("Accounts:         {}", report.account_count);
    println!("Records:          {}", report.record_count);
    println!("Total balance:    {}", format_total(report.total_balance));
    println!("Total deposits:   {}", format_total(report.total_deposits));
    println!();

    let status = |ok: bool| if ok { "OK" } else { "FAIL" };
    println!("[{}] Conservation (balances == deposits)", status(report.conservation_holds));
    println!(
        "[{}] Transfers balanced ({} unbalanced)",
        status(report.unbalanced_transfers.is_empty()),
        report.unbalanced_transfers.len()
    );
    for correlation_id in &report.unbalanced_transfers {
        println!("      {}", correlation_id);
    }
    println!(
        "[{}] Balances match log ({} mismatched)",
        status(report.mismatched_balances.is_empty()),
        report.mismatched_balances.len()
    );
    for mismatch in &report.mismatched_balances {
        println!(
            "      {}: stored {}, log says {}",
            mismatch.account,
            format_minor_units(mismatch.stored),
            format_total(mismatch.replayed)
        );
    }
    println!(
        "[{}] No negative balances",
        status(report.negative_balances.is_empty())
    );
    println!(
        "[{}] No orphan records ({})",
        status(report.orphan_records == 0),
        report.orphan_records
    );
    println!();
    println!(
        "{}",
        if report.is_healthy() {
            "Ledger is healthy."
        } else {
            "Ledger has integrity problems."
        }
    );
}
