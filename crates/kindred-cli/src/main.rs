//! Kindred billing CLI
//!
//! A command-line interface for operating the credit ledger, charging
//! metered usage, and managing personalization capacity.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kindred")]
#[command(author, version, about = "Kindred billing and capacity CLI", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: table (default) or json
    #[arg(long, global = true, default_value = "table")]
    format: output::OutputFormat,

    /// Suppress progress messages
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Override database path (or set KINDRED_DB_PATH env var)
    #[arg(long, env = "KINDRED_DB_PATH", global = true)]
    db: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Account balances, history, plans, and ledger maintenance
    Account {
        #[command(subcommand)]
        action: commands::account::AccountAction,
    },

    /// Charge usage, manage reservations and refunds
    Charge {
        #[command(subcommand)]
        action: commands::charge::ChargeAction,
    },

    /// Personalization slot pool and waitlist
    Capacity {
        #[command(subcommand)]
        action: commands::capacity::CapacityAction,
    },

    /// Apply payment provider events
    Payment {
        #[command(subcommand)]
        action: commands::payment::PaymentAction,
    },

    /// Browse the plan and credit pack catalog
    Plan {
        #[command(subcommand)]
        action: commands::plan::PlanAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    // Set up database path if provided
    if let Some(db_path) = &cli.db {
        std::env::set_var("KINDRED_DB_PATH", db_path);
    }

    // Initialize database
    let db = kindred_billing::Database::new().await?;

    // Create context for commands
    let ctx = commands::Context {
        db,
        format: cli.format,
        quiet: cli.quiet,
    };

    // Execute command
    match cli.command {
        Commands::Account { action } => commands::account::execute(&ctx, action).await,
        Commands::Charge { action } => commands::charge::execute(&ctx, action).await,
        Commands::Capacity { action } => commands::capacity::execute(&ctx, action).await,
        Commands::Payment { action } => commands::payment::execute(&ctx, action).await,
        Commands::Plan { action } => commands::plan::execute(&ctx, action).await,
    }
}
