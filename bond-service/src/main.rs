//! Bond Ledger Daemon
//!
//! Usage:
//!   bond-ledger init-schema          - Create tables and indexes
//!   bond-ledger run                  - Run the settlement scheduler until Ctrl-C
//!   bond-ledger settle-once          - Perform one settlement run and exit

use std::sync::Arc;

use anyhow::{Context, Result};
use bond_core::SettlementOutcome;
use bond_service::{
    init_logging, LedgerConfig, LedgerService, Notifier, SettlementScheduler, StaticIdentityResolver, SystemClock,
};
use bond_store::PgLedgerStore;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "bond-ledger")]
#[command(about = "Bond investment ledger")]
#[command(version)]
struct Cli {
    /// Database URL (overrides BOND_LEDGER_DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger schema if missing
    InitSchema,

    /// Run the settlement and report timers until interrupted
    Run,

    /// Settle matured holdings once
    SettleOnce {
        /// Also publish the operator reports
        #[arg(long)]
        report: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    if cli.json_logs {
        config.log.format = bond_service::LogFormat::Json;
    }
    config.log = config.log.with_service_name("bond-ledger");

    init_logging(&config.log).map_err(|e| anyhow::anyhow!("failed to initialise logging: {}", e))?;
    config.validate().context("invalid configuration")?;

    let store = PgLedgerStore::connect(&config.database.store_options(), config.fees.clone())
        .await
        .context("failed to connect to the ledger database")?;

    match cli.command {
        Commands::InitSchema => {
            store.init_schema().await.context("failed to apply schema")?;
            info!("Ledger schema applied");
        }
        Commands::Run => {
            let service = build_service(store, &config);
            let handle = SettlementScheduler::new(service, config.scheduler.clone()).start();
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            handle.shutdown().await;
        }
        Commands::SettleOnce { report } => {
            let service = build_service(store, &config);
            match service.settle().await? {
                SettlementOutcome::Completed(r) => {
                    println!("{}", serde_json::to_string_pretty(&r)?);
                }
                SettlementOutcome::Skipped => println!("settlement skipped: another run holds the lock"),
            }
            if report {
                service.publish_reports().await?;
            }
            service.notifier().flush().await;
        }
    }

    Ok(())
}

fn build_service(store: PgLedgerStore, config: &LedgerConfig) -> LedgerService<PgLedgerStore> {
    LedgerService::new(
        Arc::new(store),
        Arc::new(StaticIdentityResolver::new()),
        Arc::new(SystemClock),
        Notifier::tracing(),
        config.product.clone(),
        config.fees.clone(),
    )
}
