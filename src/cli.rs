use anyhow::Context;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{Level, info, warn};

use crate::{
    api::router,
    config::Config,
    journal::RecoveryLog,
    ledger::{HttpLedger, LedgerGateway, SimulatedLedger},
    orderbook::OrderBook,
    settlement::collect_stats,
    state::AppState,
    store::Store,
    utils::shutdown_token,
};

/// Order matching with on-ledger settlement
#[derive(Parser)]
#[command(name = "order-settlement", version, about)]
struct Cli {
    /// Database directory
    #[arg(long, global = true, default_value = "data/db")]
    db: PathBuf,

    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API, settlement workers and the retry sweep
    Serve {
        #[arg(long, default_value = "127.0.0.1:3000")]
        addr: SocketAddr,
    },
    /// Rebuild a pair's book from snapshot + journal and print it
    Replay {
        /// Pair code, e.g. MBTC-MUSDT
        pair: String,
        /// Price levels per side
        #[arg(long, default_value_t = 20)]
        levels: usize,
    },
    /// Print settlement counts per status
    Stats,
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();
    let config = Config::load(cli.config.as_deref()).context("loading config")?;

    match cli.command {
        Commands::Serve { addr } => serve(cli.db, config, addr).await,
        Commands::Replay { pair, levels } => replay(cli.db, &config, &pair, levels),
        Commands::Stats => {
            let store = Store::open(&cli.db).context("opening database")?;
            let stats = collect_stats(&store, config.settlement.max_retries)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn serve(db: PathBuf, config: Config, addr: SocketAddr) -> anyhow::Result<()> {
    let token = shutdown_token();
    let gateway: Arc<dyn LedgerGateway> = match &config.settlement.ledger_url {
        Some(url) => {
            info!(%url, "using ledger relayer");
            Arc::new(HttpLedger::new(url.clone(), config.settlement.call_timeout())?)
        }
        None => {
            warn!("no ledger_url configured, settling against the in-process ledger");
            Arc::new(SimulatedLedger::new())
        }
    };
    let state = AppState::new(&db, config, gateway, token.clone())
        .await
        .context("recovering state")?;
    state.spawn_retry_scheduler();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

fn replay(db: PathBuf, config: &Config, pair: &str, levels: usize) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&db).context("opening database")?);
    let log = RecoveryLog::new(store, pair, config.snapshot_every);
    let mut book = match log.load_latest_snapshot()? {
        Some(snap) => OrderBook::restore(snap, config.self_trade),
        None => OrderBook::new(pair, config.self_trade),
    };
    let records = log.replay(book.sequence() + 1)?;
    let replayed = records.len();
    for record in records {
        record.apply(&mut book)?;
    }
    info!(pair, replayed, sequence = book.sequence(), "book rebuilt");
    println!("{}", serde_json::to_string_pretty(&book.depth(levels))?);
    Ok(())
}
