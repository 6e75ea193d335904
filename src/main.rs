use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::Address;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::sync::watch;

use polymirror::clock::TokioSleeper;
use polymirror::config::AppConfig;
use polymirror::db::{self, MemoryStore, PgStore, Store};
use polymirror::execution::{CopyEngine, CopyEngineConfig, ExecutionGateway};
use polymirror::ingestion::head_listener::run_head_listener;
use polymirror::ingestion::{HttpTransport, LedgerReader, PipelineDriver, RpcTransport, TradeDecoder};
use polymirror::intelligence::TraderLedger;
use polymirror::models::normalize_address;
use polymirror::polymarket::{GammaMarketData, HttpSigner, OrderSubmitter};
use polymirror::registry::{tracked_address, TrackedRegistry};

#[derive(Debug, Parser)]
#[command(name = "polymirror", version, about = "Polymarket on-chain trade monitor and copy engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the block pipeline.
    Run {
        /// Keep all state in memory instead of Postgres.
        #[arg(long)]
        ephemeral: bool,
    },
    /// Manage tracked addresses.
    Track {
        #[command(subcommand)]
        action: TrackAction,
    },
}

#[derive(Debug, Subcommand)]
enum TrackAction {
    Add {
        address: String,
        /// Cap per copied order, in share base units (6 decimals).
        #[arg(long, default_value_t = 100_000_000)]
        max_position: u64,
        /// Fraction of each source fill to copy, in (0, 1].
        #[arg(long, default_value = "0.1")]
        copy_ratio: Decimal,
    },
    Remove {
        address: String,
    },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    // reqwest and tungstenite both link rustls; pick the provider explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command {
        Command::Run { ephemeral } => run(config, ephemeral).await,
        Command::Track { action } => {
            let store = connect_store(&config).await?;
            track(store.as_ref(), action).await
        }
    }
}

async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    let url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(url).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("Database connected");

    Ok(Arc::new(PgStore::new(pool)))
}

async fn track(store: &dyn Store, action: TrackAction) -> anyhow::Result<()> {
    match action {
        TrackAction::Add {
            address,
            max_position,
            copy_ratio,
        } => {
            let entry = tracked_address(&address, max_position, copy_ratio)?;
            store.upsert_tracked(&entry).await?;
            println!(
                "tracking {} (max_position={}, copy_ratio={})",
                entry.address, entry.max_position_size, entry.copy_ratio
            );
        }
        TrackAction::Remove { address } => {
            let address = normalize_address(&address)?;
            if store.remove_tracked(&address).await? {
                println!("removed {address}");
            } else {
                println!("{address} was not tracked");
            }
        }
        TrackAction::List => {
            let entries = store.load_tracked().await?;
            if entries.is_empty() {
                println!("no tracked addresses");
            }
            for e in entries {
                println!(
                    "{}  max_position={}  copy_ratio={}  added={}",
                    e.address,
                    e.max_position_size,
                    e.copy_ratio,
                    e.added_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
    }
    Ok(())
}

async fn run(config: AppConfig, ephemeral: bool) -> anyhow::Result<()> {
    config.require_rpc()?;
    polymirror::metrics::init_metrics(config.metrics_port)?;

    let store: Arc<dyn Store> = if ephemeral {
        tracing::warn!("Ephemeral store: cursor and journals are lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        connect_store(&config).await?
    };

    // --- Chain access ---
    let mut transports: Vec<Arc<dyn RpcTransport>> = Vec::with_capacity(config.rpc_urls.len());
    for url in &config.rpc_urls {
        transports.push(Arc::new(HttpTransport::new(url.clone(), config.rpc_timeout)?));
    }
    let reader = LedgerReader::new(transports);

    let exchange = Address::from_str(&config.exchange_address)
        .map_err(|e| anyhow::anyhow!("invalid EXCHANGE_ADDRESS: {e}"))?;
    let decoder = TradeDecoder::new(exchange);

    // --- Shared state ---
    // The exchange itself is the taker of matched orders; keep it out of rankings.
    let ledger = TraderLedger::new(config.ledger_window)
        .with_ignored([exchange.to_string().to_lowercase()])
        .shared();
    let registry = TrackedRegistry::from_entries(store.load_tracked().await?).shared();
    tracing::info!(tracked = registry.read().await.len(), "Tracked registry loaded");

    // --- Copy decisions and execution ---
    let dry_run = config.effective_dry_run();
    if !config.dry_run && dry_run {
        tracing::warn!("DRY_RUN=false but SIGNER_URL is not set, staying in dry-run mode");
    }

    let market_data = Arc::new(GammaMarketData::new(
        config.gamma_api_url.clone(),
        config.rpc_timeout,
    )?);
    let engine = CopyEngine::new(
        CopyEngineConfig {
            price_limits: config.price_limits(),
            exposure_limits: config.exposure_limits(),
            dry_run,
        },
        market_data,
        store.clone(),
    );

    let submitter: Option<Arc<dyn OrderSubmitter>> = match (&config.signer_url, dry_run) {
        (Some(url), false) => Some(Arc::new(HttpSigner::new(url.clone(), config.rpc_timeout)?)),
        _ => None,
    };
    let sleeper = Arc::new(TokioSleeper);
    let gateway = Arc::new(ExecutionGateway::new(
        submitter,
        config.retry_policy(),
        sleeper.clone(),
        store.clone(),
    ));

    let mut driver = PipelineDriver::new(
        config.pipeline(),
        reader,
        decoder,
        ledger,
        registry,
        engine,
        gateway,
        store,
        sleeper,
    );

    if let Err(e) = driver.rehydrate().await {
        tracing::warn!(error = %e, "Failed to rehydrate trader ledger, starting empty");
    }

    // --- Shutdown and wake-up wiring ---
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing current block");
            let _ = stop_tx.send(true);
        }
    });

    if let Some(ws_url) = config.rpc_ws_url.clone() {
        tracing::info!(url = %ws_url, "Starting head listener");
        tokio::spawn(run_head_listener(ws_url, driver.wake_handle(), stop_rx.clone()));
    }

    driver.run(stop_rx).await;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
