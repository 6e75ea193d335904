use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::execution::{ExposureLimits, PriceLimits, RetryPolicy};
use crate::ingestion::decoder::CTF_EXCHANGE;
use crate::ingestion::PipelineConfig;
use crate::polymarket::gamma_client::GAMMA_API_BASE;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Required unless the store is ephemeral.
    pub database_url: Option<String>,

    // Chain
    pub exchange_address: String,
    pub rpc_urls: Vec<String>,
    pub rpc_ws_url: Option<String>,
    pub rpc_timeout: Duration,

    // Pipeline
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub fault_cooldown: Duration,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub ledger_window: chrono::Duration,
    pub ranking_log_every: u64,

    // Copy decisions
    pub dry_run: bool,
    pub slippage_tolerance: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// 0 disables the daily order limit.
    pub max_daily_orders: u32,
    pub max_daily_volume: Option<Decimal>,
    pub max_total_exposure: Option<Decimal>,

    // Submission
    pub signer_url: Option<String>,
    pub submit_max_attempts: u32,
    pub submit_base_delay: Duration,
    pub submit_max_delay: Duration,

    // Collaborators
    pub gamma_api_url: String,
    pub metrics_port: Option<u16>,
}

/// Parse `key` if set, else fall back to `default`.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        _ => Ok(default),
    }
}

fn env_opt<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
        _ => Ok(None),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let rpc_urls = split_list(&env::var("RPC_URLS").unwrap_or_default());
        let window_secs: i64 = env_or("LEDGER_WINDOW_SECS", 86_400)?;

        let config = Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),

            exchange_address: env::var("EXCHANGE_ADDRESS").unwrap_or_else(|_| CTF_EXCHANGE.into()),
            rpc_urls,
            rpc_ws_url: env::var("RPC_WS_URL").ok().filter(|s| !s.is_empty()),
            rpc_timeout: Duration::from_secs(env_or("RPC_TIMEOUT_SECS", 10)?),

            batch_size: env_or("BATCH_SIZE", 20)?,
            poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 4)?),
            fault_cooldown: Duration::from_secs(env_or("FAULT_COOLDOWN_SECS", 15)?),
            start_block: env_opt("START_BLOCK")?,
            confirmations: env_or("CONFIRMATIONS", 0)?,
            ledger_window: chrono::Duration::seconds(window_secs),
            ranking_log_every: env_or("RANKING_LOG_EVERY", 50)?,

            dry_run: env_or("DRY_RUN", true)?,
            slippage_tolerance: env_or("SLIPPAGE_TOLERANCE", Decimal::new(5, 2))?,
            min_price: env_or("MIN_PRICE", Decimal::new(1, 2))?,
            max_price: env_or("MAX_PRICE", Decimal::new(99, 2))?,
            max_daily_orders: env_or("MAX_DAILY_ORDERS", 50)?,
            max_daily_volume: env_opt("MAX_DAILY_VOLUME")?,
            max_total_exposure: env_opt("MAX_TOTAL_EXPOSURE")?,

            signer_url: env::var("SIGNER_URL").ok().filter(|s| !s.is_empty()),
            submit_max_attempts: env_or("SUBMIT_MAX_ATTEMPTS", 4)?,
            submit_base_delay: Duration::from_millis(env_or("SUBMIT_BASE_DELAY_MS", 500)?),
            submit_max_delay: Duration::from_millis(env_or("SUBMIT_MAX_DELAY_MS", 8_000)?),

            gamma_api_url: env::var("GAMMA_API_URL").unwrap_or_else(|_| GAMMA_API_BASE.into()),
            metrics_port: env_opt("METRICS_PORT")?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be positive");
        }
        if self.slippage_tolerance < Decimal::ZERO || self.slippage_tolerance >= Decimal::ONE {
            anyhow::bail!("SLIPPAGE_TOLERANCE must be in [0, 1)");
        }
        if self.min_price >= self.max_price {
            anyhow::bail!("MIN_PRICE must be below MAX_PRICE");
        }
        if self.max_daily_volume.is_some_and(|v| v <= Decimal::ZERO) {
            anyhow::bail!("MAX_DAILY_VOLUME must be positive");
        }
        if self.max_total_exposure.is_some_and(|v| v <= Decimal::ZERO) {
            anyhow::bail!("MAX_TOTAL_EXPOSURE must be positive");
        }
        if self.ledger_window <= chrono::Duration::zero() {
            anyhow::bail!("LEDGER_WINDOW_SECS must be positive");
        }
        Ok(())
    }

    /// The pipeline needs at least one node; registry commands do not.
    pub fn require_rpc(&self) -> anyhow::Result<()> {
        if self.rpc_urls.is_empty() {
            anyhow::bail!("RPC_URLS must list at least one endpoint");
        }
        Ok(())
    }

    /// Live submission needs a signer; without one the run stays simulated.
    pub fn effective_dry_run(&self) -> bool {
        self.dry_run || self.signer_url.is_none()
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            fault_cooldown: self.fault_cooldown,
            start_block: self.start_block,
            confirmations: self.confirmations,
            ranking_log_every: self.ranking_log_every,
        }
    }

    pub fn price_limits(&self) -> PriceLimits {
        PriceLimits {
            slippage_tolerance: self.slippage_tolerance,
            min_price: self.min_price,
            max_price: self.max_price,
        }
    }

    pub fn exposure_limits(&self) -> ExposureLimits {
        ExposureLimits {
            max_total_exposure: self.max_total_exposure,
            max_daily_orders: (self.max_daily_orders > 0).then_some(self.max_daily_orders),
            max_daily_volume: self.max_daily_volume,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.submit_max_attempts,
            self.submit_base_delay,
            self.submit_max_delay,
        )
    }
}
