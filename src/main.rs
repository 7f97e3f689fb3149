// =============================================================================
// gridloom — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode for safety. Live trading requires the
// explicit GRIDLOOM_LIVE=1 environment override.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod exchange;
mod grid;
mod indicators;
mod market_data;
mod regime;
mod supervisor;
mod types;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::GridConfig;
use crate::supervisor::Supervisor;
use crate::types::Credentials;

const CONFIG_PATH: &str = "grid_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("gridloom starting up");

    let mut config = GridConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        GridConfig::default()
    });

    // SAFETY: force dry-run on startup unless live trading is explicitly
    // requested.
    if std::env::var("GRIDLOOM_LIVE").as_deref() != Ok("1") {
        config.dry_run = true;
    }

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("GRIDLOOM_SYMBOLS") {
        let symbols: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }

    info!(
        symbols = ?config.symbols,
        dry_run = config.dry_run,
        tick_period_s = config.tick_period_s,
        "configuration resolved"
    );

    // ── 2. Credentials (opaque to the core; consumed by the gateway) ─────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let credentials = Credentials::new(api_key, api_secret);

    // ── 3. Run the supervisor until termination ──────────────────────────
    let supervisor = Supervisor::new(config.clone(), credentials);
    supervisor.run().await?;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("gridloom shut down complete");
    Ok(())
}
