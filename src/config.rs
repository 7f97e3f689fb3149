// =============================================================================
// Engine Configuration — JSON-backed settings with atomic save
// =============================================================================
//
// Every tunable of the grid engine lives here. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::Timeframe;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string()]
}

fn default_base_asset() -> String {
    "BTC".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_tick_period_s() -> u64 {
    45
}

fn default_grid_levels_n() -> usize {
    20
}

fn default_levels_below() -> usize {
    5
}

fn default_levels_above() -> usize {
    1
}

fn default_atr_multiplier() -> f64 {
    2.0
}

fn default_min_spacing_pct() -> f64 {
    0.012
}

fn default_notional_fraction() -> f64 {
    0.75
}

fn default_reset_ticks_above_top() -> u32 {
    30
}

fn default_adx_threshold() -> f64 {
    20.0
}

fn default_rsi_upper() -> f64 {
    70.0
}

fn default_rsi_lower() -> f64 {
    30.0
}

fn default_retention_1m() -> usize {
    120
}

fn default_retention_15m() -> usize {
    100
}

fn default_retention_1h() -> usize {
    100
}

fn default_retention_6h() -> usize {
    100
}

fn default_retention_1d() -> usize {
    90
}

fn default_retention_ticker() -> usize {
    1000
}

fn default_tick_size() -> f64 {
    0.00001
}

fn default_step_size() -> f64 {
    0.001
}

fn default_min_notional() -> f64 {
    1.0
}

fn default_dry_run_quote_balance() -> f64 {
    10_000.0
}

// =============================================================================
// Regime thresholds
// =============================================================================

/// Classifier boundaries. Supplied by configuration so the classifier accepts
/// overrides without code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// ADX boundary separating trending from sideways markets.
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,

    /// RSI overbought gate for uptrend classification.
    #[serde(default = "default_rsi_upper")]
    pub rsi_upper: f64,

    /// RSI oversold gate for downtrend classification.
    #[serde(default = "default_rsi_lower")]
    pub rsi_lower: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            adx_threshold: default_adx_threshold(),
            rsi_upper: default_rsi_upper(),
            rsi_lower: default_rsi_lower(),
        }
    }
}

// =============================================================================
// Buffer retention
// =============================================================================

/// Per-buffer retention caps. Floors: 1m/1d keep at least 60 candles, 1h at
/// least 72, and every timeframe at least twice the ADX period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_1m")]
    pub candles_1m: usize,
    #[serde(default = "default_retention_15m")]
    pub candles_15m: usize,
    #[serde(default = "default_retention_1h")]
    pub candles_1h: usize,
    #[serde(default = "default_retention_6h")]
    pub candles_6h: usize,
    #[serde(default = "default_retention_1d")]
    pub candles_1d: usize,
    #[serde(default = "default_retention_ticker")]
    pub ticker: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            candles_1m: default_retention_1m(),
            candles_15m: default_retention_15m(),
            candles_1h: default_retention_1h(),
            candles_6h: default_retention_6h(),
            candles_1d: default_retention_1d(),
            ticker: default_retention_ticker(),
        }
    }
}

impl RetentionConfig {
    /// Retention cap for a candle timeframe.
    pub fn for_timeframe(&self, tf: Timeframe) -> usize {
        match tf {
            Timeframe::M1 => self.candles_1m,
            Timeframe::M15 => self.candles_15m,
            Timeframe::H1 => self.candles_1h,
            Timeframe::H6 => self.candles_6h,
            Timeframe::D1 => self.candles_1d,
        }
    }
}

// =============================================================================
// Symbol filters
// =============================================================================

/// Exchange precision filters for a symbol. Prices are quantized to
/// `tick_size`, quantities to `step_size`; orders below `min_notional` are
/// rejected before they reach the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFilters {
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    #[serde(default = "default_min_notional")]
    pub min_notional: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            tick_size: default_tick_size(),
            step_size: default_step_size(),
            min_notional: default_min_notional(),
        }
    }
}

// =============================================================================
// Dry-run fixtures
// =============================================================================

/// Balances reported by the gateway when running against the simulated book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunFixtures {
    #[serde(default = "default_dry_run_quote_balance")]
    pub quote_balance: f64,
    #[serde(default)]
    pub base_balance: f64,
}

impl Default for DryRunFixtures {
    fn default() -> Self {
        Self {
            quote_balance: default_dry_run_quote_balance(),
            base_balance: 0.0,
        }
    }
}

// =============================================================================
// GridConfig
// =============================================================================

/// Top-level configuration for the gridloom engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Trading pairs the engine manages. Each symbol runs an independent
    /// coordinator.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Base asset of the (single) managed pair, liquidated on long-term
    /// downtrend.
    #[serde(default = "default_base_asset")]
    pub base_asset: String,

    /// Quote asset funding new grid buys.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Coordinator tick interval in seconds.
    #[serde(default = "default_tick_period_s")]
    pub tick_period_s: u64,

    /// Total number of grid levels.
    #[serde(default = "default_grid_levels_n")]
    pub grid_levels_n: usize,

    /// Buy levels to maintain below the current price.
    #[serde(default = "default_levels_below")]
    pub levels_below: usize,

    /// Sell levels kept above the current price at grid construction.
    #[serde(default = "default_levels_above")]
    pub levels_above: usize,

    /// Spacing multiplier on ATR.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    /// Floor spacing as a fraction of price.
    #[serde(default = "default_min_spacing_pct")]
    pub min_spacing_pct: f64,

    /// Fraction of deployable capital spread across the grid.
    #[serde(default = "default_notional_fraction")]
    pub notional_fraction: f64,

    /// Consecutive ticks above the top grid level that trigger a rebuild.
    #[serde(default = "default_reset_ticks_above_top")]
    pub reset_ticks_above_top: u32,

    /// Regime classifier thresholds.
    #[serde(default)]
    pub regime: RegimeThresholds,

    /// When true, order-mutating calls never reach the venue.
    #[serde(default)]
    pub dry_run: bool,

    /// Per-buffer retention caps.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Exchange precision filters.
    #[serde(default)]
    pub filters: SymbolFilters,

    /// Balances reported in dry-run mode.
    #[serde(default)]
    pub dry_run_fixtures: DryRunFixtures,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            tick_period_s: default_tick_period_s(),
            grid_levels_n: default_grid_levels_n(),
            levels_below: default_levels_below(),
            levels_above: default_levels_above(),
            atr_multiplier: default_atr_multiplier(),
            min_spacing_pct: default_min_spacing_pct(),
            notional_fraction: default_notional_fraction(),
            reset_ticks_above_top: default_reset_ticks_above_top(),
            regime: RegimeThresholds::default(),
            dry_run: false,
            retention: RetentionConfig::default(),
            filters: SymbolFilters::default(),
            dry_run_fixtures: DryRunFixtures::default(),
        }
    }
}

impl GridConfig {
    /// Coordinator tick period.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_period_s)
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            dry_run = config.dry_run,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = GridConfig::default();
        assert_eq!(cfg.symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.tick_period_s, 45);
        assert_eq!(cfg.grid_levels_n, 20);
        assert_eq!(cfg.levels_below, 5);
        assert_eq!(cfg.levels_above, 1);
        assert!((cfg.atr_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((cfg.min_spacing_pct - 0.012).abs() < f64::EPSILON);
        assert!((cfg.notional_fraction - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.reset_ticks_above_top, 30);
        assert!((cfg.regime.adx_threshold - 20.0).abs() < f64::EPSILON);
        assert!((cfg.regime.rsi_upper - 70.0).abs() < f64::EPSILON);
        assert!((cfg.regime.rsi_lower - 30.0).abs() < f64::EPSILON);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn retention_meets_indicator_floors() {
        let r = RetentionConfig::default();
        assert!(r.candles_1m >= 60);
        assert!(r.candles_1h >= 72);
        assert!(r.candles_1d >= 60);
        for tf in [
            Timeframe::M1,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H6,
            Timeframe::D1,
        ] {
            assert!(r.for_timeframe(tf) >= 28, "retention below 2x ADX period");
        }
        assert_eq!(r.ticker, 1000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: GridConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.grid_levels_n, 20);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "dry_run": true, "tick_period_s": 30 }"#;
        let cfg: GridConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert!(cfg.dry_run);
        assert_eq!(cfg.tick_period_s, 30);
        assert_eq!(cfg.levels_below, 5);
    }

    #[test]
    fn regime_thresholds_accept_overrides() {
        let json = r#"{ "regime": { "adx_threshold": 25.0, "rsi_upper": 75.0 } }"#;
        let cfg: GridConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.regime.adx_threshold - 25.0).abs() < f64::EPSILON);
        assert!((cfg.regime.rsi_upper - 75.0).abs() < f64::EPSILON);
        assert!((cfg.regime.rsi_lower - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = GridConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: GridConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.grid_levels_n, cfg2.grid_levels_n);
        assert_eq!(cfg.tick_period_s, cfg2.tick_period_s);
    }
}
