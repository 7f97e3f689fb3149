// =============================================================================
// Lifecycle Supervisor — startup ordering, periodic ticking, shutdown
// =============================================================================
//
// Startup order: gateway ready -> preload buffers -> subscribe streams ->
// initial reconciliation -> tick loops. Each symbol's coordinator runs as a
// single task; its stream subscriptions and periodic REST refreshes run as
// sibling tasks. Stream tasks reconnect with exponential backoff (start 5 s,
// cap 60 s).
//
// Shutdown (ctrl-c or an escalated authentication failure): stop the ticks,
// cancel all open orders for every managed symbol (unless dry-run), close the
// stream tasks. A second signal during shutdown is coalesced.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::GridConfig;
use crate::exchange::client::RestClient;
use crate::exchange::{build_gateway, streams, ExchangeError, ExchangeGateway};
use crate::grid::GridCoordinator;
use crate::market_data::{CandleBuffer, DepthBuffer, SeriesKey, TickerBuffer, Timeframe};
use crate::types::{Credentials, Side};

/// First reconnect delay for stream tasks.
const STREAM_BACKOFF_START: Duration = Duration::from_secs(5);
/// Reconnect delay ceiling.
const STREAM_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Timeframes fed by WebSocket streams; the rest are REST-polled.
const STREAMED_TIMEFRAMES: [Timeframe; 3] = [Timeframe::M1, Timeframe::M15, Timeframe::H6];

/// REST refresh cadence per polled timeframe (seconds).
const REST_REFRESH: [(Timeframe, u64); 2] = [(Timeframe::H1, 60), (Timeframe::D1, 300)];

fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(STREAM_BACKOFF_CAP)
}

pub struct Supervisor {
    config: GridConfig,
    gateway: Arc<dyn ExchangeGateway>,
    rest: Arc<RestClient>,
    candles: Arc<CandleBuffer>,
    ticker: Arc<TickerBuffer>,
    depth: Arc<DepthBuffer>,
}

impl Supervisor {
    /// Wire up the process-wide resources. The REST client serves public
    /// market-data reads in both modes; order mutations go through the
    /// gateway, which the configuration may place in dry-run.
    pub fn new(config: GridConfig, credentials: Credentials) -> Self {
        let gateway = build_gateway(&config, credentials.clone());
        let rest = Arc::new(RestClient::new(credentials));
        let candles = Arc::new(CandleBuffer::new(config.retention.clone()));
        let ticker = Arc::new(TickerBuffer::new(config.retention.ticker));
        let depth = Arc::new(DepthBuffer::new());

        Self {
            config,
            gateway,
            rest,
            candles,
            ticker,
            depth,
        }
    }

    /// Run until a termination signal arrives, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── 1. Preload candle buffers over REST ──────────────────────────
        self.preload_buffers().await;

        // ── 2. Stream subscriptions + periodic refreshes ─────────────────
        let mut stream_tasks: Vec<JoinHandle<()>> = Vec::new();
        for symbol in &self.config.symbols {
            stream_tasks.extend(self.spawn_symbol_streams(symbol, shutdown_rx.clone()));
        }
        info!(count = stream_tasks.len(), "market data tasks launched");

        // ── 3. Initial reconciliation against the venue ──────────────────
        for symbol in &self.config.symbols {
            match self.gateway.fetch_open_orders(symbol).await {
                Ok(orders) => {
                    info!(symbol, open_orders = orders.len(), "initial exchange view")
                }
                Err(e) => warn!(symbol, error = %e, "initial reconcile failed — coordinator will retry"),
            }
        }

        // ── 4. Coordinator tick loops, one task per symbol ───────────────
        let mut tick_tasks: Vec<JoinHandle<()>> = Vec::new();
        for symbol in &self.config.symbols {
            tick_tasks.push(self.spawn_coordinator(symbol.clone(), shutdown_tx.clone()));
        }

        info!("all subsystems running — press ctrl-c to stop");

        // ── 5. Wait for shutdown ─────────────────────────────────────────
        let mut shutdown_watch = shutdown_rx.clone();
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                warn!("termination signal received — shutting down");
            }
            _ = shutdown_watch.changed() => {
                warn!("internal escalation — shutting down");
            }
        }

        // Idempotent: repeat signals during shutdown have no listener left.
        let _ = shutdown_tx.send(true);

        // ── 6. Teardown: ticks stop via the watch, then orders come off ──
        for task in tick_tasks {
            let _ = task.await;
        }

        if self.config.dry_run {
            info!("dry-run — skipping venue order cancellation");
        } else {
            for symbol in &self.config.symbols {
                for side in [Side::Buy, Side::Sell] {
                    match self.gateway.cancel_all(symbol, side).await {
                        Ok(ids) => info!(symbol, side = %side, count = ids.len(), "orders cancelled on shutdown"),
                        Err(e) => warn!(symbol, side = %side, error = %e, "shutdown cancel failed"),
                    }
                }
            }
        }

        for task in &stream_tasks {
            task.abort();
        }

        info!("shutdown complete");
        Ok(())
    }

    // =========================================================================
    // Startup pieces
    // =========================================================================

    /// Fetch the historical window for every (symbol, timeframe). Failures
    /// leave the buffer empty; indicators stay undefined and the coordinator
    /// defers until the stream or refresh task catches up.
    async fn preload_buffers(&self) {
        for symbol in &self.config.symbols {
            for tf in Timeframe::ALL {
                let horizon = tf.preload_horizon();
                match self.rest.klines(symbol, tf, horizon).await {
                    Ok(rows) => {
                        let key = SeriesKey::new(symbol.as_str(), tf);
                        info!(symbol, timeframe = %tf, count = rows.len(), "buffer preloaded");
                        self.candles.preload(key, rows);
                    }
                    Err(e) => {
                        warn!(symbol, timeframe = %tf, error = %e, "preload failed — buffer starts empty")
                    }
                }
            }
        }
    }

    /// Spawn the ticker, depth, streamed-kline, and REST-refresh tasks for a
    /// symbol. Every task reconnects with exponential backoff and exits when
    /// the shutdown watch flips.
    fn spawn_symbol_streams(
        &self,
        symbol: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        // Ticker stream.
        {
            let buffer = self.ticker.clone();
            let sym = symbol.to_string();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                supervise_stream(shutdown, &sym, "ticker", |sym| {
                    let buffer = buffer.clone();
                    async move { streams::run_ticker_stream(&sym, &buffer).await }
                })
                .await;
            }));
        }

        // Depth stream.
        {
            let buffer = self.depth.clone();
            let sym = symbol.to_string();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                supervise_stream(shutdown, &sym, "depth", |sym| {
                    let buffer = buffer.clone();
                    async move { streams::run_depth_stream(&sym, &buffer).await }
                })
                .await;
            }));
        }

        // Kline streams.
        for tf in STREAMED_TIMEFRAMES {
            let buffer = self.candles.clone();
            let sym = symbol.to_string();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                supervise_stream(shutdown, &sym, tf.as_str(), |sym| {
                    let buffer = buffer.clone();
                    async move { streams::run_kline_stream(&sym, tf, &buffer).await }
                })
                .await;
            }));
        }

        // REST refresh for the slow timeframes.
        for (tf, period_s) in REST_REFRESH {
            let rest = self.rest.clone();
            let buffer = self.candles.clone();
            let sym = symbol.to_string();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(period_s));
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = interval.tick() => {}
                    }
                    match rest.klines(&sym, tf, 2).await {
                        Ok(rows) => {
                            let key = SeriesKey::new(sym.as_str(), tf);
                            for candle in rows {
                                // Idempotent append: known timestamps drop.
                                if buffer.append(key.clone(), candle) {
                                    info!(symbol = %sym, timeframe = %tf, "refresh appended candle");
                                }
                            }
                        }
                        Err(e) => warn!(symbol = %sym, timeframe = %tf, error = %e, "periodic refresh failed"),
                    }
                }
            }));
        }

        tasks
    }

    /// Run one coordinator at the configured period. A tick that exceeds twice
    /// the period is cancelled and retried next period; an authentication
    /// failure escalates to process shutdown.
    fn spawn_coordinator(&self, symbol: String, shutdown_tx: watch::Sender<bool>) -> JoinHandle<()> {
        let mut coordinator = GridCoordinator::new(
            symbol.clone(),
            self.config.clone(),
            self.gateway.clone(),
            self.candles.clone(),
            self.ticker.clone(),
            self.depth.clone(),
        );
        let period = self.config.tick_period();
        let mut shutdown = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(symbol = %coordinator.symbol(), "tick loop stopped");
                        return;
                    }
                    _ = interval.tick() => {}
                }

                match tokio::time::timeout(period * 2, coordinator.tick()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e @ ExchangeError::Auth(_))) => {
                        error!(symbol = %coordinator.symbol(), error = %e, "authentication failure — escalating shutdown");
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(symbol = %coordinator.symbol(), error = %e, "tick failed — retrying next period")
                    }
                    Err(_) => {
                        warn!(symbol = %coordinator.symbol(), "tick exceeded 2x period — cancelled; exchange truth reconciles next tick")
                    }
                }
            }
        })
    }
}

/// Reconnect loop shared by the stream tasks: exponential backoff on error,
/// reset after a clean run, exit when the shutdown watch flips.
async fn supervise_stream<F, Fut>(
    mut shutdown: watch::Receiver<bool>,
    symbol: &str,
    what: &str,
    mut connect: F,
) where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut delay = STREAM_BACKOFF_START;
    loop {
        if *shutdown.borrow() {
            return;
        }

        let outcome = tokio::select! {
            _ = shutdown.changed() => return,
            outcome = connect(symbol.to_string()) => outcome,
        };

        match outcome {
            Ok(()) => {
                warn!(symbol, what, "stream ended — reconnecting");
                delay = STREAM_BACKOFF_START;
            }
            Err(e) => {
                error!(symbol, what, error = %e, delay_s = delay.as_secs(), "stream error — backing off");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_backoff(delay);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = STREAM_BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn refresh_covers_the_polled_timeframes() {
        let polled: Vec<Timeframe> = REST_REFRESH.iter().map(|(tf, _)| *tf).collect();
        assert!(polled.contains(&Timeframe::H1));
        assert!(polled.contains(&Timeframe::D1));
        for (tf, _) in REST_REFRESH {
            assert!(tf.rest_refreshed());
        }
        for tf in STREAMED_TIMEFRAMES {
            assert!(!tf.rest_refreshed());
            assert!(!polled.contains(&tf), "{tf} must not be both streamed and polled");
        }
    }
}
