// =============================================================================
// Grid Coordinator — the per-symbol control loop
// =============================================================================
//
// Each tick executes a fixed sequence:
//
//   1. Price snapshot (ticker, 1m-close fallback; skip the tick if absent).
//   2. Regime refresh (1d long-term, 1h short-term; Unknown preserves gates).
//   3. Long-term downtrend: cancel buys, cancel sells, liquidate the base
//      asset, clear the ledger, close the LT gate. Best-effort, in order.
//   4. Short-term downtrend: cancel buys, close the ST gate. Sells stay.
//   5. Gate recovery on a non-downtrend regime, with a one-tick placement
//      holdoff.
//   6. Breakout counter: sustained price above the top level forces a
//      rebuild.
//   7. Reconcile the ledger against the venue; cancel stray buys.
//   8. Geometry: rebuild the level set from volatility when needed.
//   9. Sizing: per-order notional over committed plus free quote capital.
//  10. Placement: missing grid buys, then paired exits for filled buys
//      (buy-first dependency), all guarded by the ledger's locks.
//
// The coordinator never surfaces recoverable conditions; it converges via the
// next tick. Only authentication failures propagate to the supervisor.
// =============================================================================

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::GridConfig;
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::grid::geometry::{
    build_levels, grid_spacing, next_level_above, quantize_qty, PriceLevel,
};
use crate::grid::ledger::{LedgerError, OrderLedger};
use crate::indicators::{self, compute_micro};
use crate::market_data::{CandleBuffer, DepthBuffer, SeriesKey, TickerBuffer, Timeframe};
use crate::regime::{Regime, RegimeClassifier};
use crate::types::{ExchangeOrder, Side};

/// Attempts to read a price before the tick is skipped.
const PRICE_ATTEMPTS: u32 = 3;

pub struct GridCoordinator {
    symbol: String,
    config: GridConfig,
    gateway: Arc<dyn ExchangeGateway>,
    candles: Arc<CandleBuffer>,
    ticker: Arc<TickerBuffer>,
    depth: Arc<DepthBuffer>,
    classifier: RegimeClassifier,
    ledger: OrderLedger,
    grid_levels: Vec<PriceLevel>,
    /// Long-term (1d) trade gate. Both gates must be open to place buys.
    lt_gate: bool,
    /// Short-term (1h) trade gate.
    st_gate: bool,
    ticks_above_top: u32,
    rebuild_requested: bool,
    last_observe_ms: i64,
}

impl GridCoordinator {
    pub fn new(
        symbol: String,
        config: GridConfig,
        gateway: Arc<dyn ExchangeGateway>,
        candles: Arc<CandleBuffer>,
        ticker: Arc<TickerBuffer>,
        depth: Arc<DepthBuffer>,
    ) -> Self {
        let classifier = RegimeClassifier::new(config.regime.clone());
        let ledger = OrderLedger::new(config.filters.tick_size);
        Self {
            symbol,
            config,
            gateway,
            candles,
            ticker,
            depth,
            classifier,
            ledger,
            grid_levels: Vec::new(),
            lt_gate: true,
            st_gate: true,
            ticks_above_top: 0,
            rebuild_requested: false,
            last_observe_ms: 0,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn series_key(&self, timeframe: Timeframe) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), timeframe)
    }

    /// Log-and-continue for best-effort venue calls; only authentication
    /// failures escalate.
    fn tolerate(&self, what: &str, e: ExchangeError) -> Result<(), ExchangeError> {
        if matches!(e, ExchangeError::Auth(_)) {
            error!(symbol = %self.symbol, what, error = %e, "authentication failure");
            return Err(e);
        }
        warn!(symbol = %self.symbol, what, error = %e, "best-effort step failed");
        Ok(())
    }

    // =========================================================================
    // The tick
    // =========================================================================

    pub async fn tick(&mut self) -> Result<(), ExchangeError> {
        // ── Step 1: price snapshot ───────────────────────────────────────
        let Some(price) = self.current_price().await else {
            warn!(symbol = %self.symbol, "no price available — skipping tick");
            return Ok(());
        };

        let micro = compute_micro(
            self.ticker.latest(&self.symbol).as_ref(),
            self.depth.snapshot(&self.symbol).as_ref(),
            &self.candles.snapshot(&self.series_key(Timeframe::M1)),
        );
        debug!(
            symbol = %self.symbol,
            price,
            spread = micro.bid_ask_spread,
            imbalance = micro.order_book_imbalance,
            surge = micro.volume_surge_ratio,
            "tick snapshot"
        );

        // ── Step 2: regime refresh ───────────────────────────────────────
        let lt = self.classifier.classify(&self.candles, &self.symbol, Timeframe::D1);
        let st = self.classifier.classify(&self.candles, &self.symbol, Timeframe::H1);
        info!(symbol = %self.symbol, lt = %lt, st = %st, price, "regimes");

        // ── Steps 3–4: downtrend reactions ───────────────────────────────
        if self.lt_gate && lt == Regime::Downtrend {
            self.react_long_term_downtrend().await?;
        } else if self.st_gate && st == Regime::Downtrend {
            self.react_short_term_downtrend().await?;
        }

        // ── Step 5: gate recovery (placement resumes next tick) ──────────
        let mut recovered = false;
        if !self.lt_gate && lt.permits_recovery() {
            self.lt_gate = true;
            recovered = true;
            info!(symbol = %self.symbol, regime = %lt, "long-term gate re-enabled");
        }
        if !self.st_gate && st.permits_recovery() {
            self.st_gate = true;
            recovered = true;
            info!(symbol = %self.symbol, regime = %st, "short-term gate re-enabled");
        }

        // ── Step 6: breakout counter ─────────────────────────────────────
        if let Some(top) = self.grid_levels.last().copied() {
            let tick_size = self.config.filters.tick_size;
            if price > top.price(tick_size) + tick_size * 0.5 {
                self.ticks_above_top += 1;
            } else {
                self.ticks_above_top = 0;
            }
            if self.ticks_above_top >= self.config.reset_ticks_above_top {
                info!(
                    symbol = %self.symbol,
                    ticks = self.ticks_above_top,
                    top = top.price(tick_size),
                    "price broke out above the grid — rebuilding"
                );
                if let Err(e) = self.gateway.cancel_all(&self.symbol, Side::Buy).await {
                    self.tolerate("breakout cancel buys", e)?;
                }
                self.rebuild_requested = true;
                self.ticks_above_top = 0;
            }
        }

        // ── Step 7: reconcile ────────────────────────────────────────────
        let mut reconciled = false;
        if self.lt_gate && self.st_gate {
            reconciled = self.reconcile().await?;
        }

        // ── Step 8: geometry ─────────────────────────────────────────────
        if self.lt_gate && self.st_gate && (self.grid_levels.is_empty() || self.rebuild_requested)
        {
            self.rebuild_grid(price);
        }

        // ── Steps 9–10: sizing and placement ─────────────────────────────
        if self.lt_gate && self.st_gate && reconciled && !recovered && !self.grid_levels.is_empty()
        {
            self.place_orders(price).await?;
        }

        // Housekeeping: drop terminal entries at abandoned levels.
        let mut desired: HashSet<PriceLevel> = self
            .ledger
            .desired_buy_levels(price, &self.grid_levels, self.config.levels_below)
            .into_iter()
            .collect();
        if let Some(sell) = self.ledger.desired_sell_level(price, &self.grid_levels) {
            desired.insert(sell);
        }
        self.ledger.prune_inactive(&desired);

        Ok(())
    }

    // =========================================================================
    // Step 1 helper
    // =========================================================================

    /// Latest ticker price, falling back to the last 1m close. Retried a few
    /// times before the tick is abandoned.
    async fn current_price(&self) -> Option<f64> {
        for attempt in 0..PRICE_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            if let Some(tick) = self.ticker.latest(&self.symbol) {
                if tick.last_price > 0.0 {
                    return Some(tick.last_price);
                }
            }
            if let Some(close) = self.candles.last_close(&self.series_key(Timeframe::M1)) {
                if close > 0.0 {
                    return Some(close);
                }
            }
        }
        None
    }

    // =========================================================================
    // Steps 3–4: regime reactions
    // =========================================================================

    /// Long-term downtrend: flatten everything. The sequence is attempted in
    /// order and is best-effort; the exchange remains authoritative.
    async fn react_long_term_downtrend(&mut self) -> Result<(), ExchangeError> {
        warn!(symbol = %self.symbol, "long-term downtrend — liquidating position");

        if let Err(e) = self.gateway.cancel_all(&self.symbol, Side::Buy).await {
            self.tolerate("liquidation: cancel buys", e)?;
        }
        if let Err(e) = self.gateway.cancel_all(&self.symbol, Side::Sell).await {
            self.tolerate("liquidation: cancel sells", e)?;
        }

        match self.gateway.get_balance(&self.config.base_asset).await {
            Ok(balance) => {
                let qty = quantize_qty(balance, self.config.filters.step_size);
                if qty > 0.0 {
                    match self.gateway.create_market_sell(&self.symbol, qty).await {
                        Ok(id) => {
                            info!(symbol = %self.symbol, qty, id = %id, "base asset liquidated")
                        }
                        Err(e) => self.tolerate("liquidation: market sell", e)?,
                    }
                }
            }
            Err(e) => self.tolerate("liquidation: read base balance", e)?,
        }

        self.ledger.clear();
        self.grid_levels.clear();
        self.lt_gate = false;
        Ok(())
    }

    /// Short-term downtrend: stop accumulating, keep harvesting upside.
    async fn react_short_term_downtrend(&mut self) -> Result<(), ExchangeError> {
        warn!(symbol = %self.symbol, "short-term downtrend — pulling buy orders");
        if let Err(e) = self.gateway.cancel_all(&self.symbol, Side::Buy).await {
            self.tolerate("short-term: cancel buys", e)?;
        }
        self.st_gate = false;
        Ok(())
    }

    // =========================================================================
    // Step 7: reconcile
    // =========================================================================

    /// Merge the venue's recent order view into the ledger and cancel stray
    /// buys. Returns false when reconciliation was deferred; placements are
    /// skipped for this tick in that case.
    async fn reconcile(&mut self) -> Result<bool, ExchangeError> {
        let open = match self.gateway.fetch_open_orders(&self.symbol).await {
            Ok(orders) => orders,
            Err(e @ ExchangeError::Auth(_)) => return Err(e),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "reconcile deferred — open orders unavailable");
                return Ok(false);
            }
        };
        let since = match self
            .gateway
            .fetch_orders_since(&self.symbol, self.last_observe_ms)
            .await
        {
            Ok(orders) => orders,
            Err(e @ ExchangeError::Auth(_)) => return Err(e),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "reconcile deferred — order history unavailable");
                return Ok(false);
            }
        };

        // Merge by id, newest update wins.
        let mut merged: HashMap<String, ExchangeOrder> = HashMap::new();
        for order in open.into_iter().chain(since) {
            self.last_observe_ms = self.last_observe_ms.max(order.update_time_ms);
            match merged.entry(order.id.clone()) {
                Entry::Occupied(mut slot) => {
                    if order.update_time_ms >= slot.get().update_time_ms {
                        slot.insert(order);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(order);
                }
            }
        }
        let view: Vec<ExchangeOrder> = merged.into_values().collect();

        match self.ledger.observe(&view) {
            Ok(report) => {
                debug!(
                    symbol = %self.symbol,
                    matched = report.matched,
                    strays = report.strays.len(),
                    "ledger reconciled"
                );
                // Sell-side strays may be exits in flight; leave them alone.
                for stray in report.strays.iter().filter(|o| o.side == Side::Buy) {
                    info!(
                        symbol = %self.symbol,
                        order_id = %stray.id,
                        price = stray.price,
                        "cancelling stray buy"
                    );
                    if let Err(e) = self.gateway.cancel_order(&self.symbol, &stray.id).await {
                        self.tolerate("cancel stray buy", e)?;
                    }
                }
                Ok(true)
            }
            Err(violation) => {
                self.handle_invariant_violation(&violation).await?;
                Ok(false)
            }
        }
    }

    /// Fatal for the symbol's current grid: pull buys, drop local state, and
    /// rebuild from exchange truth on the next tick.
    async fn handle_invariant_violation(
        &mut self,
        violation: &LedgerError,
    ) -> Result<(), ExchangeError> {
        error!(symbol = %self.symbol, error = %violation, "ledger invariant violated — resetting symbol state");
        if let Err(e) = self.gateway.cancel_all(&self.symbol, Side::Buy).await {
            self.tolerate("invariant reset: cancel buys", e)?;
        }
        self.ledger.clear();
        self.grid_levels.clear();
        self.rebuild_requested = true;
        Ok(())
    }

    // =========================================================================
    // Step 8: geometry
    // =========================================================================

    fn rebuild_grid(&mut self, price: f64) {
        let snapshot = self.candles.snapshot(&self.series_key(Timeframe::H1));
        let Some(set) = indicators::compute(&snapshot) else {
            warn!(symbol = %self.symbol, "grid rebuild deferred — volatility unavailable");
            return;
        };

        let spacing = grid_spacing(
            price,
            set.atr14,
            self.config.atr_multiplier,
            self.config.min_spacing_pct,
        );
        self.grid_levels = build_levels(
            price,
            spacing,
            self.config.grid_levels_n,
            self.config.levels_above,
            self.config.filters.tick_size,
        );
        self.rebuild_requested = false;
        self.ticks_above_top = 0;
        info!(
            symbol = %self.symbol,
            price,
            atr = set.atr14,
            spacing,
            levels = self.grid_levels.len(),
            "grid rebuilt"
        );
    }

    // =========================================================================
    // Steps 9–10: sizing and placement
    // =========================================================================

    async fn place_orders(&mut self, price: f64) -> Result<(), ExchangeError> {
        let tick_size = self.config.filters.tick_size;
        let step_size = self.config.filters.step_size;

        // Buy-first dependency: exits for filled buys go out before anything
        // else. The paired sell sits one grid level above the fill, same
        // quantity.
        for (level, qty) in self.ledger.unpaired_filled_buys() {
            let Some(target) = next_level_above(&self.grid_levels, level) else {
                debug!(
                    symbol = %self.symbol,
                    level_ticks = level.ticks(),
                    "no grid level above filled buy — exit deferred"
                );
                continue;
            };
            if self.ledger.has_live(target, Side::Sell) || self.ledger.is_locked(target, Side::Sell)
            {
                continue;
            }

            let sell_price = target.price(tick_size);
            match self.gateway.create_limit_sell(&self.symbol, sell_price, qty).await {
                Ok(id) => {
                    info!(symbol = %self.symbol, price = sell_price, qty, id = %id, "paired sell placed");
                    if let Err(v) = self.ledger.register_placement(target, Side::Sell, id, qty) {
                        self.handle_invariant_violation(&v).await?;
                        return Ok(());
                    }
                    self.ledger.mark_paired(level);
                }
                Err(e) => self.tolerate("place paired sell", e)?,
            }
        }

        // Step 9 — per-order notional: committed buy capital is treated as
        // fungible with free quote balance.
        let quote_balance = match self.gateway.get_balance(&self.config.quote_asset).await {
            Ok(balance) => balance,
            Err(e @ ExchangeError::Auth(_)) => return Err(e),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "sizing deferred — quote balance unavailable");
                return Ok(());
            }
        };
        let open_value = self.ledger.open_buy_value();
        let per_order_notional = self.config.notional_fraction * (open_value + quote_balance)
            / self.config.grid_levels_n as f64;

        // Step 10 — fill in missing grid buys.
        let desired =
            self.ledger
                .desired_buy_levels(price, &self.grid_levels, self.config.levels_below);
        for level in desired {
            if self.ledger.has_live(level, Side::Buy) || self.ledger.is_locked(level, Side::Buy) {
                continue;
            }

            let buy_price = level.price(tick_size);
            let qty = quantize_qty(per_order_notional / buy_price, step_size);
            if qty * buy_price < self.config.filters.min_notional {
                debug!(
                    symbol = %self.symbol,
                    price = buy_price,
                    qty,
                    "undersized order skipped"
                );
                continue;
            }

            match self.gateway.create_limit_buy(&self.symbol, buy_price, qty).await {
                Ok(id) => {
                    info!(symbol = %self.symbol, price = buy_price, qty, id = %id, "grid buy placed");
                    if let Err(v) = self.ledger.register_placement(level, Side::Buy, id, qty) {
                        self.handle_invariant_violation(&v).await?;
                        return Ok(());
                    }
                }
                Err(e) => self.tolerate("place grid buy", e)?,
            }
        }

        Ok(())
    }
}

// =============================================================================
// Scenario tests — driven end-to-end against the dry-run gateway
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::gateway::DryRunGateway;
    use crate::market_data::{Candle, TickerTick};
    use crate::types::OrderState;

    const TICK: f64 = 0.00001;
    const SYMBOL: &str = "BTCUSDT";

    struct Harness {
        coordinator: GridCoordinator,
        gateway: Arc<DryRunGateway>,
        candles: Arc<CandleBuffer>,
        ticker: Arc<TickerBuffer>,
        next_event_ms: i64,
    }

    fn test_config() -> GridConfig {
        let mut config = GridConfig::default();
        config.dry_run = true;
        config.dry_run_fixtures.quote_balance = 1000.0;
        config.dry_run_fixtures.base_balance = 0.0;
        config
    }

    fn harness() -> Harness {
        let config = test_config();
        let gateway = Arc::new(DryRunGateway::new(&config));
        let candles = Arc::new(CandleBuffer::new(config.retention.clone()));
        let ticker = Arc::new(TickerBuffer::new(config.retention.ticker));
        let depth = Arc::new(DepthBuffer::new());

        let coordinator = GridCoordinator::new(
            SYMBOL.to_string(),
            config,
            gateway.clone(),
            candles.clone(),
            ticker.clone(),
            depth,
        );

        Harness {
            coordinator,
            gateway,
            candles,
            ticker,
            next_event_ms: 1,
        }
    }

    impl Harness {
        fn push_price(&mut self, price: f64) {
            let tick = TickerTick {
                event_time_ms: self.next_event_ms,
                last_price: price,
                best_bid: price - TICK,
                best_bid_qty: 5.0,
                best_ask: price + TICK,
                best_ask_qty: 5.0,
                volume_24h: 1000.0,
            };
            self.next_event_ms += 1;
            self.ticker.append(SYMBOL, tick);
        }

        fn open_orders(&self) -> Vec<ExchangeOrder> {
            self.gateway
                .orders_snapshot()
                .into_iter()
                .filter(|o| o.state == OrderState::Open)
                .collect()
        }

        fn open_buys(&self) -> Vec<ExchangeOrder> {
            self.open_orders()
                .into_iter()
                .filter(|o| o.side == Side::Buy)
                .collect()
        }

        fn open_sells(&self) -> Vec<ExchangeOrder> {
            self.open_orders()
                .into_iter()
                .filter(|o| o.side == Side::Sell)
                .collect()
        }

        fn open_buy_at(&self, price: f64) -> Option<ExchangeOrder> {
            self.open_buys()
                .into_iter()
                .find(|o| (o.price - price).abs() < 1e-9)
        }
    }

    // ---- candle fixtures --------------------------------------------------

    /// Flat closes with a constant bar range: ATR = 2 * half_range, ADX ~ 0.
    fn flat_candles(tf: Timeframe, n: usize, price: f64, half_range: f64) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                Candle::new(
                    i * tf.duration_ms(),
                    price,
                    price + half_range,
                    price - half_range,
                    price,
                    10.0,
                    (i + 1) * tf.duration_ms() - 1,
                )
            })
            .collect()
    }

    /// Drifting closes with wobble: alternating moves of `first` / `second`,
    /// highs/lows 0.2 around the close. Tuned so ADX >= 20 and RSI stays
    /// inside the (30, 70) band.
    fn drift_candles(tf: Timeframe, n: usize, start: f64, first: f64, second: f64) -> Vec<Candle> {
        let mut close = start;
        (0..n as i64)
            .map(|i| {
                if i > 0 {
                    close += if i % 2 == 1 { first } else { second };
                }
                Candle::new(
                    i * tf.duration_ms(),
                    close,
                    close + 0.2,
                    close - 0.2,
                    close,
                    10.0,
                    (i + 1) * tf.duration_ms() - 1,
                )
            })
            .collect()
    }

    fn downtrend(tf: Timeframe) -> Vec<Candle> {
        drift_candles(tf, 120, 500.0, -1.0, 0.6)
    }

    fn sideways_h1(h: &Harness) {
        h.candles.preload(
            SeriesKey::new(SYMBOL, Timeframe::H1),
            flat_candles(Timeframe::H1, 72, 0.1, 0.001),
        );
    }

    fn sideways_d1(h: &Harness) {
        h.candles.preload(
            SeriesKey::new(SYMBOL, Timeframe::D1),
            flat_candles(Timeframe::D1, 60, 0.1, 0.001),
        );
    }

    /// Cold-start market: sideways on both gates, P = 0.10000, atr(1h) =
    /// 0.00200.
    fn seed_sideways(h: &mut Harness) {
        sideways_h1(h);
        sideways_d1(h);
        h.push_price(0.1);
    }

    // ---- Scenario A: cold start -------------------------------------------

    #[tokio::test]
    async fn cold_start_places_five_buys_and_no_sell() {
        let mut h = harness();
        seed_sideways(&mut h);

        h.coordinator.tick().await.unwrap();

        assert!(h.coordinator.lt_gate);
        assert!(h.coordinator.st_gate);

        // Spacing = max(2 * 0.002, 0.012 * 0.1) = 0.004; top = P + S.
        assert_eq!(h.coordinator.grid_levels.len(), 20);
        let top = h.coordinator.grid_levels.last().unwrap().price(TICK);
        assert!((top - 0.104).abs() < 1e-9);
        for expect in [0.092, 0.096, 0.1, 0.104] {
            assert!(
                h.coordinator
                    .grid_levels
                    .iter()
                    .any(|l| (l.price(TICK) - expect).abs() < 1e-9),
                "missing level {expect}"
            );
        }

        // Five buy placements below price; the sell waits for a fill.
        let mut buy_prices: Vec<f64> = h.open_buys().iter().map(|o| o.price).collect();
        buy_prices.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(buy_prices.len(), 5);
        for (got, expect) in buy_prices.iter().zip([0.080, 0.084, 0.088, 0.092, 0.096]) {
            assert!((got - expect).abs() < 1e-9, "got {got}, expected {expect}");
        }
        assert!(h.open_sells().is_empty());

        // Sizing: V = 0.75 * 1000 / 20 = 37.5 quote per order.
        let q = h.open_buy_at(0.096).unwrap().quantity;
        assert!((q - 390.625).abs() < 1e-3, "got qty {q}");
    }

    #[tokio::test]
    async fn back_to_back_ticks_are_idempotent() {
        let mut h = harness();
        seed_sideways(&mut h);

        h.coordinator.tick().await.unwrap();
        let mut first: Vec<String> = h.open_buys().iter().map(|o| o.id.clone()).collect();
        first.sort();

        h.coordinator.tick().await.unwrap();
        let mut second: Vec<String> = h.open_buys().iter().map(|o| o.id.clone()).collect();
        second.sort();

        assert_eq!(first, second);
        assert_eq!(h.open_buys().len(), 5);
    }

    // ---- Scenario B: buy fill produces the paired sell --------------------

    #[tokio::test]
    async fn filled_buy_gets_a_paired_sell_one_level_up() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();

        let buy = h.open_buy_at(0.096).unwrap();
        assert!(h.gateway.fill_order(&buy.id));

        h.coordinator.tick().await.unwrap();

        let sells = h.open_sells();
        assert_eq!(sells.len(), 1);
        assert!((sells[0].price - 0.1).abs() < 1e-9);
        assert!((sells[0].quantity - buy.quantity).abs() < 1e-9);

        // The vacated level gets a fresh buy.
        assert!(h.open_buy_at(0.096).is_some());
    }

    // ---- Scenario C: short-term downtrend ---------------------------------

    #[tokio::test]
    async fn short_term_downtrend_pulls_buys_keeps_sells() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();

        // Build some inventory so a sell is resting.
        let buy = h.open_buy_at(0.096).unwrap();
        h.gateway.fill_order(&buy.id);
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.open_sells().len(), 1);

        // Hourly regime turns down.
        h.candles
            .preload(SeriesKey::new(SYMBOL, Timeframe::H1), downtrend(Timeframe::H1));
        h.coordinator.tick().await.unwrap();

        assert!(!h.coordinator.st_gate);
        assert!(h.coordinator.lt_gate);
        assert!(h.open_buys().is_empty());
        assert_eq!(h.open_sells().len(), 1);

        // Recovery tick: the gate reopens but no buys are placed yet.
        sideways_h1(&h);
        h.coordinator.tick().await.unwrap();
        assert!(h.coordinator.st_gate);
        assert!(h.open_buys().is_empty());

        // The tick after recovery replaces the missing levels.
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.open_buys().len(), 5);
        assert_eq!(h.open_sells().len(), 1);
    }

    // ---- Scenario D: long-term downtrend ----------------------------------

    #[tokio::test]
    async fn long_term_downtrend_liquidates_everything() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();

        let buy = h.open_buy_at(0.096).unwrap();
        h.gateway.fill_order(&buy.id);
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.open_sells().len(), 1);
        assert!(h.gateway.orders_snapshot().len() > 1);

        // Daily regime turns down.
        h.candles
            .preload(SeriesKey::new(SYMBOL, Timeframe::D1), downtrend(Timeframe::D1));
        h.coordinator.tick().await.unwrap();

        assert!(!h.coordinator.lt_gate);
        assert!(h.open_orders().is_empty(), "all orders cancelled");
        let base = h.gateway.fetch_open_orders(SYMBOL).await.unwrap();
        assert!(base.is_empty());
        // The entire base position was market-sold.
        assert!(h.gateway.orders_snapshot().iter().any(
            |o| o.side == Side::Sell && o.state == OrderState::Filled && o.price == 0.0
        ));
        assert!(h.coordinator.ledger.is_empty());

        // Recovery tick rebuilds the grid but places nothing.
        sideways_d1(&h);
        h.coordinator.tick().await.unwrap();
        assert!(h.coordinator.lt_gate);
        assert!(h.open_orders().is_empty());
        assert!(!h.coordinator.grid_levels.is_empty());

        // One more tick and the grid is live again.
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.open_buys().len(), 5);
    }

    #[tokio::test]
    async fn liquidation_drains_the_base_balance() {
        let mut h = harness();
        h.gateway.set_balance("BTC", 390.625);
        seed_sideways(&mut h);
        h.candles
            .preload(SeriesKey::new(SYMBOL, Timeframe::D1), downtrend(Timeframe::D1));

        h.coordinator.tick().await.unwrap();

        assert!(!h.coordinator.lt_gate);
        let base = h.gateway.get_balance("BTC").await.unwrap();
        assert!(base.abs() < 1e-9, "base balance should trend to zero, got {base}");
    }

    // ---- Scenario E: breakout reset ---------------------------------------

    #[tokio::test]
    async fn thirty_ticks_above_top_trigger_exactly_one_reset() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();
        let old_top = h.coordinator.grid_levels.last().unwrap().price(TICK);
        assert!((old_top - 0.104).abs() < 1e-9);

        // Price escapes above the grid.
        h.push_price(0.11);
        for i in 1..=29u32 {
            h.coordinator.tick().await.unwrap();
            assert_eq!(h.coordinator.ticks_above_top, i);
            let top = h.coordinator.grid_levels.last().unwrap().price(TICK);
            assert!((top - old_top).abs() < 1e-9, "grid must not move before the reset");
        }

        // Tick 30: buys cancelled, grid rebuilt around the new price.
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.coordinator.ticks_above_top, 0);
        let new_top = h.coordinator.grid_levels.last().unwrap().price(TICK);
        assert!((new_top - 0.114).abs() < 1e-9, "got new top {new_top}");

        // Only freshly placed buys below the new price remain.
        for buy in h.open_buys() {
            assert!(buy.price < 0.11);
            assert!(buy.price > 0.089);
        }
    }

    #[tokio::test]
    async fn dip_back_inside_resets_the_counter() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();

        h.push_price(0.11);
        for _ in 0..10 {
            h.coordinator.tick().await.unwrap();
        }
        assert_eq!(h.coordinator.ticks_above_top, 10);

        h.push_price(0.1);
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.coordinator.ticks_above_top, 0);
    }

    // ---- Scenario F: stray orders -----------------------------------------

    #[tokio::test]
    async fn stray_buy_is_cancelled_stray_sell_is_left() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();
        let ledger_size = h.coordinator.ledger.snapshot().len();

        h.gateway.inject_order(ExchangeOrder {
            id: "stray-buy".into(),
            symbol: SYMBOL.into(),
            side: Side::Buy,
            price: 0.097,
            quantity: 10.0,
            state: OrderState::Open,
            update_time_ms: 0,
        });
        h.gateway.inject_order(ExchangeOrder {
            id: "stray-sell".into(),
            symbol: SYMBOL.into(),
            side: Side::Sell,
            price: 0.107,
            quantity: 10.0,
            state: OrderState::Open,
            update_time_ms: 0,
        });

        h.coordinator.tick().await.unwrap();

        assert!(!h.open_orders().iter().any(|o| o.id == "stray-buy"));
        assert!(h.open_orders().iter().any(|o| o.id == "stray-sell"));
        // The ledger never adopted the strays.
        assert_eq!(h.coordinator.ledger.snapshot().len(), ledger_size);
    }

    // ---- Invariant violation ----------------------------------------------

    #[tokio::test]
    async fn duplicate_exchange_buys_reset_the_symbol_state() {
        let mut h = harness();
        seed_sideways(&mut h);
        h.coordinator.tick().await.unwrap();

        // A second live buy appears at a level the ledger already owns.
        h.gateway.inject_order(ExchangeOrder {
            id: "duplicate".into(),
            symbol: SYMBOL.into(),
            side: Side::Buy,
            price: 0.096,
            quantity: 10.0,
            state: OrderState::Open,
            update_time_ms: 0,
        });

        h.coordinator.tick().await.unwrap();
        assert!(h.open_buys().is_empty(), "all buys pulled on violation");
        assert!(h.coordinator.ledger.is_empty());

        // The next tick rebuilds from exchange truth.
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.open_buys().len(), 5);
    }

    // ---- Boundary behaviors -----------------------------------------------

    #[tokio::test]
    async fn empty_market_data_skips_the_tick() {
        let mut h = harness();
        h.coordinator.tick().await.unwrap();

        assert!(h.gateway.orders_snapshot().is_empty());
        assert!(h.coordinator.grid_levels.is_empty());
        assert_eq!(h.coordinator.ticks_above_top, 0);
    }

    #[tokio::test]
    async fn unknown_regime_preserves_gates() {
        let mut h = harness();
        h.push_price(0.1);
        // Ten candles are far below the indicator floor on both timeframes.
        h.candles.preload(
            SeriesKey::new(SYMBOL, Timeframe::H1),
            flat_candles(Timeframe::H1, 10, 0.1, 0.001),
        );
        h.candles.preload(
            SeriesKey::new(SYMBOL, Timeframe::D1),
            flat_candles(Timeframe::D1, 10, 0.1, 0.001),
        );

        h.coordinator.st_gate = false;
        h.coordinator.tick().await.unwrap();

        // Unknown flips nothing, in either direction.
        assert!(!h.coordinator.st_gate);
        assert!(h.coordinator.lt_gate);
        assert!(h.gateway.orders_snapshot().is_empty());
    }

    #[tokio::test]
    async fn missing_volatility_defers_the_grid() {
        let mut h = harness();
        h.push_price(0.1);
        // 1d is healthy, 1h has too little history for ATR.
        sideways_d1(&h);
        h.candles.preload(
            SeriesKey::new(SYMBOL, Timeframe::H1),
            flat_candles(Timeframe::H1, 10, 0.1, 0.001),
        );

        h.coordinator.tick().await.unwrap();
        assert!(h.coordinator.grid_levels.is_empty());
        assert!(h.gateway.orders_snapshot().is_empty());

        // Once the buffer catches up, the grid appears.
        sideways_h1(&h);
        h.coordinator.tick().await.unwrap();
        assert_eq!(h.coordinator.grid_levels.len(), 20);
        assert_eq!(h.open_buys().len(), 5);
    }
}
