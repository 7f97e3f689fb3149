// =============================================================================
// Exchange Gateway — capability façade over the venue
// =============================================================================
//
// The core consumes this narrow trait and never touches the REST client
// directly. Two implementations exist:
//
//   * `LiveGateway`   — forwards to the signed REST client, retrying
//     Transport/RateLimited failures with bounded exponential backoff and
//     surfacing them only on exhaustion.
//   * `DryRunGateway` — synthesizes deterministic `dryrun:{side}:{price}:{qty}`
//     ids against an internal simulated book; `fetch_*` reflects that book and
//     balance reads return configurable fixtures. No request reaches the
//     venue.
//
// Dry-run is selected at gateway construction from configuration; callers
// cannot tell the modes apart.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::GridConfig;
use crate::exchange::client::RestClient;
use crate::exchange::error::ExchangeError;
use crate::types::{Credentials, ExchangeOrder, OrderState, Side};

/// Attempts per call before a retryable error is surfaced.
const MAX_ATTEMPTS: u32 = 4;
/// First backoff delay.
const BACKOFF_START: Duration = Duration::from_secs(5);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// The order/balance capabilities the core consumes.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn create_limit_buy(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    async fn create_limit_sell(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    async fn create_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError>;

    /// Cancel one order. A venue-side "unknown order" is benign: the order is
    /// already gone, so the call succeeds.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    /// Cancel every open order on one side. Best-effort: individual failures
    /// are logged and skipped. Returns the ids actually cancelled.
    async fn cancel_all(&self, symbol: &str, side: Side) -> Result<Vec<String>, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Orders updated at or after `since_ms`, any state.
    async fn fetch_orders_since(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError>;
}

/// Build the gateway the configuration asks for.
pub fn build_gateway(config: &GridConfig, credentials: Credentials) -> Arc<dyn ExchangeGateway> {
    if config.dry_run {
        info!("gateway in DRY-RUN mode — venue mutations suppressed");
        Arc::new(DryRunGateway::new(config))
    } else {
        Arc::new(LiveGateway::new(credentials))
    }
}

// =============================================================================
// Live gateway
// =============================================================================

pub struct LiveGateway {
    client: RestClient,
}

impl LiveGateway {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            client: RestClient::new(credentials),
        }
    }

    /// Run `op`, retrying retryable failures with bounded exponential backoff.
    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut delay = BACKOFF_START;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        what,
                        attempt,
                        delay_s = delay.as_secs(),
                        error = %e,
                        "retryable gateway failure — backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ExchangeGateway for LiveGateway {
    async fn create_limit_buy(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let order = self
            .retry("create_limit_buy", || {
                self.client.place_limit_order(symbol, Side::Buy, price, quantity)
            })
            .await?;
        Ok(order.id)
    }

    async fn create_limit_sell(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let order = self
            .retry("create_limit_sell", || {
                self.client.place_limit_order(symbol, Side::Sell, price, quantity)
            })
            .await?;
        Ok(order.id)
    }

    async fn create_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let order = self
            .retry("create_market_sell", || {
                self.client.place_market_sell(symbol, quantity)
            })
            .await?;
        Ok(order.id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        match self
            .retry("cancel_order", || self.client.cancel_order(symbol, order_id))
            .await
        {
            Err(ExchangeError::UnknownOrder(_)) => {
                debug!(symbol, order_id, "cancel of unknown order — already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn cancel_all(&self, symbol: &str, side: Side) -> Result<Vec<String>, ExchangeError> {
        let open = self.fetch_open_orders(symbol).await?;
        let mut cancelled = Vec::new();
        for order in open.into_iter().filter(|o| o.side == side) {
            match self.cancel_order(symbol, &order.id).await {
                Ok(()) => cancelled.push(order.id),
                Err(e) => warn!(symbol, order_id = %order.id, error = %e, "cancel_all: skipping order"),
            }
        }
        info!(symbol, side = %side, count = cancelled.len(), "cancel_all complete");
        Ok(cancelled)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.retry("fetch_open_orders", || self.client.open_orders(symbol))
            .await
    }

    async fn fetch_orders_since(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        self.retry("fetch_orders_since", || {
            self.client.orders_since(symbol, since_ms)
        })
        .await
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        self.retry("get_balance", || self.client.balance(asset)).await
    }
}

// =============================================================================
// Dry-run gateway
// =============================================================================

struct SimState {
    orders: Vec<ExchangeOrder>,
    balances: HashMap<String, f64>,
    /// Logical clock stamping order updates so `fetch_orders_since` works.
    clock_ms: i64,
}

impl SimState {
    fn tick(&mut self) -> i64 {
        self.clock_ms += 1;
        self.clock_ms
    }
}

/// In-memory exchange double. Order-mutating calls never leave the process.
pub struct DryRunGateway {
    book: Mutex<SimState>,
    base_asset: String,
    quote_asset: String,
}

impl DryRunGateway {
    pub fn new(config: &GridConfig) -> Self {
        let mut balances = HashMap::new();
        balances.insert(config.base_asset.clone(), config.dry_run_fixtures.base_balance);
        balances.insert(config.quote_asset.clone(), config.dry_run_fixtures.quote_balance);

        Self {
            book: Mutex::new(SimState {
                orders: Vec::new(),
                balances,
                clock_ms: 0,
            }),
            base_asset: config.base_asset.clone(),
            quote_asset: config.quote_asset.clone(),
        }
    }

    /// Deterministic id for a simulated order.
    fn dryrun_id(side: Side, price: f64, quantity: f64) -> String {
        let side = match side {
            Side::Buy => "buy",
            Side::Sell => "sell",
        };
        format!("dryrun:{side}:{price}:{quantity}")
    }

    fn place(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        state: OrderState,
    ) -> Result<String, ExchangeError> {
        let id = Self::dryrun_id(side, price, quantity);
        let mut book = self.book.lock();

        if let Some(existing) = book.orders.iter().position(|o| o.id == id) {
            if book.orders[existing].state.is_live() {
                return Err(ExchangeError::Rejected(format!(
                    "duplicate simulated order {id}"
                )));
            }
            // A terminal order with the same deterministic id is superseded.
            book.orders.remove(existing);
        }

        let update_time_ms = book.tick();
        book.orders.push(ExchangeOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            state,
            update_time_ms,
        });

        debug!(symbol, id = %id, "simulated order recorded");
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Simulation controls (drive fills and strays in tests and rehearsals)
    // -------------------------------------------------------------------------

    /// Mark an open simulated order as filled and apply its balance effects.
    pub fn fill_order(&self, id: &str) -> bool {
        let mut book = self.book.lock();
        let now = book.tick();
        let Some(order) = book.orders.iter_mut().find(|o| o.id == id && o.state.is_live())
        else {
            return false;
        };
        order.state = OrderState::Filled;
        order.update_time_ms = now;

        let (side, price, qty) = (order.side, order.price, order.quantity);
        match side {
            Side::Buy => {
                *book.balances.entry(self.base_asset.clone()).or_insert(0.0) += qty;
                *book.balances.entry(self.quote_asset.clone()).or_insert(0.0) -= price * qty;
            }
            Side::Sell => {
                let base = book.balances.entry(self.base_asset.clone()).or_insert(0.0);
                *base = (*base - qty).max(0.0);
                *book.balances.entry(self.quote_asset.clone()).or_insert(0.0) += price * qty;
            }
        }
        true
    }

    /// Insert an order the engine did not place (a stray).
    pub fn inject_order(&self, mut order: ExchangeOrder) {
        let mut book = self.book.lock();
        order.update_time_ms = book.tick();
        book.orders.push(order);
    }

    pub fn set_balance(&self, asset: &str, amount: f64) {
        self.book.lock().balances.insert(asset.to_string(), amount);
    }

    /// Full simulated book, any state.
    pub fn orders_snapshot(&self) -> Vec<ExchangeOrder> {
        self.book.lock().orders.clone()
    }
}

#[async_trait]
impl ExchangeGateway for DryRunGateway {
    async fn create_limit_buy(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        self.place(symbol, Side::Buy, price, quantity, OrderState::Open)
    }

    async fn create_limit_sell(
        &self,
        symbol: &str,
        price: f64,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        self.place(symbol, Side::Sell, price, quantity, OrderState::Open)
    }

    async fn create_market_sell(
        &self,
        symbol: &str,
        quantity: f64,
    ) -> Result<String, ExchangeError> {
        let id = self.place(symbol, Side::Sell, 0.0, quantity, OrderState::Filled)?;
        let mut book = self.book.lock();
        let base = book.balances.entry(self.base_asset.clone()).or_insert(0.0);
        *base = (*base - quantity).max(0.0);
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut book = self.book.lock();
        let now = book.tick();
        if let Some(order) = book
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && o.state.is_live())
        {
            order.state = OrderState::Cancelled;
            order.update_time_ms = now;
        }
        // Unknown or already-terminal orders cancel benignly.
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str, side: Side) -> Result<Vec<String>, ExchangeError> {
        let mut book = self.book.lock();
        let now = book.tick();
        let mut cancelled = Vec::new();
        for order in book
            .orders
            .iter_mut()
            .filter(|o| o.symbol == symbol && o.side == side && o.state == OrderState::Open)
        {
            order.state = OrderState::Cancelled;
            order.update_time_ms = now;
            cancelled.push(order.id.clone());
        }
        Ok(cancelled)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self
            .book
            .lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.state == OrderState::Open)
            .cloned()
            .collect())
    }

    async fn fetch_orders_since(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self
            .book
            .lock()
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.update_time_ms >= since_ms)
            .cloned()
            .collect())
    }

    async fn get_balance(&self, asset: &str) -> Result<f64, ExchangeError> {
        Ok(*self.book.lock().balances.get(asset).unwrap_or(&0.0))
    }
}
