// =============================================================================
// Order Ledger — in-memory mirror of intended and observed orders
// =============================================================================
//
// Keyed by quantized-price grid level; each level holds at most one buy slot
// and one sell slot. The exchange stays authoritative: `observe` merges the
// venue's view, resolves `locked` placements, flags strays, and escalates a
// duplicate-live-orders-per-level condition as an invariant violation.
//
// Per-slot state machine:
//   absent -> pending -> open -> (filled | cancelled)
// with `pending -> rejected` and `* -> unknown` as recoverable fallbacks.
// A slot that stays unseen across two consecutive observations is resolved to
// cancelled (the venue does not know it).
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::grid::geometry::PriceLevel;
use crate::types::{ExchangeOrder, OrderState, Side};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("two live {side} orders at grid level {level_ticks}")]
    DuplicateLiveOrder { side: Side, level_ticks: i64 },
}

/// One side of a grid level.
#[derive(Debug, Clone, Serialize)]
pub struct SideSlot {
    pub order_id: String,
    pub state: OrderState,
    /// Reconciliation-in-flight flag: set at registration, cleared when
    /// `observe` sees the order. A locked slot is never re-issued.
    pub locked: bool,
    pub quantity: f64,
    /// Buy side only: the exit sell for this fill has been registered.
    pub paired: bool,
}

/// Per-level pair of slots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelEntry {
    pub buy: Option<SideSlot>,
    pub sell: Option<SideSlot>,
}

impl LevelEntry {
    fn slot(&self, side: Side) -> Option<&SideSlot> {
        match side {
            Side::Buy => self.buy.as_ref(),
            Side::Sell => self.sell.as_ref(),
        }
    }

    fn slot_mut(&mut self, side: Side) -> &mut Option<SideSlot> {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }

    /// Both sides absent or terminal.
    fn is_inactive(&self) -> bool {
        let side_done = |s: &Option<SideSlot>| s.as_ref().map_or(true, |s| s.state.is_terminal());
        side_done(&self.buy) && side_done(&self.sell)
    }
}

/// Outcome of one `observe` pass.
#[derive(Debug, Default)]
pub struct ObserveReport {
    pub matched: usize,
    /// Exchange-visible open orders with no slot: scheduled for cancellation
    /// by the coordinator (buy side only).
    pub strays: Vec<ExchangeOrder>,
}

pub struct OrderLedger {
    entries: BTreeMap<PriceLevel, LevelEntry>,
    tick_size: f64,
}

impl OrderLedger {
    pub fn new(tick_size: f64) -> Self {
        Self {
            entries: BTreeMap::new(),
            tick_size,
        }
    }

    fn level_of(&self, price: f64) -> PriceLevel {
        PriceLevel::from_price(price, self.tick_size)
    }

    // -------------------------------------------------------------------------
    // Desired levels
    // -------------------------------------------------------------------------

    /// The `count` highest grid levels strictly below the current price,
    /// closest first.
    pub fn desired_buy_levels(
        &self,
        current_price: f64,
        grid: &[PriceLevel],
        count: usize,
    ) -> Vec<PriceLevel> {
        grid.iter()
            .rev()
            .copied()
            .filter(|l| l.price(self.tick_size) < current_price - self.tick_size * 0.5)
            .take(count)
            .collect()
    }

    /// The lowest grid level strictly above the current price.
    pub fn desired_sell_level(&self, current_price: f64, grid: &[PriceLevel]) -> Option<PriceLevel> {
        grid.iter()
            .copied()
            .find(|l| l.price(self.tick_size) > current_price + self.tick_size * 0.5)
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Record a placement. Rejects a second live order on the same slot.
    pub fn register_placement(
        &mut self,
        level: PriceLevel,
        side: Side,
        order_id: String,
        quantity: f64,
    ) -> Result<(), LedgerError> {
        let entry = self.entries.entry(level).or_default();
        let slot = entry.slot_mut(side);

        if let Some(existing) = slot {
            if existing.state.is_live() {
                return Err(LedgerError::DuplicateLiveOrder {
                    side,
                    level_ticks: level.ticks(),
                });
            }
        }

        *slot = Some(SideSlot {
            order_id,
            state: OrderState::Pending,
            locked: true,
            quantity,
            paired: false,
        });
        Ok(())
    }

    /// Merge the exchange's view of recent orders.
    ///
    /// Matching is by order id first, then by `(side, quantized price)` for a
    /// live slot whose own id is no longer exchange-visible (the venue
    /// renumbered it or the placement response was lost). Open orders matching
    /// no slot are reported as strays. Live slots unseen by the exchange decay
    /// to `unknown`, then to `cancelled` on the next unseen observation.
    pub fn observe(&mut self, external: &[ExchangeOrder]) -> Result<ObserveReport, LedgerError> {
        // Invariant check: at most one open order per (side, level) on the
        // exchange.
        let mut open_per_slot: HashMap<(i64, Side), u32> = HashMap::new();
        for order in external.iter().filter(|o| o.state == OrderState::Open) {
            let key = (self.level_of(order.price).ticks(), order.side);
            let count = open_per_slot.entry(key).or_insert(0);
            *count += 1;
            if *count >= 2 {
                return Err(LedgerError::DuplicateLiveOrder {
                    side: order.side,
                    level_ticks: key.0,
                });
            }
        }

        let external_ids: HashSet<String> = external.iter().map(|o| o.id.clone()).collect();

        let id_index: HashMap<String, (PriceLevel, Side)> = self
            .entries
            .iter()
            .flat_map(|(level, entry)| {
                [Side::Buy, Side::Sell].into_iter().filter_map(|side| {
                    entry.slot(side).map(|s| (s.order_id.clone(), (*level, side)))
                })
            })
            .collect();

        let mut report = ObserveReport::default();

        for order in external {
            if let Some(&(level, side)) = id_index.get(&order.id) {
                if let Some(slot) = self.entries.get_mut(&level).and_then(|e| e.slot_mut(side).as_mut())
                {
                    slot.state = order.state;
                    slot.locked = false;
                    report.matched += 1;
                }
                continue;
            }

            // Level adoption for a live slot whose id the venue no longer
            // reports.
            let level = self.level_of(order.price);
            if let Some(slot) = self
                .entries
                .get_mut(&level)
                .and_then(|e| e.slot_mut(order.side).as_mut())
            {
                if slot.state.is_live() && !external_ids.contains(&slot.order_id) {
                    debug!(
                        level_ticks = level.ticks(),
                        side = %order.side,
                        old_id = %slot.order_id,
                        new_id = %order.id,
                        "adopting exchange order id for level"
                    );
                    slot.order_id = order.id.clone();
                    slot.state = order.state;
                    slot.locked = false;
                    report.matched += 1;
                    continue;
                }
            }

            if order.state == OrderState::Open {
                warn!(
                    order_id = %order.id,
                    side = %order.side,
                    price = order.price,
                    "stray exchange order — scheduled for review"
                );
                report.strays.push(order.clone());
            }
        }

        // Decay live slots the exchange did not mention.
        for (level, entry) in self.entries.iter_mut() {
            for side in [Side::Buy, Side::Sell] {
                if let Some(slot) = entry.slot_mut(side).as_mut() {
                    if slot.state.is_live() && !external_ids.contains(&slot.order_id) {
                        let next = if slot.state == OrderState::Unknown {
                            OrderState::Cancelled
                        } else {
                            OrderState::Unknown
                        };
                        debug!(
                            level_ticks = level.ticks(),
                            side = %side,
                            order_id = %slot.order_id,
                            from = %slot.state,
                            to = %next,
                            "order unseen by exchange"
                        );
                        slot.state = next;
                        slot.locked = false;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Record that the exit sell for a filled buy has been registered.
    pub fn mark_paired(&mut self, level: PriceLevel) {
        if let Some(slot) = self.entries.get_mut(&level).and_then(|e| e.buy.as_mut()) {
            slot.paired = true;
        }
    }

    /// Remove entries whose both sides are terminal and whose level is no
    /// longer desired.
    pub fn prune_inactive(&mut self, desired: &HashSet<PriceLevel>) {
        self.entries
            .retain(|level, entry| !entry.is_inactive() || desired.contains(level));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn has_live(&self, level: PriceLevel, side: Side) -> bool {
        self.entries
            .get(&level)
            .and_then(|e| e.slot(side))
            .map_or(false, |s| s.state.is_live())
    }

    pub fn is_locked(&self, level: PriceLevel, side: Side) -> bool {
        self.entries
            .get(&level)
            .and_then(|e| e.slot(side))
            .map_or(false, |s| s.locked)
    }

    /// Σ price·quantity over live buys (the capital already committed).
    pub fn open_buy_value(&self) -> f64 {
        self.entries
            .iter()
            .filter_map(|(level, entry)| {
                entry
                    .buy
                    .as_ref()
                    .filter(|s| s.state.is_live())
                    .map(|s| level.price(self.tick_size) * s.quantity)
            })
            .sum()
    }

    /// Filled buys whose exit sell has not been registered yet.
    pub fn unpaired_filled_buys(&self) -> Vec<(PriceLevel, f64)> {
        self.entries
            .iter()
            .filter_map(|(level, entry)| {
                entry
                    .buy
                    .as_ref()
                    .filter(|s| s.state == OrderState::Filled && !s.paired)
                    .map(|s| (*level, s.quantity))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immutable view of every entry, ascending by level.
    pub fn snapshot(&self) -> Vec<(PriceLevel, LevelEntry)> {
        self.entries.iter().map(|(l, e)| (*l, e.clone())).collect()
    }

    /// Project the ledger back into exchange-order form. Observing this view
    /// against the same ledger is a no-op.
    pub fn as_exchange_view(&self, symbol: &str) -> Vec<ExchangeOrder> {
        self.entries
            .iter()
            .flat_map(|(level, entry)| {
                [Side::Buy, Side::Sell].into_iter().filter_map(|side| {
                    entry.slot(side).map(|s| ExchangeOrder {
                        id: s.order_id.clone(),
                        symbol: symbol.to_string(),
                        side,
                        price: level.price(self.tick_size),
                        quantity: s.quantity,
                        state: s.state,
                        update_time_ms: 0,
                    })
                })
            })
            .collect()
    }
}
