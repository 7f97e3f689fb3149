// =============================================================================
// Shared types used across the gridloom engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order side on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Venue wire string ("BUY" / "SELL").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Side {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "BUY" | "B" => Self::Buy,
            _ => Self::Sell,
        }
    }
}

/// Lifecycle state of a single order as the engine understands it.
///
/// `Unknown` is a recoverable fallback: it is assigned when the venue reports
/// a status the engine cannot map, and resolved on the next reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    Filled,
    Cancelled,
    Rejected,
    Unknown,
}

impl OrderState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// A live order occupies its grid slot.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Map a venue order-status string onto the engine's state machine.
    pub fn from_venue(status: &str) -> Self {
        match status {
            "NEW" | "PARTIALLY_FILLED" => Self::Open,
            "FILLED" => Self::Filled,
            "CANCELED" | "EXPIRED" | "PENDING_CANCEL" => Self::Cancelled,
            "REJECTED" => Self::Rejected,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// An order as reported by the exchange (or the dry-run book).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub state: OrderState,
    /// Last update time in epoch milliseconds.
    pub update_time_ms: i64,
}

/// Opaque API credential pair. The secret is used exclusively for request
/// signing and never logged or serialized.
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}
