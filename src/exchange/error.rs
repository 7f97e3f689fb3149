// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// Transport and RateLimited are retried inside the gateway and surfaced only
// on exhaustion. InsufficientFunds, Rejected, and UnknownOrder are terminal
// for the individual call. Auth is terminal for the process: it propagates to
// the supervisor, which initiates shutdown.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Transient network failure, timeout, or 5xx from the venue.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The venue asked us to slow down (429/418).
    #[error("rate limited by venue (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Invalid or revoked credentials / signature.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Not enough balance to place the order.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The venue rejected the order (precision, min notional, bad params).
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    /// Cancel targeted an order the venue no longer knows.
    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

impl ExchangeError {
    /// Whether the gateway should retry the call with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Classify a venue error response from HTTP status plus the venue's
    /// `{code, msg}` error body.
    pub fn classify(status: u16, code: i64, msg: &str) -> Self {
        // Rate limiting first: 418 is the venue's IP-ban escalation of 429.
        if status == 429 || status == 418 || code == -1003 {
            return Self::RateLimited {
                retry_after_ms: None,
            };
        }

        match code {
            // Bad key, bad signature, missing permissions.
            -1002 | -1022 | -2014 | -2015 => Self::Auth(msg.to_string()),
            -2011 => Self::UnknownOrder(msg.to_string()),
            -2010 => {
                if msg.to_lowercase().contains("insufficient") {
                    Self::InsufficientFunds(msg.to_string())
                } else {
                    Self::Rejected(msg.to_string())
                }
            }
            // Filter failures: price/lot precision, min notional, bad symbol.
            -1013 | -1100 | -1111 | -1121 => Self::Rejected(msg.to_string()),
            _ => {
                if status == 401 || status == 403 {
                    Self::Auth(msg.to_string())
                } else if status >= 500 {
                    Self::Transport(format!("venue returned {status}: {msg}"))
                } else {
                    Self::Rejected(format!("venue returned {status} (code {code}): {msg}"))
                }
            }
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
