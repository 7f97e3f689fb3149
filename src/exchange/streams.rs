// =============================================================================
// Market-data WebSocket streams
// =============================================================================
//
// Each `run_*_stream` function connects to a single venue stream, parses its
// JSON payloads, and appends into the corresponding buffer until the stream
// disconnects or errors. Reconnection is the supervisor's job: these functions
// simply return so the caller's loop can back off and call again.
//
// Only closed candles are admitted to the candle buffers; in-progress kline
// updates are dropped at the parser boundary.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use crate::market_data::{
    Candle, CandleBuffer, DepthBuffer, DepthSnapshot, SeriesKey, TickerBuffer, TickerTick,
    Timeframe,
};

const STREAM_BASE: &str = "wss://stream.binance.com:9443/ws";

// ---------------------------------------------------------------------------
// Kline stream
// ---------------------------------------------------------------------------

/// Connect to the kline stream for one (symbol, timeframe) pair and feed
/// closed candles into `buffer`.
pub async fn run_kline_stream(
    symbol: &str,
    timeframe: Timeframe,
    buffer: &Arc<CandleBuffer>,
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE}/{lower}@kline_{}", timeframe.as_str());
    info!(url = %url, symbol, timeframe = %timeframe, "connecting to kline WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to kline WebSocket")?;

    info!(symbol, timeframe = %timeframe, "kline WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_kline_message(&text) {
                        Ok(Some((key, candle))) => {
                            debug!(key = %key, close = candle.close, "closed candle");
                            buffer.append(key, candle);
                        }
                        Ok(None) => {} // in-progress update
                        Err(e) => warn!(error = %e, "failed to parse kline message"),
                    }
                }
                // Ping/Pong/Binary/Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "kline WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, timeframe = %timeframe, "kline WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a kline payload. Returns `Ok(None)` for in-progress candles.
///
/// Expected shape (single stream):
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "i": "1m", "t": ..., "x": true, ... } }
/// ```
fn parse_kline_message(text: &str) -> Result<Option<(SeriesKey, Candle)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    // Support both the combined-stream envelope and the direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let symbol = data["s"].as_str().context("missing field s")?.to_uppercase();
    let k = &data["k"];

    let is_closed = k["x"].as_bool().context("missing field k.x")?;
    if !is_closed {
        return Ok(None);
    }

    let interval = k["i"].as_str().context("missing field k.i")?;
    let timeframe = Timeframe::from_venue(interval)
        .with_context(|| format!("unrecognised interval {interval}"))?;

    let candle = Candle::new(
        k["t"].as_i64().context("missing field k.t")?,
        parse_string_f64(&k["o"], "k.o")?,
        parse_string_f64(&k["h"], "k.h")?,
        parse_string_f64(&k["l"], "k.l")?,
        parse_string_f64(&k["c"], "k.c")?,
        parse_string_f64(&k["v"], "k.v")?,
        k["T"].as_i64().context("missing field k.T")?,
    );

    Ok(Some((SeriesKey::new(symbol, timeframe), candle)))
}

// ---------------------------------------------------------------------------
// Ticker stream
// ---------------------------------------------------------------------------

/// Connect to the 24 h rolling ticker stream for one symbol and feed ticks
/// into `buffer`.
pub async fn run_ticker_stream(symbol: &str, buffer: &Arc<TickerBuffer>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE}/{lower}@ticker");
    info!(url = %url, symbol, "connecting to ticker WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to ticker WebSocket")?;

    info!(symbol, "ticker WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_ticker_message(&text) {
                        Ok(tick) => {
                            buffer.append(symbol, tick);
                        }
                        Err(e) => warn!(error = %e, "failed to parse ticker message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "ticker WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "ticker WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a 24 h ticker payload.
///
/// Expected shape:
/// ```json
/// { "e": "24hrTicker", "E": 1700000000000, "c": "0.1", "b": "0.0999",
///   "B": "5", "a": "0.1001", "A": "4", "v": "100000" }
/// ```
fn parse_ticker_message(text: &str) -> Result<TickerTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    Ok(TickerTick {
        event_time_ms: root["E"].as_i64().context("missing field E")?,
        last_price: parse_string_f64(&root["c"], "c")?,
        best_bid: parse_string_f64(&root["b"], "b")?,
        best_bid_qty: parse_string_f64(&root["B"], "B")?,
        best_ask: parse_string_f64(&root["a"], "a")?,
        best_ask_qty: parse_string_f64(&root["A"], "A")?,
        volume_24h: parse_string_f64(&root["v"], "v")?,
    })
}

// ---------------------------------------------------------------------------
// Depth stream
// ---------------------------------------------------------------------------

/// Connect to the partial-depth stream (top 20 levels at 100 ms) for one
/// symbol and feed snapshots into `buffer`.
pub async fn run_depth_stream(symbol: &str, buffer: &Arc<DepthBuffer>) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{STREAM_BASE}/{lower}@depth20@100ms");
    info!(url = %url, symbol, "connecting to depth WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to depth WebSocket")?;

    info!(symbol, "depth WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    match parse_depth_message(&text, now_ms) {
                        Ok(snapshot) => {
                            buffer.update(symbol, snapshot);
                        }
                        Err(e) => warn!(error = %e, "failed to parse depth message"),
                    }
                }
            }
            Some(Err(e)) => {
                error!(symbol, error = %e, "depth WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol, "depth WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Parse a partial-depth payload.
///
/// Expected shape:
/// ```json
/// { "lastUpdateId": 12345, "bids": [["0.0999", "1.5"], ...],
///   "asks": [["0.1001", "1.2"], ...] }
/// ```
fn parse_depth_message(text: &str, now_ms: i64) -> Result<DepthSnapshot> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse depth JSON")?;

    let last_update_id = root["lastUpdateId"]
        .as_u64()
        .context("missing field lastUpdateId")?;

    let parse_side = |field: &str| -> Result<Vec<(f64, f64)>> {
        root[field]
            .as_array()
            .with_context(|| format!("missing field {field}"))?
            .iter()
            .map(|level| {
                let price = parse_string_f64(&level[0], field)?;
                let qty = parse_string_f64(&level[1], field)?;
                Ok((price, qty))
            })
            .collect()
    };

    Ok(DepthSnapshot {
        event_time_ms: now_ms,
        last_update_id,
        bids: parse_side("bids")?,
        asks: parse_side("asks")?,
    })
}

// ---------------------------------------------------------------------------
// Shared helper
// ---------------------------------------------------------------------------

/// The venue sends numeric values as JSON strings inside stream payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_closed_kline() {
        let json = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "0.10000", "h": "0.10100", "l": "0.09900", "c": "0.10050",
                "v": "123.456", "x": true
            }
        }"#;
        let (key, candle) = parse_kline_message(json).unwrap().expect("closed candle");
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(key.timeframe, Timeframe::M1);
        assert!((candle.close - 0.1005).abs() < 1e-12);
        assert_eq!(candle.open_time, 1700000000000);
    }

    #[test]
    fn in_progress_kline_is_dropped() {
        let json = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 1700000000000, "T": 1700000059999, "i": "1m",
                "o": "1", "h": "1", "l": "1", "c": "1", "v": "1", "x": false
            }
        }"#;
        assert!(parse_kline_message(json).unwrap().is_none());
    }

    #[test]
    fn combined_stream_envelope_supported() {
        let json = r#"{
            "stream": "btcusdt@kline_1h",
            "data": {
                "e": "kline", "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000, "T": 1700003599999, "i": "1h",
                    "o": "1", "h": "2", "l": "0.5", "c": "1.5", "v": "10", "x": true
                }
            }
        }"#;
        let (key, _) = parse_kline_message(json).unwrap().expect("closed candle");
        assert_eq!(key.timeframe, Timeframe::H1);
    }

    #[test]
    fn unknown_interval_is_an_error() {
        let json = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": {
                "t": 0, "T": 0, "i": "3m",
                "o": "1", "h": "1", "l": "1", "c": "1", "v": "1", "x": true
            }
        }"#;
        assert!(parse_kline_message(json).is_err());
    }

    #[test]
    fn parse_ticker_ok() {
        let json = r#"{
            "e": "24hrTicker", "E": 1700000000500, "s": "BTCUSDT",
            "c": "0.10000", "b": "0.09990", "B": "5.0",
            "a": "0.10010", "A": "4.0", "v": "100000"
        }"#;
        let tick = parse_ticker_message(json).unwrap();
        assert_eq!(tick.event_time_ms, 1700000000500);
        assert!((tick.last_price - 0.1).abs() < 1e-12);
        assert!((tick.best_bid - 0.0999).abs() < 1e-12);
        assert!((tick.best_ask_qty - 4.0).abs() < 1e-12);
        assert!((tick.volume_24h - 100000.0).abs() < 1e-9);
    }

    #[test]
    fn parse_depth_ok() {
        let json = r#"{
            "lastUpdateId": 42,
            "bids": [["0.09990", "1.5"], ["0.09980", "2.0"]],
            "asks": [["0.10010", "1.2"], ["0.10020", "3.0"]]
        }"#;
        let snapshot = parse_depth_message(json, 1234).unwrap();
        assert_eq!(snapshot.last_update_id, 42);
        assert_eq!(snapshot.event_time_ms, 1234);
        assert_eq!(snapshot.bids.len(), 2);
        assert_eq!(snapshot.best_bid(), Some((0.0999, 1.5)));
        assert_eq!(snapshot.best_ask(), Some((0.1001, 1.2)));
    }

    #[test]
    fn malformed_payloads_error() {
        assert!(parse_kline_message("not json").is_err());
        assert!(parse_ticker_message("{}").is_err());
        assert!(parse_depth_message("{}", 0).is_err());
    }
}
