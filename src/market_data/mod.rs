pub mod candle_buffer;
pub mod depth;
pub mod ticker;

// Re-export the core data types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use candle_buffer::{Candle, CandleBuffer, SeriesKey, Timeframe};
pub use depth::{DepthBuffer, DepthSnapshot};
pub use ticker::{TickerBuffer, TickerTick};
