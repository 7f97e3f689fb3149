pub mod client;
pub mod error;
pub mod gateway;
pub mod rate_limit;
pub mod streams;

pub use error::ExchangeError;
pub use gateway::{build_gateway, DryRunGateway, ExchangeGateway, LiveGateway};
