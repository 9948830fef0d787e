//! 거래소 REST 커넥터.

pub mod binance;

pub use binance::{BinanceHistoricalFetcher, FetcherConfig};
