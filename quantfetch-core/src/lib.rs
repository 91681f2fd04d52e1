//! quantfetch core: candle sources, paginated fetch loop and Parquet cache.
//!
//! This crate contains:
//! - Domain types (candles, cursors, series keys)
//! - A [`data::SeriesFetcher`] that pages a [`data::SeriesSource`] until an
//!   empty batch, throttling between requests and caching the result
//! - Binance klines and Yahoo Finance chart clients
//! - Retry with exponential backoff and a shared circuit breaker
//! - TOML configuration

pub mod config;
pub mod data;
pub mod domain;

pub use config::{ConfigError, QuantfetchConfig};
pub use data::{
    DataError, DataOrigin, FetchRequest, SeriesCache, SeriesFetcher, SeriesResult, SeriesSource,
};
pub use domain::{Candle, Cursor, SeriesKey};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: shared types are Send + Sync so the downloader can
    /// fan out on the rayon pool.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Candle>();
        require_sync::<Candle>();
        require_send::<Cursor>();
        require_sync::<Cursor>();
        require_send::<SeriesKey>();
        require_sync::<SeriesKey>();
        require_send::<SeriesCache>();
        require_sync::<SeriesCache>();
        require_send::<data::CircuitBreaker>();
        require_sync::<data::CircuitBreaker>();
        require_send::<data::BinanceSource>();
        require_sync::<data::BinanceSource>();
        require_send::<data::YahooClient>();
        require_sync::<data::YahooClient>();
        require_send::<DataError>();
        require_sync::<DataError>();
    }
}
