//! Domain types for quantfetch

pub mod candle;
pub mod cursor;

pub use candle::Candle;
pub use cursor::{Cursor, SeriesKey};
