//! Parquet cache layer with Hive-style partitioning.
//!
//! Layout: `{cache_dir}/source={SOURCE}/symbol={SYMBOL}/interval={INTERVAL}.parquet`
//!
//! Features:
//! - Atomic writes (write to .tmp, rename into place)
//! - Integrity validation on load (schema check, ascending open times)
//! - Quarantine for corrupt files ({filename}.quarantined)
//! - Metadata sidecar per series (hash, time range, candle count, cached_at)
//!
//! No expiry: staleness is decided by the caller from [`CacheMeta::cached_at`].

use super::provider::DataError;
use crate::domain::{Candle, SeriesKey};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COLUMNS: [&str; 6] = ["open_time", "open", "high", "low", "close", "volume"];

/// Metadata sidecar for a cached series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub key: SeriesKey,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
    pub candle_count: usize,
    pub data_hash: String,
    pub cached_at: DateTime<Utc>,
}

/// The Parquet cache.
#[derive(Debug, Clone)]
pub struct SeriesCache {
    cache_dir: PathBuf,
}

impl SeriesCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Root directory of the cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// `{cache_dir}/source={SOURCE}/symbol={SYMBOL}/`
    fn symbol_dir(&self, key: &SeriesKey) -> PathBuf {
        self.cache_dir
            .join(format!("source={}", key.file_source()))
            .join(format!("symbol={}", key.file_symbol()))
    }

    /// Path to the Parquet file holding a series.
    pub fn data_path(&self, key: &SeriesKey) -> PathBuf {
        self.symbol_dir(key)
            .join(format!("interval={}.parquet", key.file_interval()))
    }

    fn meta_path(&self, key: &SeriesKey) -> PathBuf {
        self.symbol_dir(key)
            .join(format!("interval={}.meta.json", key.file_interval()))
    }

    /// Whether a data file exists for `key`.
    pub fn contains(&self, key: &SeriesKey) -> bool {
        self.data_path(key).is_file()
    }

    /// Write (or overwrite) a series.
    ///
    /// Candles must be strictly ascending by open time. An empty series is a
    /// valid entry.
    pub fn write(&self, key: &SeriesKey, candles: &[Candle]) -> Result<(), DataError> {
        ensure_ascending(candles)?;

        let sym_dir = self.symbol_dir(key);
        fs::create_dir_all(&sym_dir)
            .map_err(|e| DataError::CacheError(format!("failed to create dir: {e}")))?;

        let meta = CacheMeta {
            key: key.clone(),
            first_open_time: candles.first().map(|c| c.open_time),
            last_open_time: candles.last().map(|c| c.open_time),
            candle_count: candles.len(),
            data_hash: data_hash(candles)?,
            cached_at: Utc::now(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DataError::CacheError(format!("meta serialization: {e}")))?;
        let meta_path = self.meta_path(key);
        let meta_tmp = meta_path.with_extension("json.tmp");
        fs::write(&meta_tmp, meta_json)
            .map_err(|e| DataError::CacheError(format!("meta write: {e}")))?;

        let path = self.data_path(key);
        let tmp_path = path.with_extension("parquet.tmp");
        let staged = candles_to_dataframe(candles)
            .and_then(|mut df| write_parquet(&mut df, &tmp_path));
        if let Err(e) = staged {
            let _ = fs::remove_file(&tmp_path);
            let _ = fs::remove_file(&meta_tmp);
            return Err(e);
        }

        // New data must never sit next to the previous entry's sidecar.
        if meta_path.exists() {
            fs::remove_file(&meta_path)
                .map_err(|e| DataError::CacheError(format!("meta remove: {e}")))?;
        }
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            let _ = fs::remove_file(&meta_tmp);
            DataError::CacheError(format!("atomic rename failed: {e}"))
        })?;
        fs::rename(&meta_tmp, &meta_path)
            .map_err(|e| DataError::CacheError(format!("meta rename: {e}")))?;

        debug!(%key, candles = candles.len(), path = %path.display(), "cache entry written");
        Ok(())
    }

    /// Load a cached series, sorted by open time ascending.
    ///
    /// A file that fails validation is renamed to `*.quarantined` and reported
    /// as missing.
    pub fn load(&self, key: &SeriesKey) -> Result<Vec<Candle>, DataError> {
        let path = self.data_path(key);
        if !path.is_file() {
            return Err(DataError::NoCachedData {
                key: key.to_string(),
            });
        }

        match load_and_validate_parquet(&path) {
            Ok(candles) => Ok(candles),
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt cache file"
                );
                let _ = fs::rename(&path, &quarantine);
                let _ = fs::remove_file(self.meta_path(key));
                Err(DataError::NoCachedData {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Metadata for a cached series, if present and readable.
    pub fn get_meta(&self, key: &SeriesKey) -> Option<CacheMeta> {
        let content = fs::read_to_string(self.meta_path(key)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Size in bytes of the data file for `key`.
    pub fn file_size(&self, key: &SeriesKey) -> Option<u64> {
        fs::metadata(self.data_path(key)).ok().map(|m| m.len())
    }

    /// Metadata of every readable entry in the cache, ordered by key.
    pub fn entries(&self) -> Result<Vec<CacheMeta>, DataError> {
        let mut metas = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(metas);
        }

        for source_dir in read_prefixed_dirs(&self.cache_dir, "source=")? {
            for symbol_dir in read_prefixed_dirs(&source_dir, "symbol=")? {
                let files = fs::read_dir(&symbol_dir)
                    .map_err(|e| DataError::CacheError(format!("read dir: {e}")))?;
                for file in files {
                    let file = file.map_err(|e| DataError::CacheError(format!("dir entry: {e}")))?;
                    let name = file.file_name().to_string_lossy().to_string();
                    if !name.ends_with(".meta.json") {
                        continue;
                    }
                    let parsed = fs::read_to_string(file.path())
                        .ok()
                        .and_then(|c| serde_json::from_str::<CacheMeta>(&c).ok());
                    match parsed {
                        Some(meta) => metas.push(meta),
                        None => warn!(path = %file.path().display(), "skipping unreadable cache metadata"),
                    }
                }
            }
        }

        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    /// Remove a cached series. Returns true if anything was deleted.
    pub fn remove(&self, key: &SeriesKey) -> Result<bool, DataError> {
        let mut removed = false;
        for path in [self.data_path(key), self.meta_path(key)] {
            if path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| DataError::CacheError(format!("remove {}: {e}", path.display())))?;
                removed = true;
            }
        }
        Ok(removed)
    }
}

fn read_prefixed_dirs(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, DataError> {
    let entries = fs::read_dir(dir).map_err(|e| DataError::CacheError(format!("read dir: {e}")))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DataError::CacheError(format!("dir entry: {e}")))?;
        let path = entry.path();
        if path.is_dir() && entry.file_name().to_string_lossy().starts_with(prefix) {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

/// BLAKE3 hash over the JSON form of a series.
pub fn data_hash(candles: &[Candle]) -> Result<String, DataError> {
    let bytes = serde_json::to_vec(candles)
        .map_err(|e| DataError::CacheError(format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn ensure_ascending(candles: &[Candle]) -> Result<(), DataError> {
    for pair in candles.windows(2) {
        if pair[1].open_time <= pair[0].open_time {
            return Err(DataError::ValidationError(format!(
                "open times not strictly ascending: {} then {}",
                pair[0].open_time, pair[1].open_time
            )));
        }
    }
    Ok(())
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn candles_to_dataframe(candles: &[Candle]) -> Result<DataFrame, DataError> {
    let times: Vec<i64> = candles.iter().map(|c| c.open_time).collect();
    let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    DataFrame::new(vec![
        Column::new("open_time".into(), times)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| DataError::ParquetError(format!("open_time cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), DataError> {
    let file =
        fs::File::create(path).map_err(|e| DataError::ParquetError(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| DataError::ParquetError(format!("write parquet: {e}")))?;
    Ok(())
}

fn load_and_validate_parquet(path: &Path) -> Result<Vec<Candle>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::ParquetError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::ParquetError(format!("read: {e}")))?;

    for col_name in COLUMNS {
        let column = df
            .column(col_name)
            .map_err(|_| DataError::ValidationError(format!("missing column '{col_name}'")))?;
        let expected = if col_name == "open_time" {
            DataType::Datetime(TimeUnit::Milliseconds, None)
        } else {
            DataType::Float64
        };
        if column.dtype() != &expected {
            return Err(DataError::ValidationError(format!(
                "column '{col_name}' has type {:?}, expected {expected:?}",
                column.dtype()
            )));
        }
    }

    let candles = dataframe_to_candles(&df)?;
    ensure_ascending(&candles)?;
    Ok(candles)
}

fn dataframe_to_candles(df: &DataFrame) -> Result<Vec<Candle>, DataError> {
    let map_err = |e: PolarsError| DataError::ParquetError(format!("column read: {e}"));

    let times = df
        .column("open_time")
        .map_err(map_err)?
        .cast(&DataType::Int64)
        .map_err(map_err)?;
    let time_ca = times.i64().map_err(map_err)?;
    let float_col = |name: &str| -> Result<Float64Chunked, DataError> {
        df.column(name)
            .map_err(map_err)?
            .f64()
            .cloned()
            .map_err(|e| DataError::ParquetError(format!("{name} column type: {e}")))
    };
    let open_ca = float_col("open")?;
    let high_ca = float_col("high")?;
    let low_ca = float_col("low")?;
    let close_ca = float_col("close")?;
    let vol_ca = float_col("volume")?;

    let n = df.height();
    let mut candles = Vec::with_capacity(n);
    for i in 0..n {
        let open_time = time_ca
            .get(i)
            .ok_or_else(|| DataError::ParquetError(format!("null open_time at row {i}")))?;
        candles.push(Candle {
            open_time,
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0.0),
        });
    }

    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SeriesKey {
        SeriesKey::new("binance", "BTC/USDT", "1h")
    }

    fn sample_candles() -> Vec<Candle> {
        vec![
            Candle::new(1_722_470_400_000, 64_600.0, 64_900.5, 64_250.0, 64_700.0, 812.25),
            Candle::new(1_722_474_000_000, 64_700.0, 65_010.0, 64_500.0, 64_950.0, 640.5),
        ]
    }

    #[test]
    fn write_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());

        cache.write(&key(), &sample_candles()).unwrap();
        let loaded = cache.load(&key()).unwrap();

        assert_eq!(loaded, sample_candles());
        assert!(cache
            .data_path(&key())
            .ends_with("source=binance/symbol=BTC%2FUSDT/interval=1h.parquet"));
    }

    #[test]
    fn empty_series_is_a_valid_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());

        cache.write(&key(), &[]).unwrap();
        assert!(cache.contains(&key()));
        assert!(cache.load(&key()).unwrap().is_empty());
        assert_eq!(cache.get_meta(&key()).unwrap().first_open_time, None);
    }

    #[test]
    fn write_overwrites_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());

        cache.write(&key(), &sample_candles()).unwrap();
        cache.write(&key(), &sample_candles()[..1]).unwrap();
        assert_eq!(cache.load(&key()).unwrap().len(), 1);
        assert_eq!(cache.get_meta(&key()).unwrap().candle_count, 1);
    }

    #[test]
    fn failed_sidecar_write_keeps_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        cache.write(&key(), &sample_candles()).unwrap();
        let before = cache.get_meta(&key()).unwrap();

        // A directory in the staging spot makes the sidecar write fail.
        let meta_tmp = cache.meta_path(&key()).with_extension("json.tmp");
        fs::create_dir(&meta_tmp).unwrap();

        assert!(cache.write(&key(), &sample_candles()[..1]).is_err());
        assert_eq!(cache.load(&key()).unwrap(), sample_candles());
        assert_eq!(cache.get_meta(&key()).unwrap(), before);
    }

    #[test]
    fn similar_symbols_do_not_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let slash = SeriesKey::new("binance", "BTC/USDT", "1h");
        let underscore = SeriesKey::new("binance", "BTC_USDT", "1h");

        cache.write(&slash, &sample_candles()).unwrap();
        assert!(!cache.contains(&underscore));

        cache.write(&underscore, &sample_candles()[..1]).unwrap();
        assert_eq!(cache.load(&slash).unwrap().len(), 2);
        assert_eq!(cache.load(&underscore).unwrap().len(), 1);
        assert_eq!(cache.get_meta(&underscore).unwrap().key, underscore);
    }

    #[test]
    fn rejects_unordered_candles() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        let mut candles = sample_candles();
        candles.reverse();

        let err = cache.write(&key(), &candles).unwrap_err();
        assert!(matches!(err, DataError::ValidationError(_)));
        assert!(!cache.contains(&key()));
    }

    #[test]
    fn load_nonexistent_returns_no_cached_data() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());

        let err = cache.load(&key()).unwrap_err();
        assert!(matches!(err, DataError::NoCachedData { .. }));
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        cache.write(&key(), &sample_candles()).unwrap();

        let path = cache.data_path(&key());
        fs::write(&path, b"not a parquet file").unwrap();

        let err = cache.load(&key()).unwrap_err();
        assert!(matches!(err, DataError::NoCachedData { .. }));
        assert!(!path.exists());
        assert!(path.with_extension("parquet.quarantined").exists());
        assert!(cache.get_meta(&key()).is_none());
    }

    #[test]
    fn meta_records_range_and_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        cache.write(&key(), &sample_candles()).unwrap();

        let meta = cache.get_meta(&key()).unwrap();
        assert_eq!(meta.key, key());
        assert_eq!(meta.candle_count, 2);
        assert_eq!(meta.first_open_time, Some(1_722_470_400_000));
        assert_eq!(meta.last_open_time, Some(1_722_474_000_000));
        assert_eq!(meta.data_hash, data_hash(&sample_candles()).unwrap());
    }

    #[test]
    fn entries_lists_every_series() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        cache.write(&key(), &sample_candles()).unwrap();
        cache
            .write(&SeriesKey::new("binance", "BTC/USDT", "1d"), &sample_candles())
            .unwrap();
        cache
            .write(&SeriesKey::new("yahoo", "AAPL", "1d"), &sample_candles())
            .unwrap();

        let entries = cache.entries().unwrap();
        let keys: Vec<String> = entries.iter().map(|m| m.key.to_string()).collect();
        assert_eq!(
            keys,
            vec!["binance:BTC/USDT@1d", "binance:BTC/USDT@1h", "yahoo:AAPL@1d"]
        );
    }

    #[test]
    fn entries_on_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path().join("nope"));
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn remove_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SeriesCache::new(dir.path());
        cache.write(&key(), &sample_candles()).unwrap();

        assert!(cache.remove(&key()).unwrap());
        assert!(!cache.contains(&key()));
        assert!(!cache.remove(&key()).unwrap());
    }
}
