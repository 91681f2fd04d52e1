//! quantfetch CLI: fetch, load, export and cache management commands.
//!
//! Commands:
//! - `fetch`: page through Binance klines from a start cursor and cache the series
//! - `load`: serve a cached series, fetching it first when absent or stale
//! - `yahoo`: download daily history for several tickers from Yahoo Finance
//! - `export`: write a cached series to CSV
//! - `cache status`: list cached series with their ranges and sizes
//! - `cache remove`: delete one cached series
//! - `config`: print the effective configuration as TOML

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate};
use clap::{Parser, Subcommand};
use quantfetch_core::data::{
    BinanceSource, CircuitBreaker, DownloadRequest, Downloader, FetchRequest, FreshnessPolicy,
    SeriesCache, SeriesFetcher, SeriesResult, ThreadSleep, YahooClient,
};
use quantfetch_core::config::hours_to_duration;
use quantfetch_core::{QuantfetchConfig, SeriesKey};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "quantfetch",
    about = "quantfetch: paginated market data fetcher with a Parquet cache"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory. Overrides `cache_dir` from the config.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the full kline series from a start position and overwrite the cache.
    Fetch {
        /// Trading pair (e.g., BTC/USDT).
        symbol: String,

        /// Kline interval (e.g., 1m, 1h, 1d).
        #[arg(long, default_value = "1h")]
        interval: String,

        /// Start position: RFC 3339 timestamp, YYYY-MM-DD, or epoch milliseconds.
        #[arg(long)]
        start: String,

        /// Candles per request. Defaults to `binance.batch_limit`.
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Load a series from the cache, fetching it when missing.
    Load {
        /// Trading pair (e.g., BTC/USDT).
        symbol: String,

        /// Kline interval (e.g., 1m, 1h, 1d).
        #[arg(long, default_value = "1h")]
        interval: String,

        /// Start position used when the series has to be fetched.
        #[arg(long)]
        start: String,

        /// Candles per request. Defaults to `binance.batch_limit`.
        #[arg(long)]
        limit: Option<u32>,

        /// Refetch when the cached entry is older than this. Overrides `cache.max_age_hours`.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Download history for one or more tickers from Yahoo Finance.
    Yahoo {
        /// Tickers to download (e.g., SPY QQQ AAPL).
        #[arg(required = true)]
        tickers: Vec<String>,

        /// Bar interval.
        #[arg(long, default_value = "1d")]
        interval: String,

        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD, exclusive). Defaults to yesterday.
        #[arg(long)]
        end: Option<String>,

        /// Re-download tickers that are already cached.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Export a cached series to CSV.
    Export {
        /// Source name the series was cached under (binance, yahoo).
        source: String,

        /// Symbol as it was requested (e.g., BTC/USDT, SPY).
        symbol: String,

        /// Interval the series was cached under.
        #[arg(long, default_value = "1h")]
        interval: String,

        /// Output CSV path.
        #[arg(long)]
        output: PathBuf,
    },
    /// Cache management commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the effective configuration (defaults, file and flags merged).
    Config,
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached series with candle counts, time ranges and sizes.
    Status,
    /// Delete one cached series and its metadata.
    Remove {
        /// Source name the series was cached under (binance, yahoo).
        source: String,

        /// Symbol as it was requested (e.g., BTC/USDT, SPY).
        symbol: String,

        /// Interval the series was cached under.
        #[arg(long, default_value = "1h")]
        interval: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.cache_dir)?;

    match cli.command {
        Commands::Fetch {
            symbol,
            interval,
            start,
            limit,
        } => run_fetch(&config, symbol, interval, start, limit),
        Commands::Load {
            symbol,
            interval,
            start,
            limit,
            max_age_hours,
        } => run_load(&config, symbol, interval, start, limit, max_age_hours),
        Commands::Yahoo {
            tickers,
            interval,
            start,
            end,
            force,
        } => run_yahoo(&config, tickers, interval, &start, end.as_deref(), force),
        Commands::Export {
            source,
            symbol,
            interval,
            output,
        } => run_export(&config, &SeriesKey::new(source, symbol, interval), &output),
        Commands::Cache { action } => match action {
            CacheAction::Status => run_cache_status(&config),
            CacheAction::Remove {
                source,
                symbol,
                interval,
            } => run_cache_remove(&config, &SeriesKey::new(source, symbol, interval)),
        },
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, cache_dir: Option<PathBuf>) -> Result<QuantfetchConfig> {
    let mut config = match path {
        Some(path) => QuantfetchConfig::from_file(path)?,
        None => QuantfetchConfig::default(),
    };
    if let Some(dir) = cache_dir {
        config.cache_dir = dir;
    }
    Ok(config)
}

fn binance_source(config: &QuantfetchConfig) -> Result<BinanceSource> {
    let breaker = Arc::new(CircuitBreaker::default_provider());
    Ok(BinanceSource::with_base_url(
        config.binance.base_url.clone(),
        config.binance.rate_limit(),
        breaker,
    )?)
}

fn run_fetch(
    config: &QuantfetchConfig,
    symbol: String,
    interval: String,
    start: String,
    limit: Option<u32>,
) -> Result<()> {
    let source = binance_source(config)?;
    let cache = SeriesCache::new(&config.cache_dir);
    let fetcher =
        SeriesFetcher::new(&source, &cache, &ThreadSleep).with_retry(config.retry.policy());

    let request = FetchRequest::new(
        symbol,
        interval,
        start,
        limit.unwrap_or(config.binance.batch_limit),
    );
    let result = fetcher.fetch(&request)?;
    print_series(&result);
    Ok(())
}

fn run_load(
    config: &QuantfetchConfig,
    symbol: String,
    interval: String,
    start: String,
    limit: Option<u32>,
    max_age_hours: Option<u64>,
) -> Result<()> {
    let freshness = match max_age_hours {
        Some(hours) => FreshnessPolicy::max_age(hours_to_duration(hours)),
        None => config.cache.freshness(),
    };

    let source = binance_source(config)?;
    let cache = SeriesCache::new(&config.cache_dir);
    let fetcher = SeriesFetcher::new(&source, &cache, &ThreadSleep)
        .with_retry(config.retry.policy())
        .with_freshness(freshness);

    let request = FetchRequest::new(
        symbol,
        interval,
        start,
        limit.unwrap_or(config.binance.batch_limit),
    );
    let result = fetcher.load(&request)?;
    print_series(&result);
    Ok(())
}

fn run_yahoo(
    config: &QuantfetchConfig,
    tickers: Vec<String>,
    interval: String,
    start: &str,
    end: Option<&str>,
    force: bool,
) -> Result<()> {
    let start = parse_date(start)?;
    let ticker_refs: Vec<&str> = tickers.iter().map(|s| s.as_str()).collect();
    let mut request = DownloadRequest::new(&ticker_refs, interval, start);
    if let Some(end) = end {
        request = request.with_end(parse_date(end)?);
    }

    let breaker = Arc::new(CircuitBreaker::default_provider());
    let client = YahooClient::with_base_url(config.yahoo.base_url.clone(), breaker)?;
    let cache = SeriesCache::new(&config.cache_dir);
    let downloader =
        Downloader::new(&client, &cache, &ThreadSleep).with_retry(config.retry.policy());

    let summary = if force {
        downloader.download(&request)?
    } else {
        downloader.load_many(&request)?
    };

    for result in &summary.series {
        print_series(result);
    }
    info!(
        succeeded = summary.succeeded(),
        failed = summary.failed(),
        "download finished"
    );

    if !summary.all_succeeded() {
        for (ticker, err) in &summary.errors {
            error!(%ticker, "{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_export(config: &QuantfetchConfig, key: &SeriesKey, output: &Path) -> Result<()> {
    let cache = SeriesCache::new(&config.cache_dir);
    let candles = cache.load(key)?;

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("failed to create {}", output.display()))?;
    writer.write_record(["open_time", "open", "high", "low", "close", "volume"])?;
    for c in &candles {
        writer.write_record([
            format_time(c.open_time),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])?;
    }
    writer.flush()?;

    println!("Exported {} candles for {key} to {}", candles.len(), output.display());
    Ok(())
}

fn run_cache_status(config: &QuantfetchConfig) -> Result<()> {
    let cache = SeriesCache::new(&config.cache_dir);
    if !cache.cache_dir().exists() {
        println!("Cache directory does not exist: {}", cache.cache_dir().display());
        return Ok(());
    }

    let entries = cache.entries()?;
    let mut total_size = 0u64;
    let mut rows: Vec<(String, String, usize, u64)> = Vec::new();

    for meta in &entries {
        let size = cache.file_size(&meta.key).unwrap_or(0);
        total_size += size;
        let range = match (meta.first_open_time, meta.last_open_time) {
            (Some(first), Some(last)) => format!("{} to {}", format_date(first), format_date(last)),
            _ => "empty".to_string(),
        };
        rows.push((meta.key.to_string(), range, meta.candle_count, size));
    }

    println!("Cache: {}", cache.cache_dir().display());
    println!("Series: {}", entries.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!("{:<32} {:<25} {:<10} {:>10}", "Series", "Range", "Candles", "Size");
    println!("{}", "-".repeat(80));
    for (key, range, count, size) in &rows {
        println!("{:<32} {:<25} {:<10} {:>10}", key, range, count, format_size(*size));
    }

    Ok(())
}

fn run_cache_remove(config: &QuantfetchConfig, key: &SeriesKey) -> Result<()> {
    let cache = SeriesCache::new(&config.cache_dir);
    if cache.remove(key)? {
        println!("Removed: {key}");
    } else {
        println!("Not cached: {key}");
    }
    Ok(())
}

fn print_series(result: &SeriesResult) {
    let range = match (result.candles.first(), result.candles.last()) {
        (Some(first), Some(last)) => {
            format!("{} to {}", format_time(first.open_time), format_time(last.open_time))
        }
        _ => "no candles".to_string(),
    };
    println!(
        "{:<32} {:>8} candles  {:?} ({} requests)  {range}",
        result.key.to_string(),
        result.len(),
        result.origin,
        result.requests,
    );
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        Ok(date) => Ok(date),
        Err(e) => bail!("invalid date '{s}' (expected YYYY-MM-DD): {e}"),
    }
}

fn format_time(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

fn format_date(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
