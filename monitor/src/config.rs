use crate::alerts::DEFAULT_LOG_CAP;
use crate::errors::{Error, Result};
use crate::geo::Position;
use crate::state::StatusThresholds;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DEVICES: &str = "p1,p2,p3,p4";
const DEFAULT_POSITIONS: &str =
    "p1=28.6139,77.2090;p2=28.6145,77.2095;p3=28.6140,77.2100;p4=28.6135,77.2085";

#[derive(Debug, Clone, PartialEq)]
pub enum FeedLocation {
    Url(String),
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    /// Re-fetch and ingest the whole feed every tick.
    Snapshot,
    /// Load the feed once and advance one line per tick.
    Playback,
}

impl FromStr for FeedMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Ok(FeedMode::Snapshot),
            "playback" => Ok(FeedMode::Playback),
            other => Err(Error::Config(format!("unknown FEED_MODE {:?}", other))),
        }
    }
}

/// How long an alert stays "already logged".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeScope {
    /// Until the device reports a non-alert state.
    Episode,
    /// Until the next batch begins.
    Batch,
}

impl FromStr for EdgeScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "episode" => Ok(EdgeScope::Episode),
            "batch" => Ok(EdgeScope::Batch),
            other => Err(Error::Config(format!("unknown ALERT_EDGE_SCOPE {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed: FeedLocation,
    pub mode: FeedMode,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub devices: Vec<String>,
    pub default_positions: HashMap<String, Position>,
    pub thresholds: StatusThresholds,
    pub alert_log_cap: Option<usize>,
    pub edge_scope: EdgeScope,
    pub store_dir: PathBuf,
    pub http_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let feed = match (lookup("FEED_URL"), lookup("FEED_PATH")) {
            (Some(url), _) if !url.trim().is_empty() => FeedLocation::Url(url),
            (_, Some(path)) => FeedLocation::Path(PathBuf::from(path)),
            _ => FeedLocation::Path(PathBuf::from("data.txt")),
        };

        let mode: FeedMode = parse_or(&lookup, "FEED_MODE", FeedMode::Snapshot)?;
        let default_interval_ms = match mode {
            FeedMode::Snapshot => 3000,
            FeedMode::Playback => 2000,
        };
        let poll_interval_ms: u64 = parse_or(&lookup, "POLL_INTERVAL_MS", default_interval_ms)?;
        if poll_interval_ms == 0 {
            return Err(Error::Config("POLL_INTERVAL_MS must be positive".to_string()));
        }
        let fetch_timeout_ms: u64 = parse_or(&lookup, "FETCH_TIMEOUT_MS", 5000)?;

        let devices = parse_devices(&lookup("DEVICES").unwrap_or_else(|| DEFAULT_DEVICES.to_string()));
        if devices.is_empty() {
            return Err(Error::Config("DEVICES must name at least one device".to_string()));
        }
        let default_positions = parse_positions(
            &lookup("DEFAULT_POSITIONS").unwrap_or_else(|| DEFAULT_POSITIONS.to_string()),
        )?;

        let low_battery_percent: u8 = parse_or(&lookup, "LOW_BATTERY_PERCENT", 30)?;
        let stale_after_secs: i64 = parse_or(&lookup, "STALE_AFTER_SECS", 30)?;
        let stale_after = chrono::Duration::try_seconds(stale_after_secs)
            .filter(|d| *d >= chrono::Duration::zero())
            .ok_or_else(|| {
                Error::Config(format!("STALE_AFTER_SECS out of range: {}", stale_after_secs))
            })?;

        let cap: usize = parse_or(&lookup, "ALERT_LOG_CAP", DEFAULT_LOG_CAP)?;
        let alert_log_cap = if cap == 0 { None } else { Some(cap) };

        Ok(Self {
            feed,
            mode,
            poll_interval: Duration::from_millis(poll_interval_ms),
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            devices,
            default_positions,
            thresholds: StatusThresholds {
                low_battery_percent,
                stale_after,
            },
            alert_log_cap,
            edge_scope: parse_or(&lookup, "ALERT_EDGE_SCOPE", EdgeScope::Episode)?,
            store_dir: PathBuf::from(lookup("STORE_DIR").unwrap_or_else(|| ".".to_string())),
            http_addr: lookup("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {} {:?}: {}", key, raw, e))),
        _ => Ok(default),
    }
}

fn parse_devices(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `id=lat,lon;id=lat,lon`.
fn parse_positions(raw: &str) -> Result<HashMap<String, Position>> {
    let mut positions = HashMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = || Error::Config(format!("invalid DEFAULT_POSITIONS entry {:?}", entry));
        let (id, coords) = entry.split_once('=').ok_or_else(invalid)?;
        let (lat, lon) = coords.split_once(',').ok_or_else(invalid)?;
        let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
        let lon: f64 = lon.trim().parse().map_err(|_| invalid())?;
        positions.insert(id.trim().to_string(), Position::new(lat, lon));
    }
    Ok(positions)
}
