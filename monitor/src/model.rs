use crate::geo::Position;
use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a tracked trekker, e.g. `p1`.
pub type DeviceId = String;

/// Display label for a device id (`p1` -> `P1`).
pub fn device_label(id: &str) -> String {
    id.to_uppercase()
}

/// Alert state reported by a trekker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertFlag {
    #[default]
    Unknown,
    Normal,
    Warning,
    Emergency,
}

impl AlertFlag {
    /// Maps a raw feed value onto a flag.
    ///
    /// `1`/`true` is an emergency, `0`/`false` is normal and any other
    /// integer is a warning. Numeric strings are read the same way.
    /// Returns `None` for values that carry no alert meaning.
    pub fn from_raw(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(AlertFlag::Unknown),
            Value::Bool(true) => Some(AlertFlag::Emergency),
            Value::Bool(false) => Some(AlertFlag::Normal),
            Value::Number(_) | Value::String(_) => i64::from_feed_value(value).map(Self::from_code),
            _ => None,
        }
    }

    fn from_code(code: i64) -> Self {
        match code {
            0 => AlertFlag::Normal,
            1 => AlertFlag::Emergency,
            _ => AlertFlag::Warning,
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, AlertFlag::Emergency)
    }
}

/// Per-field update carried by a feed record.
///
/// A field missing from the JSON keeps the stored value, an explicit
/// `null` clears it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Patch<T> {
    Keep,
    Clear,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T: Copy> Patch<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Patch::Set(v) => Some(*v),
            _ => None,
        }
    }

    /// Applies the patch to a stored optional value.
    pub fn apply(&self, slot: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Clear => *slot = None,
            Patch::Set(v) => *slot = Some(*v),
        }
    }
}

/// Conversion from a loosely typed feed value.
pub trait FromFeedValue: Sized {
    fn from_feed_value(value: &Value) -> Option<Self>;
}

impl FromFeedValue for f64 {
    fn from_feed_value(value: &Value) -> Option<Self> {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed.filter(|v| v.is_finite())
    }
}

impl FromFeedValue for i64 {
    fn from_feed_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.trunc() as i64))
            }
            _ => None,
        }
    }
}

impl FromFeedValue for AlertFlag {
    fn from_feed_value(value: &Value) -> Option<Self> {
        AlertFlag::from_raw(value)
    }
}

impl<'de, T: FromFeedValue> Deserialize<'de> for Patch<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Patch::Clear);
        }
        T::from_feed_value(&value)
            .map(Patch::Set)
            .ok_or_else(|| de::Error::custom(format!("unsupported value {}", value)))
    }
}

/// One line of the telemetry feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub latitude: Patch<f64>,
    #[serde(default)]
    pub longitude: Patch<f64>,
    #[serde(default)]
    pub altitude: Patch<f64>,
    #[serde(default)]
    pub temperature: Patch<f64>,
    #[serde(default)]
    pub pressure: Patch<f64>,
    #[serde(default)]
    pub battery: Patch<i64>,
    #[serde(default, alias = "signalStrength", alias = "signal_strength")]
    pub rssi: Patch<i64>,
    #[serde(default, alias = "alert_flag")]
    pub alert: Patch<AlertFlag>,
    /// When the reading was taken, if the feed says so.
    #[serde(default, deserialize_with = "reading_time")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// RFC 3339 reading time. Anything else is ignored rather than rejecting the line.
fn reading_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    })
}

impl TelemetryRecord {
    /// Device identifier, preferring `node_id` over `id`.
    pub fn device_id(&self) -> Option<&str> {
        self.node_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Both coordinates present and non-zero.
    pub fn position(&self) -> Option<Position> {
        match (self.latitude.value(), self.longitude.value()) {
            (Some(lat), Some(lon)) if lat != 0.0 && lon != 0.0 => Some(Position::new(lat, lon)),
            _ => None,
        }
    }

    pub fn clears_position(&self) -> bool {
        matches!(self.latitude, Patch::Clear) || matches!(self.longitude, Patch::Clear)
    }
}

/// Latest known telemetry for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub id: DeviceId,
    pub position: Option<Position>,
    pub altitude: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub battery: Option<u8>,
    pub rssi: Option<i64>,
    pub alert: AlertFlag,
    pub last_seen: DateTime<Utc>,
}

impl TelemetrySnapshot {
    pub fn new(id: DeviceId, seen_at: DateTime<Utc>) -> Self {
        Self {
            id,
            position: None,
            altitude: None,
            temperature: None,
            pressure: None,
            battery: None,
            rssi: None,
            alert: AlertFlag::Unknown,
            last_seen: seen_at,
        }
    }
}

/// Status derived from a snapshot for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Emergency,
    Online,
    LowBattery,
    Offline,
}

impl DeviceStatus {
    /// Listing order: emergencies first, offline devices last.
    pub fn priority(&self) -> u8 {
        match self {
            DeviceStatus::Emergency => 0,
            DeviceStatus::Online => 1,
            DeviceStatus::LowBattery => 2,
            DeviceStatus::Offline => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryLevel {
    High,
    Medium,
    Low,
}

impl BatteryLevel {
    pub fn from_percent(percent: u8) -> Self {
        if percent > 60 {
            BatteryLevel::High
        } else if percent > 30 {
            BatteryLevel::Medium
        } else {
            BatteryLevel::Low
        }
    }
}
