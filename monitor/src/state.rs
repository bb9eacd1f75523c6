use crate::alerts::AlertCycleTracker;
use crate::geo::Position;
use crate::model::{AlertFlag, DeviceId, DeviceStatus, Patch, TelemetryRecord, TelemetrySnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Thresholds used to derive a device's status.
#[derive(Debug, Clone, Copy)]
pub struct StatusThresholds {
    pub low_battery_percent: u8,
    pub stale_after: Duration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            low_battery_percent: 30,
            stale_after: Duration::seconds(30),
        }
    }
}

/// Result of merging one record into the device state.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub snapshot: TelemetrySnapshot,
    pub alert_edge: bool,
}

/// Latest telemetry per allowed device.
#[derive(Debug)]
pub struct DeviceState {
    allowed: Vec<DeviceId>,
    defaults: HashMap<DeviceId, Position>,
    thresholds: StatusThresholds,
    snapshots: BTreeMap<DeviceId, TelemetrySnapshot>,
    cycle: AlertCycleTracker,
}

impl DeviceState {
    pub fn new(
        allowed: Vec<DeviceId>,
        defaults: HashMap<DeviceId, Position>,
        thresholds: StatusThresholds,
    ) -> Self {
        Self {
            allowed,
            defaults,
            thresholds,
            snapshots: BTreeMap::new(),
            cycle: AlertCycleTracker::default(),
        }
    }

    pub fn is_allowed(&self, id: &str) -> bool {
        self.allowed.iter().any(|a| a == id)
    }

    pub fn allowed(&self) -> &[DeviceId] {
        &self.allowed
    }

    pub fn thresholds(&self) -> &StatusThresholds {
        &self.thresholds
    }

    pub fn get(&self, id: &str) -> Option<&TelemetrySnapshot> {
        self.snapshots.get(id)
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &TelemetrySnapshot> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn default_position(&self, id: &str) -> Option<Position> {
        self.defaults.get(id).copied()
    }

    /// Stored position, falling back to the configured default.
    pub fn display_position(&self, id: &str) -> Option<Position> {
        self.snapshots
            .get(id)
            .and_then(|s| s.position)
            .or_else(|| self.default_position(id))
    }

    /// Merges a record into the device's snapshot.
    ///
    /// Returns `None` when the record's device is not in the allowed set.
    pub fn reconcile(
        &mut self,
        record: &TelemetryRecord,
        seen_at: DateTime<Utc>,
    ) -> Option<ReconcileOutcome> {
        let id = record.device_id()?;
        if !self.is_allowed(id) {
            debug!("Dropping record for unknown device {}", id);
            return None;
        }

        // Reading time from the feed, never later than when we saw it
        let read_at = record.timestamp.map_or(seen_at, |t| t.min(seen_at));

        let snapshot = self
            .snapshots
            .entry(id.to_string())
            .or_insert_with(|| TelemetrySnapshot::new(id.to_string(), read_at));

        if let Some(position) = record.position() {
            snapshot.position = Some(position);
        } else if record.clears_position() {
            snapshot.position = None;
        }

        record.altitude.apply(&mut snapshot.altitude);
        record.temperature.apply(&mut snapshot.temperature);
        record.pressure.apply(&mut snapshot.pressure);
        record.rssi.apply(&mut snapshot.rssi);

        match record.battery {
            Patch::Keep => {}
            Patch::Clear => snapshot.battery = None,
            Patch::Set(percent) => snapshot.battery = Some(percent.clamp(0, 100) as u8),
        }

        let alert_edge = match record.alert {
            Patch::Keep => false,
            Patch::Clear => {
                snapshot.alert = AlertFlag::Unknown;
                self.cycle.observe(id, AlertFlag::Unknown)
            }
            Patch::Set(flag) => {
                snapshot.alert = flag;
                self.cycle.observe(id, flag)
            }
        };

        snapshot.last_seen = snapshot.last_seen.max(read_at);

        Some(ReconcileOutcome {
            snapshot: snapshot.clone(),
            alert_edge,
        })
    }

    /// Resets alert edge tracking so that active alerts log again.
    pub fn clear_cycle_tracking(&mut self) {
        self.cycle.clear();
    }

    pub fn active_alerts(&self) -> usize {
        self.cycle.len()
    }

    /// Derives the status of an allowed device at `now`.
    pub fn status(&self, id: &str, now: DateTime<Utc>) -> DeviceStatus {
        match self.snapshots.get(id) {
            Some(snapshot) => classify(snapshot, &self.thresholds, now),
            None => DeviceStatus::Offline,
        }
    }
}

/// Emergency beats staleness, staleness beats low battery.
pub fn classify(
    snapshot: &TelemetrySnapshot,
    thresholds: &StatusThresholds,
    now: DateTime<Utc>,
) -> DeviceStatus {
    if snapshot.alert.is_emergency() {
        return DeviceStatus::Emergency;
    }
    if now - snapshot.last_seen > thresholds.stale_after {
        return DeviceStatus::Offline;
    }
    match snapshot.battery {
        Some(b) if b < thresholds.low_battery_percent => DeviceStatus::LowBattery,
        _ => DeviceStatus::Online,
    }
}
