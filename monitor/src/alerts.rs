use crate::model::{device_label, AlertFlag, DeviceId};
use crate::store::KeyValueStore;
use chrono::{DateTime, Local, Utc};
use std::collections::HashSet;
use tracing::{debug, error, warn};

/// Key under which the alert log is persisted.
pub const LOG_KEY: &str = "lora_alert_log";

/// Default number of entries kept in the log.
pub const DEFAULT_LOG_CAP: usize = 10;

/// Devices currently inside an active alert span.
#[derive(Debug, Default)]
pub struct AlertCycleTracker {
    active: HashSet<DeviceId>,
}

impl AlertCycleTracker {
    /// Records the latest flag for a device and reports whether it
    /// just entered the emergency state.
    pub fn observe(&mut self, id: &str, flag: AlertFlag) -> bool {
        if flag.is_emergency() {
            self.active.insert(id.to_string())
        } else {
            self.active.remove(id);
            false
        }
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertEvent {
    pub device_id: DeviceId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    pub fn emergency(device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.to_string(),
            message: format!("ALERT detected on device {}", device_label(device_id)),
            timestamp,
        }
    }

    /// Log line, e.g. `4/2/2025, 3:07:09 PM: ALERT detected on device P1`.
    pub fn canonical(&self) -> String {
        let local = self.timestamp.with_timezone(&Local);
        format!("{}: {}", local.format("%-m/%-d/%Y, %-I:%M:%S %p"), self.message)
    }
}

/// Newest-first, deduplicated alert history backed by a key-value store.
pub struct AlertLog {
    store: Box<dyn KeyValueStore>,
    cap: Option<usize>,
}

impl AlertLog {
    /// `cap` of `None` keeps every entry.
    pub fn new(store: Box<dyn KeyValueStore>, cap: Option<usize>) -> Self {
        Self { store, cap }
    }

    pub fn cap(&self) -> Option<usize> {
        self.cap
    }

    /// Reads the persisted log. Missing or unreadable data is an empty log.
    pub fn load(&self) -> Vec<String> {
        let raw = match self.store.get(LOG_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read alert log: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Discarding corrupt alert log: {}", e);
                Vec::new()
            }
        }
    }

    /// Inserts the event at the front unless an identical line exists.
    ///
    /// Returns whether the log changed. The whole log is rewritten on
    /// every insertion.
    pub fn append(&self, event: &AlertEvent) -> bool {
        let line = event.canonical();
        let mut entries = self.load();

        if entries.contains(&line) {
            debug!("Alert already logged: {}", line);
            return false;
        }

        entries.insert(0, line);
        if let Some(cap) = self.cap {
            entries.truncate(cap);
        }

        let encoded = match serde_json::to_string(&entries) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode alert log: {}", e);
                return false;
            }
        };

        if let Err(e) = self.store.set(LOG_KEY, &encoded) {
            error!("Failed to persist alert log: {}", e);
            return false;
        }

        true
    }
}

impl std::fmt::Debug for AlertLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertLog").field("cap", &self.cap).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Error, Result};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 2, 15, 7, 9).unwrap() + Duration::seconds(secs)
    }

    fn log_with(cap: Option<usize>) -> (AlertLog, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        (AlertLog::new(Box::new(store.clone()), cap), store)
    }

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::Io(std::io::Error::other("disk gone")))
        }

        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(Error::Io(std::io::Error::other("disk gone")))
        }
    }

    #[test]
    fn test_tracker_edges() {
        let mut tracker = AlertCycleTracker::default();
        assert!(tracker.observe("p1", AlertFlag::Emergency));
        assert!(!tracker.observe("p1", AlertFlag::Emergency));
        assert!(!tracker.observe("p1", AlertFlag::Warning));
        assert!(tracker.is_empty());
        assert!(tracker.observe("p1", AlertFlag::Emergency));
    }

    #[test]
    fn test_event_mentions_upper_case_device() {
        let event = AlertEvent::emergency("p1", at(0));
        assert!(event.canonical().ends_with(": ALERT detected on device P1"));
    }

    #[test]
    fn test_append_is_newest_first() {
        let (log, _) = log_with(None);
        assert!(log.append(&AlertEvent::emergency("p1", at(0))));
        assert!(log.append(&AlertEvent::emergency("p2", at(1))));

        let entries = log.load();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("P2"));
        assert!(entries[1].ends_with("P1"));
    }

    #[test]
    fn test_duplicate_message_is_not_appended() {
        let (log, _) = log_with(None);
        let event = AlertEvent::emergency("p1", at(0));

        assert!(log.append(&event));
        assert!(!log.append(&event));
        assert_eq!(log.load().len(), 1);
    }

    #[test]
    fn test_cap_keeps_most_recent() {
        let (log, _) = log_with(Some(DEFAULT_LOG_CAP));
        for i in 0..15 {
            assert!(log.append(&AlertEvent::emergency("p1", at(i))));
        }

        let entries = log.load();
        assert_eq!(entries.len(), DEFAULT_LOG_CAP);
        assert_eq!(entries[0], AlertEvent::emergency("p1", at(14)).canonical());
    }

    #[test]
    fn test_unbounded_log_keeps_everything() {
        let (log, _) = log_with(None);
        for i in 0..25 {
            log.append(&AlertEvent::emergency("p2", at(i)));
        }
        assert_eq!(log.load().len(), 25);
    }

    #[test]
    fn test_corrupt_log_loads_empty() {
        let (log, store) = log_with(None);
        store.set(LOG_KEY, "{not json").unwrap();
        assert!(log.load().is_empty());

        // A fresh append replaces the corrupt value
        assert!(log.append(&AlertEvent::emergency("p4", at(0))));
        assert_eq!(log.load().len(), 1);
    }

    #[test]
    fn test_store_failure_fails_soft() {
        let log = AlertLog::new(Box::new(BrokenStore), None);
        assert!(log.load().is_empty());
        assert!(!log.append(&AlertEvent::emergency("p1", at(0))));
    }
}
