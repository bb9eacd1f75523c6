use crate::alerts::{AlertEvent, AlertLog};
use crate::config::{Config, EdgeScope};
use crate::errors::{Error, Result};
use crate::metrics::{
    ALERTS_LOGGED_TOTAL, DEVICES_TRACKED, INVALID_LINES_TOTAL, LINES_TOTAL, UNKNOWN_DEVICE_TOTAL,
};
use crate::model::TelemetryRecord;
use crate::state::DeviceState;
use crate::store::KeyValueStore;
use crate::validate::validate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Connectivity of the telemetry feed as seen by the last poll.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedHealth {
    pub connected: bool,
    pub has_data: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub lines: usize,
    pub accepted: usize,
    pub invalid: usize,
    pub unknown: usize,
    pub alerts_logged: usize,
    /// Lines skipped because a previous snapshot already delivered them.
    pub already_seen: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOutcome {
    Accepted { alert_logged: bool },
    Invalid,
    UnknownDevice,
}

/// Parses and validates one feed line.
pub fn parse_line(line: &str) -> Result<TelemetryRecord> {
    let record = serde_json::from_str::<TelemetryRecord>(line)
        .map_err(|e| Error::Validation(format!("JSON parse error: {}", e)))?;

    validate(&record)?;

    Ok(record)
}

/// Device state, alert log and feed health for one monitoring session.
#[derive(Debug)]
pub struct Monitor {
    state: DeviceState,
    log: AlertLog,
    edge_scope: EdgeScope,
    health: FeedHealth,
    /// Lines of the last snapshot, to tell re-served lines from new ones.
    last_snapshot: Vec<String>,
}

impl Monitor {
    pub fn new(state: DeviceState, log: AlertLog, edge_scope: EdgeScope) -> Self {
        Self {
            state,
            log,
            edge_scope,
            health: FeedHealth::default(),
            last_snapshot: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, store: Box<dyn KeyValueStore>) -> Self {
        let state = DeviceState::new(
            config.devices.clone(),
            config.default_positions.clone(),
            config.thresholds,
        );
        let log = AlertLog::new(store, config.alert_log_cap);
        let monitor = Self::new(state, log, config.edge_scope);
        info!(
            "Monitoring {} devices, {} alert log entries loaded",
            config.devices.len(),
            monitor.log.load().len()
        );
        monitor
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn alert_log(&self) -> &AlertLog {
        &self.log
    }

    pub fn health(&self) -> &FeedHealth {
        &self.health
    }

    /// Starts a new batch. Edge tracking only resets with batch scope.
    pub fn begin_batch(&mut self) {
        if self.edge_scope == EdgeScope::Batch {
            self.state.clear_cycle_tracking();
        }
    }

    pub fn ingest_batch(&mut self, raw: &str) -> BatchSummary {
        self.ingest_batch_at(raw, Utc::now())
    }

    /// Ingests newline-delimited records. Bad lines are skipped.
    pub fn ingest_batch_at(&mut self, raw: &str, now: DateTime<Utc>) -> BatchSummary {
        let lines: Vec<&str> = feed_lines(raw).collect();
        self.ingest_lines(&lines, now)
    }

    /// Ingests a re-fetched copy of the whole feed.
    ///
    /// Only lines appended since the previous snapshot are ingested. The
    /// feed may drop lines from its front between fetches; when nothing of
    /// the previous snapshot is left every line counts as new.
    pub fn ingest_snapshot_at(&mut self, raw: &str, now: DateTime<Utc>) -> BatchSummary {
        let lines: Vec<&str> = feed_lines(raw).collect();
        let seen = seen_prefix_len(&self.last_snapshot, &lines);
        self.last_snapshot = lines.iter().map(|l| l.to_string()).collect();

        let mut summary = self.ingest_lines(&lines[seen..], now);
        summary.already_seen = seen;
        summary
    }

    fn ingest_lines(&mut self, lines: &[&str], now: DateTime<Utc>) -> BatchSummary {
        self.begin_batch();

        let mut summary = BatchSummary::default();
        for &line in lines {
            summary.lines += 1;
            match self.ingest_line_at(line, now) {
                LineOutcome::Accepted { alert_logged } => {
                    summary.accepted += 1;
                    if alert_logged {
                        summary.alerts_logged += 1;
                    }
                }
                LineOutcome::Invalid => summary.invalid += 1,
                LineOutcome::UnknownDevice => summary.unknown += 1,
            }
        }

        self.record_feed_success(summary.accepted > 0, now);
        debug!(
            "Batch processed: {} lines, {} accepted, {} invalid, {} unknown, {} alerts",
            summary.lines, summary.accepted, summary.invalid, summary.unknown, summary.alerts_logged
        );
        summary
    }

    /// Ingests a single record without starting a new batch.
    pub fn ingest_line_at(&mut self, line: &str, now: DateTime<Utc>) -> LineOutcome {
        LINES_TOTAL.inc();

        let record = match parse_line(line) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping feed line: {}", e);
                INVALID_LINES_TOTAL.inc();
                return LineOutcome::Invalid;
            }
        };

        let outcome = match self.state.reconcile(&record, now) {
            Some(outcome) => outcome,
            None => {
                UNKNOWN_DEVICE_TOTAL.inc();
                return LineOutcome::UnknownDevice;
            }
        };
        DEVICES_TRACKED.set(self.state.len() as f64);

        let mut alert_logged = false;
        if outcome.alert_edge {
            let event = AlertEvent::emergency(&outcome.snapshot.id, now);
            if self.log.append(&event) {
                warn!("{}", event.canonical());
                ALERTS_LOGGED_TOTAL.inc();
                alert_logged = true;
            }
        }

        LineOutcome::Accepted { alert_logged }
    }

    pub fn record_feed_success(&mut self, accepted_any: bool, now: DateTime<Utc>) {
        self.health.connected = true;
        self.health.has_data |= accepted_any;
        self.health.last_update = Some(now);
        self.health.last_error = None;
    }

    pub fn record_feed_failure(&mut self, error: &Error) {
        self.health.connected = false;
        self.health.last_error = Some(error.to_string());
    }
}

fn feed_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Length of the longest tail of `previous` that `current` starts with.
fn seen_prefix_len(previous: &[String], current: &[&str]) -> usize {
    (0..previous.len())
        .map(|start| &previous[start..])
        .find(|tail| {
            tail.len() <= current.len() && tail.iter().zip(current).all(|(a, b)| a.as_str() == *b)
        })
        .map_or(0, |tail| tail.len())
}
