use crate::config::FeedMode;
use crate::feed::Feed;
use crate::ingest::{BatchSummary, LineOutcome, Monitor};
use crate::metrics::{FEED_FAILURES_TOTAL, INGEST_LATENCY_SECONDS, POLLS_TOTAL, SKIPPED_POLLS_TOTAL};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub type SharedMonitor = Arc<RwLock<Monitor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Ingested(BatchSummary),
    FeedDown,
    Skipped,
}

/// Buffered feed lines replayed one per tick.
#[derive(Debug, Default)]
struct Playback {
    lines: Vec<String>,
    index: usize,
    loaded: bool,
}

impl Playback {
    fn needs_reload(&self) -> bool {
        !self.loaded || self.index >= self.lines.len()
    }

    fn load(&mut self, raw: &str) {
        self.lines = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        self.index = 0;
        self.loaded = true;
    }

    fn next_line(&mut self) -> Option<&str> {
        let line = self.lines.get(self.index)?;
        self.index += 1;
        Some(line.as_str())
    }
}

struct Inner {
    monitor: SharedMonitor,
    feed: Feed,
    mode: FeedMode,
    in_flight: AtomicBool,
    playback: Mutex<Playback>,
}

/// Clears the in-flight flag when the poll finishes.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic feed poller. At most one poll runs at a time.
#[derive(Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

impl Poller {
    pub fn new(monitor: SharedMonitor, feed: Feed, mode: FeedMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                monitor,
                feed,
                mode,
                in_flight: AtomicBool::new(false),
                playback: Mutex::new(Playback::default()),
            }),
        }
    }

    pub fn monitor(&self) -> &SharedMonitor {
        &self.inner.monitor
    }

    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(&self.inner.in_flight))
    }

    /// Runs one poll unless another one is still in flight.
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(_guard) = self.try_begin() else {
            debug!("Poll already in flight, skipping");
            SKIPPED_POLLS_TOTAL.inc();
            return PollOutcome::Skipped;
        };

        POLLS_TOTAL.inc();
        let start = Instant::now();

        let outcome = match self.inner.mode {
            FeedMode::Snapshot => self.poll_snapshot().await,
            FeedMode::Playback => self.poll_playback().await,
        };

        INGEST_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        outcome
    }

    /// Polls immediately. In playback mode the buffer is reloaded first.
    pub async fn refresh(&self) -> PollOutcome {
        if self.inner.mode == FeedMode::Playback {
            self.inner.playback.lock().await.loaded = false;
        }
        self.poll_once().await
    }

    async fn fetch(&self) -> Option<String> {
        match self.inner.feed.fetch().await {
            Ok(raw) => Some(raw),
            Err(e) => {
                error!("Failed to fetch feed {}: {}", self.inner.feed.describe(), e);
                FEED_FAILURES_TOTAL.inc();
                self.inner.monitor.write().await.record_feed_failure(&e);
                None
            }
        }
    }

    async fn poll_snapshot(&self) -> PollOutcome {
        let Some(raw) = self.fetch().await else {
            return PollOutcome::FeedDown;
        };

        let summary = self
            .inner
            .monitor
            .write()
            .await
            .ingest_snapshot_at(&raw, Utc::now());
        PollOutcome::Ingested(summary)
    }

    async fn poll_playback(&self) -> PollOutcome {
        let mut playback = self.inner.playback.lock().await;

        if playback.needs_reload() {
            let Some(raw) = self.fetch().await else {
                return PollOutcome::FeedDown;
            };
            playback.load(&raw);
            self.inner.monitor.write().await.begin_batch();
            debug!("Loaded {} lines for playback", playback.lines.len());
        }

        let now = Utc::now();
        let mut monitor = self.inner.monitor.write().await;
        let mut summary = BatchSummary::default();

        if let Some(line) = playback.next_line() {
            summary.lines = 1;
            match monitor.ingest_line_at(line, now) {
                LineOutcome::Accepted { alert_logged } => {
                    summary.accepted = 1;
                    summary.alerts_logged = usize::from(alert_logged);
                }
                LineOutcome::Invalid => summary.invalid = 1,
                LineOutcome::UnknownDevice => summary.unknown = 1,
            }
        }

        monitor.record_feed_success(summary.accepted > 0, now);
        PollOutcome::Ingested(summary)
    }

    /// Polls every `period` until `shutdown` flips to true or its sender
    /// is dropped.
    pub async fn run(self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting {:?} poller for {} every {:?}",
            self.inner.mode,
            self.inner.feed.describe(),
            period
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::config::EdgeScope;
    use crate::feed::FileFeed;
    use crate::model::DeviceStatus;
    use crate::state::{DeviceState, StatusThresholds};
    use crate::store::MemoryStore;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shared_monitor() -> SharedMonitor {
        let allowed = vec!["p1".to_string(), "p2".to_string()];
        let state = DeviceState::new(allowed, HashMap::new(), StatusThresholds::default());
        let log = AlertLog::new(Box::new(MemoryStore::default()), Some(10));
        Arc::new(RwLock::new(Monitor::new(state, log, EdgeScope::Episode)))
    }

    fn file_poller(path: PathBuf, mode: FeedMode) -> Poller {
        Poller::new(shared_monitor(), Feed::File(FileFeed::new(path)), mode)
    }

    #[tokio::test]
    async fn test_snapshot_poll_ingests_whole_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        std::fs::write(&path, "{\"id\":\"p1\",\"battery\":80}\n{\"id\":\"p2\",\"battery\":20}\n").unwrap();

        let poller = file_poller(path, FeedMode::Snapshot);
        match poller.poll_once().await {
            PollOutcome::Ingested(summary) => assert_eq!(summary.accepted, 2),
            other => panic!("unexpected outcome {:?}", other),
        }

        let monitor = poller.monitor().read().await;
        assert_eq!(monitor.state().len(), 2);
        assert!(monitor.health().connected);
    }

    #[tokio::test]
    async fn test_repeated_snapshot_polls_of_unchanged_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        let taken = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        let body = format!(
            "{{\"id\":\"p1\",\"alert\":1,\"timestamp\":\"{0}\"}}\n{{\"id\":\"p1\",\"alert\":0,\"timestamp\":\"{0}\"}}\n",
            taken
        );
        std::fs::write(&path, &body).unwrap();
        let poller = file_poller(path.clone(), FeedMode::Snapshot);

        for _ in 0..3 {
            assert!(matches!(poller.poll_once().await, PollOutcome::Ingested(_)));
        }
        {
            let monitor = poller.monitor().read().await;
            assert_eq!(monitor.alert_log().load().len(), 1);
            // Old readings served again do not keep the device online
            assert_eq!(monitor.state().status("p1", Utc::now()), DeviceStatus::Offline);
        }

        std::fs::write(&path, format!("{}{{\"id\":\"p1\",\"battery\":55}}\n", body)).unwrap();
        match poller.poll_once().await {
            PollOutcome::Ingested(summary) => {
                assert_eq!(summary.already_seen, 2);
                assert_eq!(summary.accepted, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            poller.monitor().read().await.state().status("p1", Utc::now()),
            DeviceStatus::Online
        );
    }

    #[tokio::test]
    async fn test_missing_feed_marks_connectivity_down() {
        let temp_dir = TempDir::new().unwrap();
        let poller = file_poller(temp_dir.path().join("absent.txt"), FeedMode::Snapshot);

        assert_eq!(poller.poll_once().await, PollOutcome::FeedDown);
        assert!(!poller.monitor().read().await.health().connected);

        // The next tick recovers once the feed appears
        std::fs::write(temp_dir.path().join("absent.txt"), "{\"id\":\"p1\",\"battery\":50}\n").unwrap();
        assert!(matches!(poller.poll_once().await, PollOutcome::Ingested(_)));
        assert!(poller.monitor().read().await.health().connected);
    }

    #[tokio::test]
    async fn test_overlapping_poll_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        std::fs::write(&path, "{\"id\":\"p1\",\"battery\":80}\n").unwrap();
        let poller = file_poller(path, FeedMode::Snapshot);

        let guard = poller.try_begin().unwrap();
        assert_eq!(poller.poll_once().await, PollOutcome::Skipped);
        drop(guard);

        assert!(matches!(poller.poll_once().await, PollOutcome::Ingested(_)));
    }

    #[tokio::test]
    async fn test_playback_advances_one_line_per_tick_and_wraps() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        std::fs::write(&path, "{\"id\":\"p1\",\"battery\":90}\n\n{\"id\":\"p1\",\"battery\":80}\n").unwrap();
        let poller = file_poller(path.clone(), FeedMode::Playback);

        poller.poll_once().await;
        assert_eq!(poller.monitor().read().await.state().get("p1").unwrap().battery, Some(90));
        poller.poll_once().await;
        assert_eq!(poller.monitor().read().await.state().get("p1").unwrap().battery, Some(80));

        // Wrapping reloads the feed
        std::fs::write(&path, "{\"id\":\"p1\",\"battery\":70}\n").unwrap();
        poller.poll_once().await;
        assert_eq!(poller.monitor().read().await.state().get("p1").unwrap().battery, Some(70));
    }

    #[tokio::test]
    async fn test_playback_refresh_reloads_buffer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        std::fs::write(&path, "{\"id\":\"p2\",\"battery\":90}\n{\"id\":\"p2\",\"battery\":89}\n").unwrap();
        let poller = file_poller(path.clone(), FeedMode::Playback);

        poller.poll_once().await;
        std::fs::write(&path, "{\"id\":\"p2\",\"battery\":10}\n").unwrap();
        poller.refresh().await;

        assert_eq!(poller.monitor().read().await.state().get("p2").unwrap().battery, Some(10));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.txt");
        std::fs::write(&path, "{\"id\":\"p1\",\"alert\":1}\n").unwrap();
        let poller = file_poller(path, FeedMode::Snapshot);
        let monitor = poller.monitor().clone();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(poller.run(Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Repeated polls of a steady alert log it once
        assert_eq!(monitor.read().await.alert_log().load().len(), 1);
    }
}
