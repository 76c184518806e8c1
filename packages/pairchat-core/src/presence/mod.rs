//! # Presence
//!
//! Keeps this client's online row fresh and mirrors other users' rows.
//!
//! ## Self-Presence State Machine
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      PRESENCE TRACKER                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   start ──► upsert { online: true, last_seen: now }                    │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  ┌──────────┐  every heartbeat (30s): upsert online                    │
//! │  │ Visible  │◄────────────────────────────────────┐                    │
//! │  └────┬─────┘                                     │                    │
//! │       │ set_visibility(Hidden)                    │ set_visibility     │
//! │       │   upsert { online: false }                │   (Visible)        │
//! │       ▼                                           │   upsert online    │
//! │  ┌──────────┐  heartbeat ticks skipped            │                    │
//! │  │ Hidden   │─────────────────────────────────────┘                    │
//! │  └────┬─────┘                                                          │
//! │       │ shutdown / drop  (exactly once)                                │
//! │       ▼                                                                 │
//! │   beacon { online: false }   fire-and-forget, no ack, no retry         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write is best-effort. A failed heartbeat leaves the previous row in
//! place until the next tick.
//!
//! ## Watching Others
//!
//! - [`StatusWatcher`] follows one user (conversation header).
//! - [`StatusBoard`] follows everyone (list badges).
//!
//! Both replace the cached row wholesale on every change event.

mod watchers;

pub use watchers::{StatusBoard, StatusWatcher};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::backend::{Backend, Table};
use crate::config::ClientConfig;
use crate::time::SharedClock;

/// One user's presence row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    /// Whose status this is
    pub user_id: String,
    /// Online flag
    #[serde(default)]
    pub is_online: bool,
    /// Last time the user's client wrote the row
    pub last_seen: DateTime<Utc>,
}

impl UserStatus {
    /// "online", or "last seen HH:MM" in `tz`.
    pub fn last_seen_label<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: fmt::Display,
    {
        if self.is_online {
            "online".to_string()
        } else {
            format!("last seen {}", self.last_seen.with_timezone(tz).format("%H:%M"))
        }
    }
}

/// Whether the host application is in the foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Foreground
    Visible,
    /// Backgrounded or minimized
    Hidden,
}

// ============================================================================
// PRESENCE TRACKER
// ============================================================================

struct TrackerState {
    backend: Backend,
    user_id: String,
    clock: SharedClock,
    visible: AtomicBool,
    // Held across each upsert so a slow heartbeat cannot land after an
    // offline write issued later.
    write_lock: AsyncMutex<()>,
}

impl TrackerState {
    fn row(&self, online: bool) -> Value {
        json!({
            "user_id": self.user_id,
            "is_online": online,
            "last_seen": self.clock.now().to_rfc3339(),
        })
    }

    async fn write(&self, online: bool) {
        let result = self
            .backend
            .rows
            .upsert(Table::UserStatus, "user_id", self.row(online))
            .await;

        match result {
            Ok(()) => tracing::trace!(user_id = %self.user_id, online, "Presence written"),
            Err(e) => tracing::debug!(user_id = %self.user_id, online, error = %e, "Presence write failed"),
        }
    }

    /// Write the current visibility flag.
    async fn publish(&self) {
        let _guard = self.write_lock.lock().await;
        let online = self.visible.load(Ordering::SeqCst);
        self.write(online).await;
    }

    /// Refresh the online row, unless the host went to the background.
    async fn beat(&self) {
        let _guard = self.write_lock.lock().await;
        if self.visible.load(Ordering::SeqCst) {
            self.write(true).await;
        }
    }
}

/// Maintains this client's own presence row
pub struct PresenceTracker {
    state: Arc<TrackerState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PresenceTracker {
    /// Mark the user online and start the heartbeat.
    pub async fn start(
        backend: Backend,
        user_id: &str,
        clock: SharedClock,
        config: &ClientConfig,
    ) -> Self {
        let state = Arc::new(TrackerState {
            backend,
            user_id: user_id.to_string(),
            clock,
            visible: AtomicBool::new(true),
            write_lock: AsyncMutex::new(()),
        });

        state.publish().await;
        let heartbeat = tokio::spawn(heartbeat(state.clone(), config.heartbeat_interval()));

        tracing::info!(user_id = %user_id, "Presence tracking started");
        Self {
            state,
            heartbeat: Mutex::new(Some(heartbeat)),
            stopped: AtomicBool::new(false),
        }
    }

    /// React to the host moving between foreground and background.
    pub async fn set_visibility(&self, visibility: Visibility) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let visible = visibility == Visibility::Visible;
        self.state.visible.store(visible, Ordering::SeqCst);
        self.state.publish().await;
    }

    /// Whether the tracker still runs
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the heartbeat and dispatch the offline write through the beacon.
    ///
    /// Runs at most once; later calls and the drop are no-ops.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }

        let patch = json!({
            "is_online": false,
            "last_seen": self.state.clock.now().to_rfc3339(),
        });
        self.state
            .backend
            .beacon
            .dispatch(Table::UserStatus, "user_id", &self.state.user_id, patch);

        tracing::info!(user_id = %self.state.user_id, "Presence tracking stopped");
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("user_id", &self.state.user_id)
            .field("running", &self.is_running())
            .finish()
    }
}

async fn heartbeat(state: Arc<TrackerState>, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    loop {
        ticker.tick().await;
        state.beat().await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ChangeFeed, EventKind, FeedFilter, Filter, MemoryBackend, Operation, Row, RowStore, Select,
    };
    use crate::error::Result;
    use crate::time::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::FixedOffset;

    /// Row store whose online writes take a while to land.
    struct SlowStore {
        inner: Arc<MemoryBackend>,
    }

    #[async_trait]
    impl RowStore for SlowStore {
        async fn select(&self, query: &Select) -> Result<Vec<Row>> {
            self.inner.select(query).await
        }

        async fn count(&self, query: &Select) -> Result<usize> {
            self.inner.count(query).await
        }

        async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()> {
            self.inner.insert(table, rows).await
        }

        async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<usize> {
            self.inner.update(table, filters, patch).await
        }

        async fn upsert(&self, table: Table, key_column: &str, row: Row) -> Result<()> {
            if row["is_online"] == true {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.upsert(table, key_column, row).await
        }
    }

    fn setup() -> (Arc<MemoryBackend>, ManualClock, Backend) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
        let memory = Arc::new(MemoryBackend::new(Arc::new(clock.clone())));
        let backend = Backend::from_shared(memory.clone());
        (memory, clock, backend)
    }

    fn status(memory: &MemoryBackend) -> UserStatus {
        serde_json::from_value(memory.rows(Table::UserStatus).remove(0)).unwrap()
    }

    #[test]
    fn test_last_seen_label() {
        let mut status = UserStatus {
            user_id: "a".into(),
            is_online: true,
            last_seen: Utc.with_ymd_and_hms(2026, 10, 19, 7, 5, 0).unwrap(),
        };
        assert_eq!(status.last_seen_label(&Utc), "online");
        status.is_online = false;
        assert_eq!(status.last_seen_label(&Utc), "last seen 07:05");
        let east = FixedOffset::east_opt(3600).unwrap();
        assert_eq!(status.last_seen_label(&east), "last seen 08:05");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_rewrites_every_interval() {
        let (memory, clock, backend) = setup();
        let mut feed = memory
            .subscribe(FeedFilter::new(Table::UserStatus, EventKind::All))
            .await
            .unwrap();

        let tracker =
            PresenceTracker::start(backend, "alice", Arc::new(clock.clone()), &ClientConfig::default()).await;
        assert!(feed.events.recv().await.unwrap().is_insert());
        assert!(status(&memory).is_online);

        clock.advance(chrono::Duration::seconds(30));
        tokio::time::sleep(Duration::from_secs(30)).await;
        let beat = feed.events.recv().await.unwrap();
        assert_eq!(beat.new["is_online"], true);
        assert_eq!(status(&memory).last_seen, clock.now());

        drop(tracker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_goes_offline_and_skips_heartbeat() {
        let (memory, clock, backend) = setup();
        let tracker =
            PresenceTracker::start(backend, "alice", Arc::new(clock), &ClientConfig::default()).await;

        tracker.set_visibility(Visibility::Hidden).await;
        assert!(!status(&memory).is_online);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert!(!status(&memory).is_online);

        tracker.set_visibility(Visibility::Visible).await;
        assert!(status(&memory).is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_wins_over_in_flight_heartbeat() {
        let (memory, clock, _) = setup();
        let backend = Backend::new(
            Arc::new(SlowStore { inner: memory.clone() }),
            memory.clone(),
            memory.clone(),
            memory.clone(),
            memory.clone(),
        );
        let tracker =
            PresenceTracker::start(backend, "alice", Arc::new(clock), &ClientConfig::default()).await;
        assert!(status(&memory).is_online);

        // The first heartbeat is still writing when the host goes to the background.
        tokio::time::sleep(Duration::from_millis(30_010)).await;
        tracker.set_visibility(Visibility::Hidden).await;
        assert!(!status(&memory).is_online);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!status(&memory).is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_is_swallowed() {
        let (memory, clock, backend) = setup();
        memory.fail_next(Table::UserStatus, Operation::Upsert);

        let tracker =
            PresenceTracker::start(backend, "alice", Arc::new(clock), &ClientConfig::default()).await;
        assert!(memory.rows(Table::UserStatus).is_empty());
        assert!(tracker.is_running());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(status(&memory).is_online);
    }

    #[tokio::test]
    async fn test_shutdown_dispatches_beacon_once() {
        let (memory, clock, backend) = setup();
        let tracker =
            PresenceTracker::start(backend, "alice", Arc::new(clock), &ClientConfig::default()).await;

        tracker.shutdown();
        tracker.shutdown();
        assert!(!tracker.is_running());
        drop(tracker);

        assert_eq!(memory.beacons_dispatched(), 1);
        assert!(!status(&memory).is_online);
    }

    #[tokio::test]
    async fn test_drop_goes_offline() {
        let (memory, clock, backend) = setup();
        {
            let _tracker =
                PresenceTracker::start(backend, "alice", Arc::new(clock), &ClientConfig::default()).await;
        }
        assert_eq!(memory.beacons_dispatched(), 1);
        assert!(!status(&memory).is_online);
    }
}
