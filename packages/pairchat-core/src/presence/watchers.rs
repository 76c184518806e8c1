//! Read-side presence: mirrors of other users' status rows.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::UserStatus;
use crate::backend::{
    decode_rows, Backend, ChangeEvent, EventKind, FeedFilter, FeedSubscription, Select,
    SubscriptionId, Table,
};
use crate::error::Result;

/// Running pump plus the subscription it drains
struct Follow {
    backend: Backend,
    subscription: SubscriptionId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Follow {
    fn spawn<F>(backend: Backend, mut feed: FeedSubscription, mut on_event: F) -> Self
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let subscription = feed.id;
        let pump = tokio::spawn(async move {
            while let Some(event) = feed.events.recv().await {
                on_event(event);
            }
        });
        Self {
            backend,
            subscription,
            pump: Mutex::new(Some(pump)),
        }
    }

    async fn close(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            if let Err(e) = self.backend.feed.unsubscribe(self.subscription).await {
                tracing::debug!(subscription = %self.subscription, error = %e, "Unsubscribe failed");
            }
        }
    }
}

impl Drop for Follow {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

async fn fetch_statuses(backend: &Backend, query: Select) -> Vec<UserStatus> {
    match backend.rows.select(&query).await.and_then(decode_rows) {
        Ok(statuses) => statuses,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to fetch user status");
            Vec::new()
        }
    }
}

// ============================================================================
// SINGLE USER
// ============================================================================

/// Follows one other user's presence row
pub struct StatusWatcher {
    user_id: String,
    rx: watch::Receiver<Option<UserStatus>>,
    follow: Follow,
}

impl StatusWatcher {
    /// Subscribe to `user_id`'s row, then load its current value.
    pub async fn watch(backend: Backend, user_id: &str) -> Result<Self> {
        let filter = FeedFilter::new(Table::UserStatus, EventKind::All).with_eq("user_id", user_id);
        let feed = backend.feed.subscribe(filter).await?;

        let initial = fetch_statuses(
            &backend,
            Select::from(Table::UserStatus).eq("user_id", user_id).limit(1),
        )
        .await
        .into_iter()
        .next();

        let (tx, rx) = watch::channel(initial);
        let follow = Follow::spawn(backend, feed, move |event| match event.decode::<UserStatus>() {
            Ok(status) => {
                tx.send_replace(Some(status));
            }
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable status event"),
        });

        Ok(Self {
            user_id: user_id.to_string(),
            rx,
            follow,
        })
    }

    /// User being watched
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Latest known row
    pub fn current(&self) -> Option<UserStatus> {
        self.rx.borrow().clone()
    }

    /// Receiver that wakes on every replacement.
    pub fn subscribe(&self) -> watch::Receiver<Option<UserStatus>> {
        self.rx.clone()
    }

    /// Release the subscription.
    pub async fn close(&self) {
        self.follow.close().await;
    }
}

// ============================================================================
// EVERY USER
// ============================================================================

/// Follows every presence row, keyed by user id
pub struct StatusBoard {
    rx: watch::Receiver<HashMap<String, UserStatus>>,
    follow: Follow,
}

impl StatusBoard {
    /// Subscribe to all status changes, then load every row.
    pub async fn watch_all(backend: Backend) -> Result<Self> {
        let feed = backend
            .feed
            .subscribe(FeedFilter::new(Table::UserStatus, EventKind::All))
            .await?;

        let initial: HashMap<String, UserStatus> = fetch_statuses(&backend, Select::from(Table::UserStatus))
            .await
            .into_iter()
            .map(|s| (s.user_id.clone(), s))
            .collect();

        let (tx, rx) = watch::channel(initial);
        let follow = Follow::spawn(backend, feed, move |event| match event.decode::<UserStatus>() {
            Ok(status) => {
                tx.send_modify(|map| {
                    map.insert(status.user_id.clone(), status);
                });
            }
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable status event"),
        });

        Ok(Self { rx, follow })
    }

    /// Latest row for one user
    pub fn get(&self, user_id: &str) -> Option<UserStatus> {
        self.rx.borrow().get(user_id).cloned()
    }

    /// Whether the user's row says online
    pub fn is_online(&self, user_id: &str) -> bool {
        self.rx.borrow().get(user_id).map(|s| s.is_online).unwrap_or(false)
    }

    /// Snapshot of every known row
    pub fn snapshot(&self) -> HashMap<String, UserStatus> {
        self.rx.borrow().clone()
    }

    /// Receiver that wakes on every change.
    pub fn subscribe(&self) -> watch::Receiver<HashMap<String, UserStatus>> {
        self.rx.clone()
    }

    /// Release the subscription.
    pub async fn close(&self) {
        self.follow.close().await;
    }
}

impl std::fmt::Debug for StatusWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWatcher")
            .field("user_id", &self.user_id)
            .field("subscription", &self.follow.subscription)
            .finish()
    }
}

impl std::fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBoard")
            .field("users", &self.rx.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RowStore};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryBackend>, Backend) {
        let memory = Arc::new(MemoryBackend::default());
        let backend = Backend::from_shared(memory.clone());
        (memory, backend)
    }

    async fn set_online(memory: &MemoryBackend, user: &str, online: bool) {
        memory
            .upsert(
                Table::UserStatus,
                "user_id",
                json!({"user_id": user, "is_online": online, "last_seen": "2026-10-19T09:00:00Z"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_watcher_initial_then_replaced() {
        let (memory, backend) = setup();
        set_online(&memory, "bob", true).await;

        let watcher = StatusWatcher::watch(backend, "bob").await.unwrap();
        assert!(watcher.current().unwrap().is_online);

        let mut rx = watcher.subscribe();
        set_online(&memory, "carol", false).await;
        set_online(&memory, "bob", false).await;

        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| s.as_ref().is_some_and(|s| !s.is_online)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.current().unwrap().user_id, "bob");
    }

    #[tokio::test]
    async fn test_watcher_without_row() {
        let (_, backend) = setup();
        let watcher = StatusWatcher::watch(backend, "ghost").await.unwrap();
        assert!(watcher.current().is_none());
    }

    #[tokio::test]
    async fn test_board_tracks_everyone() {
        let (memory, backend) = setup();
        set_online(&memory, "alice", true).await;

        let board = StatusBoard::watch_all(backend).await.unwrap();
        assert!(board.is_online("alice"));
        assert!(!board.is_online("bob"));

        let mut rx = board.subscribe();
        set_online(&memory, "bob", true).await;
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|m| m.contains_key("bob")))
            .await
            .unwrap()
            .unwrap();
        assert!(board.is_online("bob"));
        assert_eq!(board.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let (memory, backend) = setup();
        let board = StatusBoard::watch_all(backend.clone()).await.unwrap();
        let watcher = StatusWatcher::watch(backend, "bob").await.unwrap();
        assert_eq!(memory.live_feed_subscriptions(), 2);

        board.close().await;
        watcher.close().await;
        assert_eq!(memory.live_feed_subscriptions(), 0);
    }
}
