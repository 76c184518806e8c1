//! # In-Process Backend
//!
//! [`MemoryBackend`] implements every backend contract inside the process.
//! Tests and the simulation CLI share one instance between several clients
//! to reproduce multi-client behavior without a server.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MEMORY BACKEND                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  insert / update / upsert                                              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────────┐   under the table lock   ┌────────────────────────┐  │
//! │  │ tables       │ ───────────────────────► │ feed subscribers       │  │
//! │  │ (JSON rows)  │   ChangeEvent per row    │ (filtered, pruned when │  │
//! │  └──────────────┘                          │  the receiver is gone) │  │
//! │                                            └────────────────────────┘  │
//! │  publish ───────────────────────────────►  channel subscribers         │
//! │  put ───────────────────────────────────►  blobs (bucket/key)          │
//! │  dispatch (beacon) ─────────────────────►  applied synchronously       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Change events are emitted while the table lock is held, so each
//! subscription observes commit order.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    Beacon, BlobStore, Broadcast, BroadcastEnvelope, ChangeEvent, ChangeFeed, ChangeKind,
    ChannelSubscription, Direction, FeedFilter, FeedSubscription, Filter, PutOptions, Row,
    RowStore, Select, SubscriptionId, Table,
};
use crate::error::{Error, Result};
use crate::time::{system_clock, SharedClock};

/// Default base for derived public URLs
pub const DEFAULT_PUBLIC_BASE: &str = "memory://pairchat";

/// Row-store operations that can be made to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `select`
    Select,
    /// `count`
    Count,
    /// `insert`
    Insert,
    /// `update`
    Update,
    /// `upsert`
    Upsert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Transport,
    Permission,
}

struct FeedSubscriber {
    id: SubscriptionId,
    filter: FeedFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct ChannelSubscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<BroadcastEnvelope>,
}

/// A stored object
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Object bytes
    pub bytes: Bytes,
    /// Options it was stored with
    pub options: PutOptions,
}

/// In-process implementation of every backend contract
pub struct MemoryBackend {
    clock: SharedClock,
    public_base: String,
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    feed_subscribers: Mutex<Vec<FeedSubscriber>>,
    channels: Mutex<HashMap<String, Vec<ChannelSubscriber>>>,
    blobs: RwLock<HashMap<String, StoredBlob>>,
    next_subscription: AtomicU64,
    failures: Mutex<Vec<(Table, Operation, Rejection)>>,
    upload_failures: AtomicUsize,
    beacons: AtomicUsize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryBackend {
    /// Create an empty backend that stamps rows with `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            public_base: DEFAULT_PUBLIC_BASE.to_string(),
            tables: RwLock::new(HashMap::new()),
            feed_subscribers: Mutex::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            failures: Mutex::new(Vec::new()),
            upload_failures: AtomicUsize::new(0),
            beacons: AtomicUsize::new(0),
        }
    }

    /// Use a different base for public URLs.
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = base.into();
        self
    }

    // ========================================================================
    // INSPECTION & FAULT INJECTION
    // ========================================================================

    /// Make the next `operation` on `table` fail with a transport error.
    pub fn fail_next(&self, table: Table, operation: Operation) {
        self.failures.lock().push((table, operation, Rejection::Transport));
    }

    /// Make the next `operation` on `table` fail as a row-level policy denial.
    pub fn deny_next(&self, table: Table, operation: Operation) {
        self.failures.lock().push((table, operation, Rejection::Permission));
    }

    /// Make the next blob upload fail with a transport error.
    pub fn fail_next_upload(&self) {
        self.upload_failures.fetch_add(1, AtomicOrdering::SeqCst);
    }

    /// Snapshot of every row in a table.
    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables.read().get(&table).cloned().unwrap_or_default()
    }

    /// Change-feed subscriptions whose receiver is still alive.
    pub fn live_feed_subscriptions(&self) -> usize {
        self.feed_subscribers
            .lock()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Live subscribers on one broadcast channel.
    pub fn live_channel_subscriptions(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Stored object, if any.
    pub fn blob(&self, bucket: &str, key: &str) -> Option<StoredBlob> {
        self.blobs.read().get(&blob_path(bucket, key)).cloned()
    }

    /// Number of beacon writes dispatched so far.
    pub fn beacons_dispatched(&self) -> usize {
        self.beacons.load(AtomicOrdering::SeqCst)
    }

    fn take_failure(&self, table: Table, operation: Operation) -> Result<()> {
        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|f| (f.0, f.1) == (table, operation)) {
            let (_, _, rejection) = failures.remove(pos);
            return Err(match rejection {
                Rejection::Transport => {
                    Error::Transport(format!("{:?} on {} rejected by backend", operation, table))
                }
                Rejection::Permission => {
                    Error::PermissionDenied(format!("{:?} on {} violates row policy", operation, table))
                }
            });
        }
        Ok(())
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, AtomicOrdering::SeqCst))
    }

    // ========================================================================
    // ROW HELPERS
    // ========================================================================

    fn now_value(&self) -> Value {
        Value::String(self.clock.now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    /// Fill the column defaults the relational schema would apply.
    fn apply_defaults(&self, table: Table, row: &mut Map<String, Value>) {
        match table {
            Table::Profiles | Table::Conversations | Table::Messages => {
                row.entry("id")
                    .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
                row.entry("created_at").or_insert_with(|| self.now_value());
            }
            Table::ConversationParticipants | Table::UserStatus => {}
        }

        match table {
            Table::Profiles => {
                row.entry("avatar_url").or_insert(Value::Null);
                row.entry("status_message").or_insert(Value::Null);
            }
            Table::Messages => {
                for column in ["content", "media_url", "media_type"] {
                    row.entry(column).or_insert(Value::Null);
                }
                for flag in ["is_sent", "is_delivered", "is_read", "is_deleted"] {
                    row.entry(flag).or_insert(Value::Bool(false));
                }
                row.entry("deleted_for_user_ids")
                    .or_insert_with(|| Value::Array(Vec::new()));
            }
            Table::UserStatus => {
                row.entry("is_online").or_insert(Value::Bool(false));
                row.entry("last_seen").or_insert_with(|| self.now_value());
            }
            Table::Conversations | Table::ConversationParticipants => {}
        }
    }

    /// Columns forming the natural key of a table.
    fn key_columns(table: Table) -> &'static [&'static str] {
        match table {
            Table::ConversationParticipants => &["conversation_id", "user_id"],
            Table::UserStatus => &["user_id"],
            _ => &["id"],
        }
    }

    fn same_key(table: Table, a: &Row, b: &Row) -> bool {
        Self::key_columns(table)
            .iter()
            .all(|c| a.get(*c).is_some() && a.get(*c) == b.get(*c))
    }

    /// Deliver an event to matching subscribers, dropping closed ones.
    fn emit(&self, event: ChangeEvent) {
        let mut subscribers = self.feed_subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.filter.matches(&event) {
                let _ = subscriber.tx.send(event.clone());
            }
        }
    }

    fn apply_update(&self, table: Table, filters: &[Filter], patch: &Map<String, Value>) -> usize {
        let mut tables = self.tables.write();
        let rows = tables.entry(table).or_default();
        let mut changed = 0;

        for row in rows.iter_mut() {
            if !filters.iter().all(|f| f.matches(row)) {
                continue;
            }
            if let Some(obj) = row.as_object_mut() {
                for (k, v) in patch {
                    obj.insert(k.clone(), v.clone());
                }
            }
            changed += 1;
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Update,
                new: row.clone(),
            });
        }

        changed
    }
}

fn into_object(row: Row) -> Result<Map<String, Value>> {
    match row {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialization(format!("row must be a JSON object, got {}", other))),
    }
}

fn blob_path(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, key)
}

/// Order JSON values the way the relational store would: timestamps by
/// instant, numbers numerically, NULL first.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

// ============================================================================
// ROW STORE
// ============================================================================

#[async_trait]
impl RowStore for MemoryBackend {
    async fn select(&self, query: &Select) -> Result<Vec<Row>> {
        self.take_failure(query.table, Operation::Select)?;

        let tables = self.tables.read();
        let mut rows: Vec<Row> = tables
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).cloned().collect())
            .unwrap_or_default();
        drop(tables);

        if let Some(order) = &query.order {
            let null = Value::Null;
            rows.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&null),
                    b.get(&order.column).unwrap_or(&null),
                );
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn count(&self, query: &Select) -> Result<usize> {
        self.take_failure(query.table, Operation::Count)?;

        Ok(self
            .tables
            .read()
            .get(&query.table)
            .map(|rows| rows.iter().filter(|r| query.matches(r)).count())
            .unwrap_or(0))
    }

    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()> {
        self.take_failure(table, Operation::Insert)?;

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut obj = into_object(row)?;
            self.apply_defaults(table, &mut obj);
            prepared.push(Value::Object(obj));
        }

        let mut tables = self.tables.write();
        let existing = tables.entry(table).or_default();
        for (i, row) in prepared.iter().enumerate() {
            let clash = existing.iter().any(|r| Self::same_key(table, row, r))
                || prepared[..i].iter().any(|r| Self::same_key(table, row, r));
            if clash {
                return Err(Error::Transport(format!(
                    "duplicate key value violates unique constraint on {}",
                    table
                )));
            }
        }

        for row in prepared {
            existing.push(row.clone());
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Insert,
                new: row,
            });
        }
        Ok(())
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<usize> {
        self.take_failure(table, Operation::Update)?;
        let patch = into_object(patch)?;
        Ok(self.apply_update(table, filters, &patch))
    }

    async fn upsert(&self, table: Table, key_column: &str, row: Row) -> Result<()> {
        self.take_failure(table, Operation::Upsert)?;

        let mut obj = into_object(row)?;
        let key = obj
            .get(key_column)
            .cloned()
            .ok_or_else(|| Error::Serialization(format!("upsert row is missing {}", key_column)))?;

        let mut tables = self.tables.write();
        let rows = tables.entry(table).or_default();

        if let Some(pos) = rows.iter().position(|r| r.get(key_column) == Some(&key)) {
            let existing = &mut rows[pos];
            if let Some(target) = existing.as_object_mut() {
                for (k, v) in obj {
                    target.insert(k, v);
                }
            }
            let new = existing.clone();
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Update,
                new,
            });
        } else {
            self.apply_defaults(table, &mut obj);
            let new = Value::Object(obj);
            rows.push(new.clone());
            self.emit(ChangeEvent {
                table,
                kind: ChangeKind::Insert,
                new,
            });
        }
        Ok(())
    }
}

// ============================================================================
// CHANGE FEED
// ============================================================================

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        tracing::debug!(subscription = %id, table = %filter.table, "Feed subscription opened");
        self.feed_subscribers
            .lock()
            .push(FeedSubscriber { id, filter, tx });
        Ok(FeedSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.feed_subscribers.lock().retain(|s| s.id != id);
        tracing::debug!(subscription = %id, "Feed subscription released");
        Ok(())
    }
}

// ============================================================================
// BROADCAST
// ============================================================================

#[async_trait]
impl Broadcast for MemoryBackend {
    async fn join(&self, channel: &str) -> Result<ChannelSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(ChannelSubscriber { id, tx });
        Ok(ChannelSubscription {
            id,
            channel: channel.to_string(),
            envelopes: rx,
        })
    }

    /// Delivers to every subscriber of the channel, including the publisher's
    /// own subscription; receivers filter by sender.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()> {
        let mut channels = self.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| !s.tx.is_closed());
            let envelope = BroadcastEnvelope {
                event: event.to_string(),
                payload,
            };
            for subscriber in subscribers.iter() {
                let _ = subscriber.tx.send(envelope.clone());
            }
        }
        Ok(())
    }

    async fn leave(&self, id: SubscriptionId) -> Result<()> {
        let mut channels = self.channels.lock();
        for subscribers in channels.values_mut() {
            subscribers.retain(|s| s.id != id);
        }
        channels.retain(|_, subs| !subs.is_empty());
        Ok(())
    }
}

// ============================================================================
// BLOB STORE
// ============================================================================

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, options: PutOptions) -> Result<()> {
        let pending = self.upload_failures.load(AtomicOrdering::SeqCst);
        if pending > 0 {
            self.upload_failures.fetch_sub(1, AtomicOrdering::SeqCst);
            return Err(Error::Transport("storage service unavailable".into()));
        }

        let path = blob_path(bucket, key);
        let mut blobs = self.blobs.write();
        if blobs.contains_key(&path) && !options.upsert {
            return Err(Error::ObjectExists(path));
        }
        blobs.insert(path, StoredBlob { bytes, options });
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.public_base.trim_end_matches('/'),
            bucket,
            key
        )
    }
}

// ============================================================================
// BEACON
// ============================================================================

impl Beacon for MemoryBackend {
    fn dispatch(&self, table: Table, key_column: &str, key_value: &str, patch: Row) {
        self.beacons.fetch_add(1, AtomicOrdering::SeqCst);
        let Ok(patch) = into_object(patch) else {
            return;
        };
        self.apply_update(table, &[Filter::eq(key_column, key_value)], &patch);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EventKind;
    use crate::time::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn backend() -> (MemoryBackend, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
        (MemoryBackend::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_insert_applies_message_defaults() {
        let (backend, _) = backend();
        backend
            .insert(Table::Messages, vec![json!({"conversation_id": "c1", "sender_id": "a"})])
            .await
            .unwrap();

        let rows = backend.rows(Table::Messages);
        assert_eq!(rows.len(), 1);
        assert!(rows[0]["id"].is_string());
        assert_eq!(rows[0]["created_at"], "2026-10-19T09:00:00.000Z");
        assert_eq!(rows[0]["is_read"], false);
        assert_eq!(rows[0]["deleted_for_user_ids"], json!([]));
    }

    #[tokio::test]
    async fn test_select_orders_by_instant_and_limits() {
        let (backend, clock) = backend();
        for text in ["first", "second", "third"] {
            backend
                .insert(Table::Messages, vec![json!({"conversation_id": "c1", "content": text})])
                .await
                .unwrap();
            clock.advance(chrono::Duration::milliseconds(1500));
        }

        let newest = backend
            .select(
                &Select::from(Table::Messages)
                    .eq("conversation_id", "c1")
                    .order_by("created_at", Direction::Descending)
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0]["content"], "third");
    }

    #[test]
    fn test_compare_mixed_precision_timestamps() {
        let a = json!("2026-10-19T09:00:00Z");
        let b = json!("2026-10-19T09:00:00.500Z");
        assert_eq!(compare_values(&a, &b), Ordering::Less);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_atomically() {
        let (backend, _) = backend();
        let rows = vec![
            json!({"conversation_id": "c1", "user_id": "a"}),
            json!({"conversation_id": "c1", "user_id": "a"}),
        ];
        let result = backend.insert(Table::ConversationParticipants, rows).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(backend.rows(Table::ConversationParticipants).is_empty());
    }

    #[tokio::test]
    async fn test_update_emits_to_filtered_subscribers() {
        let (backend, _) = backend();
        let mut c1 = backend
            .subscribe(FeedFilter::new(Table::Messages, EventKind::Update).with_eq("conversation_id", "c1"))
            .await
            .unwrap();
        let mut inserts = backend
            .subscribe(FeedFilter::new(Table::Messages, EventKind::Insert))
            .await
            .unwrap();

        backend
            .insert(Table::Messages, vec![json!({"id": "m1", "conversation_id": "c1"})])
            .await
            .unwrap();
        let changed = backend
            .update(Table::Messages, &[Filter::eq("id", "m1")], json!({"is_read": true}))
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let event = c1.events.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.new["is_read"], true);
        assert!(c1.events.try_recv().is_err());

        let event = inserts.events.recv().await.unwrap();
        assert!(event.is_insert());
        assert!(inserts.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_replaces() {
        let (backend, _) = backend();
        let mut feed = backend
            .subscribe(FeedFilter::new(Table::UserStatus, EventKind::All))
            .await
            .unwrap();

        backend
            .upsert(Table::UserStatus, "user_id", json!({"user_id": "a", "is_online": true}))
            .await
            .unwrap();
        backend
            .upsert(Table::UserStatus, "user_id", json!({"user_id": "a", "is_online": false}))
            .await
            .unwrap();

        assert_eq!(backend.rows(Table::UserStatus).len(), 1);
        assert_eq!(feed.events.recv().await.unwrap().kind, ChangeKind::Insert);
        let second = feed.events.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Update);
        assert_eq!(second.new["is_online"], false);
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let (backend, _) = backend();
        let sub = backend
            .subscribe(FeedFilter::new(Table::Messages, EventKind::All))
            .await
            .unwrap();
        assert_eq!(backend.live_feed_subscriptions(), 1);

        drop(sub);
        assert_eq!(backend.live_feed_subscriptions(), 0);

        let sub = backend
            .subscribe(FeedFilter::new(Table::Messages, EventKind::All))
            .await
            .unwrap();
        backend.unsubscribe(sub.id).await.unwrap();
        assert_eq!(backend.live_feed_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let (backend, _) = backend();
        backend.fail_next(Table::Messages, Operation::Insert);

        let first = backend.insert(Table::Messages, vec![json!({"content": "x"})]).await;
        assert!(matches!(first, Err(Error::Transport(_))));

        let second = backend.insert(Table::Messages, vec![json!({"content": "x"})]).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_denied_write_is_a_permission_error() {
        let (backend, _) = backend();
        backend.deny_next(Table::Profiles, Operation::Update);

        let denied = backend
            .update(Table::Profiles, &[Filter::eq("id", "u1")], json!({"full_name": "x"}))
            .await;
        assert!(matches!(denied, Err(Error::PermissionDenied(_))));
        assert!(!denied.unwrap_err().is_recoverable());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let (backend, _) = backend();
        let mut a = backend.join("typing:c1").await.unwrap();
        let mut b = backend.join("typing:c1").await.unwrap();
        let mut other = backend.join("typing:c2").await.unwrap();

        backend
            .publish("typing:c1", "typing", json!({"userId": "a"}))
            .await
            .unwrap();

        assert_eq!(a.envelopes.recv().await.unwrap().event, "typing");
        assert_eq!(b.envelopes.recv().await.unwrap().payload["userId"], "a");
        assert!(other.envelopes.try_recv().is_err());

        backend.leave(a.id).await.unwrap();
        assert_eq!(backend.live_channel_subscriptions("typing:c1"), 1);
    }

    #[tokio::test]
    async fn test_blob_overwrite_refused() {
        let (backend, _) = backend();
        let options = PutOptions {
            cache_control_secs: 3600,
            upsert: false,
            content_type: None,
        };
        backend
            .put("chat-media", "a/1.jpg", Bytes::from_static(b"one"), options.clone())
            .await
            .unwrap();
        let again = backend
            .put("chat-media", "a/1.jpg", Bytes::from_static(b"two"), options)
            .await;

        assert!(matches!(again, Err(Error::ObjectExists(_))));
        assert_eq!(backend.blob("chat-media", "a/1.jpg").unwrap().bytes, "one");
        assert_eq!(
            backend.public_url("chat-media", "a/1.jpg"),
            "memory://pairchat/storage/v1/object/public/chat-media/a/1.jpg"
        );
    }

    #[tokio::test]
    async fn test_beacon_applies_patch() {
        let (backend, _) = backend();
        backend
            .upsert(Table::UserStatus, "user_id", json!({"user_id": "a", "is_online": true}))
            .await
            .unwrap();

        backend.dispatch(Table::UserStatus, "user_id", "a", json!({"is_online": false}));

        assert_eq!(backend.beacons_dispatched(), 1);
        assert_eq!(backend.rows(Table::UserStatus)[0]["is_online"], false);
    }
}
