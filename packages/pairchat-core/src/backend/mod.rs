//! # Backend Contracts
//!
//! The core never talks to a concrete server. It consumes five narrow
//! contracts, bundled into a [`Backend`] handle that is constructed once and
//! threaded through every component constructor.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         BACKEND CONTRACTS                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐  select / count / insert / update / upsert           │
//! │  │  RowStore    │  over profiles, conversations,                       │
//! │  │              │  conversation_participants, messages, user_status    │
//! │  └──────────────┘                                                      │
//! │  ┌──────────────┐  subscribe(table, insert|update|*, col = value)      │
//! │  │  ChangeFeed  │  → stream of new row images; unsubscribe(id)         │
//! │  └──────────────┘                                                      │
//! │  ┌──────────────┐  join(channel) / publish(channel, event, payload)    │
//! │  │  Broadcast   │  ephemeral, best-effort, unordered across clients    │
//! │  └──────────────┘                                                      │
//! │  ┌──────────────┐  put(bucket, key, bytes, options)                    │
//! │  │  BlobStore   │  public_url(bucket, key)  (pure derivation)          │
//! │  └──────────────┘                                                      │
//! │  ┌──────────────┐  dispatch(table, key, patch)                         │
//! │  │  Beacon      │  fire-and-forget, survives teardown, no ack          │
//! │  └──────────────┘                                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows cross the contracts as JSON objects. Components decode them into
//! typed models with [`decode_rows`] / [`decode_row`]. "No rows" is a valid
//! result, never an error.

mod events;
pub mod memory;

pub use events::{
    BroadcastEnvelope, ChangeEvent, ChangeKind, ChannelSubscription, EventKind, FeedFilter,
    FeedSubscription, SubscriptionId,
};
pub use memory::{MemoryBackend, Operation};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// A row image as exchanged with the backend.
pub type Row = Value;

// ============================================================================
// TABLES
// ============================================================================

/// Tables the core reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// User profiles
    Profiles,
    /// Conversation rows (id + creation time)
    Conversations,
    /// (conversation_id, user_id) join rows
    ConversationParticipants,
    /// Messages
    Messages,
    /// One presence row per user
    UserStatus,
}

impl Table {
    /// Every table, in dependency order.
    pub const ALL: [Table; 5] = [
        Table::Profiles,
        Table::Conversations,
        Table::ConversationParticipants,
        Table::Messages,
        Table::UserStatus,
    ];

    /// Backend table name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profiles => "profiles",
            Self::Conversations => "conversations",
            Self::ConversationParticipants => "conversation_participants",
            Self::Messages => "messages",
            Self::UserStatus => "user_status",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// QUERIES
// ============================================================================

/// Row predicate. A NULL or missing column never matches, as in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`
    Eq(String, Value),
    /// `column <> value`
    Neq(String, Value),
    /// `column IN (values)`
    In(String, Vec<Value>),
}

impl Filter {
    /// `column = value`
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self::Eq(column.to_string(), value.into())
    }

    /// `column <> value`
    pub fn neq(column: &str, value: impl Into<Value>) -> Self {
        Self::Neq(column.to_string(), value.into())
    }

    /// `column IN (values)`
    pub fn is_in<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(column.to_string(), values.into_iter().map(Into::into).collect())
    }

    /// Evaluate the predicate against a row image.
    pub fn matches(&self, row: &Row) -> bool {
        let column = match self {
            Self::Eq(c, _) | Self::Neq(c, _) | Self::In(c, _) => c,
        };
        let Some(actual) = row.get(column).filter(|v| !v.is_null()) else {
            return false;
        };
        match self {
            Self::Eq(_, expected) => actual == expected,
            Self::Neq(_, expected) => actual != expected,
            Self::In(_, values) => values.iter().any(|v| v == actual),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest first
    Ascending,
    /// Largest first
    Descending,
}

/// Ordering clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    /// Column to sort by
    pub column: String,
    /// Sort direction
    pub direction: Direction,
}

/// A filtered, ordered, limited read against one table
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    /// Table to read
    pub table: Table,
    /// All filters must match
    pub filters: Vec<Filter>,
    /// Optional ordering
    pub order: Option<Order>,
    /// Optional row limit
    pub limit: Option<usize>,
}

impl Select {
    /// Start a query against `table`.
    pub fn from(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    /// Add an equality filter.
    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    /// Add an inequality filter.
    pub fn neq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::neq(column, value));
        self
    }

    /// Add a membership filter.
    pub fn is_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.filters.push(Filter::is_in(column, values));
        self
    }

    /// Order by `column`.
    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            direction,
        });
        self
    }

    /// Return at most `n` rows.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether a row passes every filter.
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

// ============================================================================
// CONTRACTS
// ============================================================================

/// CRUD over the relational store
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read matching rows.
    async fn select(&self, query: &Select) -> Result<Vec<Row>>;

    /// Count matching rows (ordering and limit are ignored).
    async fn count(&self, query: &Select) -> Result<usize>;

    /// Insert one or many rows. Either all rows land or none do.
    async fn insert(&self, table: Table, rows: Vec<Row>) -> Result<()>;

    /// Merge `patch` into every row matching `filters`; returns the number of rows changed.
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<usize>;

    /// Create or replace the row identified by `key_column`.
    async fn upsert(&self, table: Table, key_column: &str, row: Row) -> Result<()>;
}

/// Row-level change notification
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Start receiving change events that match `filter`.
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription>;

    /// Release the subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

/// Ephemeral publish/subscribe channels
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Join a named channel and receive everything published on it.
    async fn join(&self, channel: &str) -> Result<ChannelSubscription>;

    /// Publish an event. Delivery is best-effort.
    async fn publish(&self, channel: &str, event: &str, payload: Value) -> Result<()>;

    /// Leave a channel. Unknown ids are ignored.
    async fn leave(&self, id: SubscriptionId) -> Result<()>;
}

/// Options for a blob upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    /// `Cache-Control` max-age in seconds
    pub cache_control_secs: u32,
    /// Replace an existing object at the same key
    pub upsert: bool,
    /// Optional MIME type
    pub content_type: Option<String>,
}

/// Binary object storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `key` inside `bucket`.
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes, options: PutOptions) -> Result<()>;

    /// Public URL of an object. Pure derivation, no network.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}

/// Fire-and-forget writes that must be attempted even while the process is
/// going away. No acknowledgment, no retry.
pub trait Beacon: Send + Sync {
    /// Patch the row where `key_column = key_value`.
    fn dispatch(&self, table: Table, key_column: &str, key_value: &str, patch: Row);
}

// ============================================================================
// BACKEND HANDLE
// ============================================================================

/// Process-wide handle to the backend collaborators.
///
/// Constructed once at startup and cloned into every component.
#[derive(Clone)]
pub struct Backend {
    /// Relational store
    pub rows: Arc<dyn RowStore>,
    /// Change notifications
    pub feed: Arc<dyn ChangeFeed>,
    /// Ephemeral channels
    pub broadcast: Arc<dyn Broadcast>,
    /// Object storage
    pub blobs: Arc<dyn BlobStore>,
    /// Teardown-safe writes
    pub beacon: Arc<dyn Beacon>,
}

impl Backend {
    /// Assemble a backend from independent collaborators.
    pub fn new(
        rows: Arc<dyn RowStore>,
        feed: Arc<dyn ChangeFeed>,
        broadcast: Arc<dyn Broadcast>,
        blobs: Arc<dyn BlobStore>,
        beacon: Arc<dyn Beacon>,
    ) -> Self {
        Self {
            rows,
            feed,
            broadcast,
            blobs,
            beacon,
        }
    }

    /// Use one object that implements every contract.
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: RowStore + ChangeFeed + Broadcast + BlobStore + Beacon + 'static,
    {
        Self {
            rows: backend.clone(),
            feed: backend.clone(),
            broadcast: backend.clone(),
            blobs: backend.clone(),
            beacon: backend,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}

// ============================================================================
// DECODING
// ============================================================================

/// Decode a list of row images.
pub fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

/// Decode a single row image.
pub fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    serde_json::from_value(row).map_err(|e| Error::Serialization(e.to_string()))
}
