//! # Backend Events
//!
//! Events delivered by the change feed and broadcast channels.

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{decode_row, Row, Table};
use crate::error::Result;

/// Identifies a live subscription so it can be released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which change events a subscription wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Inserts only
    Insert,
    /// Updates only
    Update,
    /// Both
    All,
}

/// What happened to a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row was created
    Insert,
    /// Row was modified
    Update,
}

/// A change notification carrying the new row image
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Table the row lives in
    pub table: Table,
    /// Insert or update
    pub kind: ChangeKind,
    /// Row image after the change
    pub new: Row,
}

impl ChangeEvent {
    /// Decode the new row image.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_row(self.new.clone())
    }

    /// Check if this is an insert
    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Insert
    }
}

/// Subscription predicate: table, event kind and an optional column equality
#[derive(Debug, Clone, PartialEq)]
pub struct FeedFilter {
    /// Table to watch
    pub table: Table,
    /// Event kinds to deliver
    pub event: EventKind,
    /// Optional `column = value` constraint on the new row image
    pub column_eq: Option<(String, Value)>,
}

impl FeedFilter {
    /// Watch `table` for `event`.
    pub fn new(table: Table, event: EventKind) -> Self {
        Self {
            table,
            event,
            column_eq: None,
        }
    }

    /// Narrow to rows where `column = value`.
    pub fn with_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.column_eq = Some((column.to_string(), value.into()));
        self
    }

    /// Whether an event should be delivered to this subscription
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        let kind_ok = match self.event {
            EventKind::All => true,
            EventKind::Insert => event.kind == ChangeKind::Insert,
            EventKind::Update => event.kind == ChangeKind::Update,
        };
        if !kind_ok {
            return false;
        }
        match &self.column_eq {
            Some((column, value)) => event.new.get(column) == Some(value),
            None => true,
        }
    }
}

/// A live change-feed subscription
#[derive(Debug)]
pub struct FeedSubscription {
    /// Handle for `unsubscribe`
    pub id: SubscriptionId,
    /// Events in commit order
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// One message published on a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEnvelope {
    /// Event name (e.g. `typing`)
    pub event: String,
    /// Arbitrary JSON payload
    pub payload: Value,
}

/// A joined broadcast channel
#[derive(Debug)]
pub struct ChannelSubscription {
    /// Handle for `leave`
    pub id: SubscriptionId,
    /// Channel name
    pub channel: String,
    /// Everything published on the channel after joining
    pub envelopes: mpsc::UnboundedReceiver<BroadcastEnvelope>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(table: Table, kind: ChangeKind, new: Value) -> ChangeEvent {
        ChangeEvent { table, kind, new }
    }

    #[test]
    fn test_filter_by_kind() {
        let insert = event(Table::Messages, ChangeKind::Insert, json!({"id": "m1"}));
        let update = event(Table::Messages, ChangeKind::Update, json!({"id": "m1"}));

        let inserts = FeedFilter::new(Table::Messages, EventKind::Insert);
        assert!(inserts.matches(&insert));
        assert!(!inserts.matches(&update));

        let all = FeedFilter::new(Table::Messages, EventKind::All);
        assert!(all.matches(&insert));
        assert!(all.matches(&update));
    }

    #[test]
    fn test_filter_by_table_and_column() {
        let filter = FeedFilter::new(Table::Messages, EventKind::All).with_eq("conversation_id", "c1");

        assert!(filter.matches(&event(
            Table::Messages,
            ChangeKind::Insert,
            json!({"conversation_id": "c1"})
        )));
        assert!(!filter.matches(&event(
            Table::Messages,
            ChangeKind::Insert,
            json!({"conversation_id": "c2"})
        )));
        assert!(!filter.matches(&event(
            Table::Profiles,
            ChangeKind::Insert,
            json!({"conversation_id": "c1"})
        )));
    }

    #[test]
    fn test_subscription_id_display() {
        assert_eq!(SubscriptionId(7).to_string(), "sub-7");
    }
}
