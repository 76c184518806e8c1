//! # Message Stream
//!
//! The live message list for exactly one conversation.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        STREAM LIFECYCLE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  open(conversation)                                                    │
//! │    1. subscribe  messages[conversation_id = c]  (INSERT + UPDATE)      │
//! │    2. load       SELECT ... ORDER BY created_at ASC   → replace list   │
//! │    3. signal     Loaded, ScrollToBottom                                │
//! │    4. mark_as_read                                                     │
//! │    5. spawn pump ──────────────┐                                        │
//! │                                ▼                                        │
//! │       INSERT  id known?  yes → merge in place (no scroll)              │
//! │                          no  → append, ScrollToBottom,                 │
//! │                                mark_as_read if from the other side     │
//! │       UPDATE  id known?  yes → monotonic merge in place                │
//! │                          no  → ignored                                 │
//! │                                                                         │
//! │  close()  abort pump, unsubscribe                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The subscription is opened before the load so no commit falls between
//! them; events buffered during the load are applied afterwards and the id
//! check absorbs the overlap.
//!
//! Sending never touches the local list. A sent message shows up through the
//! same insert event every other participant sees.

use std::sync::Arc;

use chrono::TimeZone;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{group_by_date, Attachment, DateGroup, Message, MessageActions, OutgoingMessage};
use crate::backend::{
    decode_rows, Backend, ChangeEvent, ChangeKind, Direction, EventKind, FeedFilter, Select,
    SubscriptionId, Table,
};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::profiles::Viewer;

/// Notifications for whatever renders the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// Initial load replaced the sequence
    Loaded {
        /// Messages loaded
        count: usize,
    },
    /// A new message was appended
    Appended {
        /// Id of the appended message
        message_id: String,
    },
    /// An existing message changed in place
    Updated {
        /// Id of the updated message
        message_id: String,
    },
    /// The view should scroll to its newest message
    ScrollToBottom,
}

struct StreamState {
    backend: Backend,
    viewer: Viewer,
    conversation_id: String,
    actions: MessageActions,
    messages: RwLock<Vec<Message>>,
    signals: broadcast::Sender<StreamSignal>,
}

impl StreamState {
    fn emit(&self, signal: StreamSignal) {
        // No receivers is fine
        let _ = self.signals.send(signal);
    }

    async fn load(&self) {
        let query = Select::from(Table::Messages)
            .eq("conversation_id", self.conversation_id.as_str())
            .order_by("created_at", Direction::Ascending);

        let loaded = match self.backend.rows.select(&query).await.and_then(decode_rows::<Message>) {
            Ok(rows) => rows.into_iter().map(Message::normalize).collect(),
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Failed to load messages");
                Vec::new()
            }
        };

        let count = loaded.len();
        *self.messages.write() = loaded;
        tracing::debug!(conversation_id = %self.conversation_id, count, "Messages loaded");

        self.emit(StreamSignal::Loaded { count });
        self.emit(StreamSignal::ScrollToBottom);
    }

    async fn apply(&self, event: ChangeEvent) {
        let incoming: Message = match event.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Dropping undecodable message event");
                return;
            }
        };
        if incoming.conversation_id != self.conversation_id {
            return;
        }

        let message_id = incoming.id.clone();
        let from_other = !incoming.is_from(&self.viewer.id);

        let appended = {
            let mut messages = self.messages.write();
            match messages.iter().position(|m| m.id == message_id) {
                Some(pos) => {
                    messages[pos].merge_monotonic(incoming);
                    false
                }
                None if event.kind == ChangeKind::Insert => {
                    messages.push(incoming.normalize());
                    true
                }
                None => return,
            }
        };

        if appended {
            self.emit(StreamSignal::Appended { message_id });
            self.emit(StreamSignal::ScrollToBottom);
            if from_other {
                self.actions
                    .mark_as_read(&self.conversation_id, &self.viewer.id)
                    .await;
            }
        } else {
            self.emit(StreamSignal::Updated { message_id });
        }
    }
}

/// Live message list for one conversation
pub struct MessageStream {
    state: Arc<StreamState>,
    subscription: SubscriptionId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessageStream {
    /// Subscribe, load and start applying live events for `conversation_id`.
    pub async fn open(
        backend: Backend,
        viewer: Viewer,
        conversation_id: &str,
        actions: MessageActions,
        config: &ClientConfig,
    ) -> Result<Self> {
        let filter = FeedFilter::new(Table::Messages, EventKind::All)
            .with_eq("conversation_id", conversation_id);
        let mut feed = backend.feed.subscribe(filter).await.map_err(|e| {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Message subscription failed");
            e
        })?;

        let (signals, _) = broadcast::channel(config.event_buffer);
        let state = Arc::new(StreamState {
            backend,
            viewer,
            conversation_id: conversation_id.to_string(),
            actions,
            messages: RwLock::new(Vec::new()),
            signals,
        });

        state.load().await;
        state
            .actions
            .mark_as_read(&state.conversation_id, &state.viewer.id)
            .await;

        let pump_state = state.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = feed.events.recv().await {
                pump_state.apply(event).await;
            }
            tracing::debug!(conversation_id = %pump_state.conversation_id, "Message feed ended");
        });

        Ok(Self {
            state,
            subscription: feed.id,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Conversation this stream is bound to
    pub fn conversation_id(&self) -> &str {
        &self.state.conversation_id
    }

    /// Receive render signals.
    pub fn signals(&self) -> broadcast::Receiver<StreamSignal> {
        self.state.signals.subscribe()
    }

    /// Every message held, including ones hidden from the viewer.
    pub fn all(&self) -> Vec<Message> {
        self.state.messages.read().clone()
    }

    /// Messages the viewer may see, in creation order.
    pub fn visible(&self) -> Vec<Message> {
        self.state
            .messages
            .read()
            .iter()
            .filter(|m| m.is_visible_to(&self.state.viewer.id))
            .cloned()
            .collect()
    }

    /// Visible messages grouped by calendar date in `tz`.
    pub fn groups<Tz: TimeZone>(&self, tz: &Tz) -> Vec<DateGroup> {
        group_by_date(&self.visible(), tz)
    }

    /// Look up one held message.
    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.state
            .messages
            .read()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// Insert a message from the viewer.
    ///
    /// Returns `Ok(false)` without writing when there is neither text nor an
    /// attachment. The local list is not touched; the message arrives through
    /// the live feed once the backend commits it.
    pub async fn send(&self, text: &str, attachment: Option<Attachment>) -> Result<bool> {
        let outgoing = match OutgoingMessage::compose(text, attachment) {
            Ok(outgoing) => outgoing,
            Err(Error::EmptyMessage) => return Ok(false),
            Err(e) => return Err(e),
        };

        let row = outgoing.to_row(&self.state.conversation_id, &self.state.viewer.id);
        self.state
            .backend
            .rows
            .insert(Table::Messages, vec![row])
            .await
            .map_err(|e| {
                tracing::error!(conversation_id = %self.state.conversation_id, error = %e, "Failed to send message");
                e
            })?;

        tracing::debug!(conversation_id = %self.state.conversation_id, "Message sent");
        Ok(true)
    }

    /// Stop applying events and release the subscription.
    pub async fn close(&self) {
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            pump.abort();
            if let Err(e) = self.state.backend.feed.unsubscribe(self.subscription).await {
                tracing::debug!(conversation_id = %self.state.conversation_id, error = %e, "Unsubscribe failed");
            }
            tracing::debug!(conversation_id = %self.state.conversation_id, "Message stream closed");
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("conversation_id", &self.state.conversation_id)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Operation, RowStore};
    use crate::messaging::MediaKind;
    use crate::time::ManualClock;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        memory: Arc<MemoryBackend>,
        backend: Backend,
        actions: MessageActions,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
        let memory = Arc::new(MemoryBackend::new(Arc::new(clock.clone())));
        let backend = Backend::from_shared(memory.clone());
        let actions = MessageActions::new(backend.clone(), Arc::new(clock), &ClientConfig::default());
        Fixture {
            memory,
            backend,
            actions,
        }
    }

    async fn open(f: &Fixture, user: &str) -> MessageStream {
        MessageStream::open(
            f.backend.clone(),
            Viewer::new(user, user),
            "c1",
            f.actions.clone(),
            &ClientConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn seed(f: &Fixture, id: &str, sender: &str, text: &str) {
        f.memory
            .insert(
                Table::Messages,
                vec![json!({"id": id, "conversation_id": "c1", "sender_id": sender, "content": text, "is_sent": true})],
            )
            .await
            .unwrap();
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<StreamSignal>,
        pred: impl Fn(&StreamSignal) -> bool,
    ) -> StreamSignal {
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let signal = rx.recv().await.unwrap();
                if pred(&signal) {
                    return signal;
                }
            }
        })
        .await
        .expect("signal not received")
    }

    #[tokio::test]
    async fn test_load_is_ascending_and_marks_read() {
        let f = fixture();
        seed(&f, "m1", "alice", "first").await;
        seed(&f, "m2", "alice", "second").await;

        let stream = open(&f, "bob").await;
        let ids: Vec<_> = stream.visible().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["m1", "m2"]);

        let stored = f.memory.rows(Table::Messages);
        assert!(stored.iter().all(|r| r["is_read"] == true && r["is_delivered"] == true));
    }

    #[tokio::test]
    async fn test_send_arrives_through_feed() {
        let f = fixture();
        let stream = open(&f, "alice").await;
        let mut signals = stream.signals();

        assert!(stream.send("  hello  ", None).await.unwrap());
        let signal = next_matching(&mut signals, |s| matches!(s, StreamSignal::Appended { .. })).await;
        let StreamSignal::Appended { message_id } = signal else {
            unreachable!()
        };

        let message = stream.get(&message_id).unwrap();
        assert_eq!(message.content.as_deref(), Some("hello"));
        assert!(message.is_sent);
        assert_eq!(stream.visible().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_send_is_noop() {
        let f = fixture();
        let stream = open(&f, "alice").await;

        assert!(!stream.send("   ", None).await.unwrap());
        assert!(f.memory.rows(Table::Messages).is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_list_untouched() {
        let f = fixture();
        let stream = open(&f, "alice").await;
        f.memory.fail_next(Table::Messages, Operation::Insert);

        let result = stream.send("hello", None).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(stream.visible().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let f = fixture();
        seed(&f, "m1", "alice", "hello").await;
        let stream = open(&f, "alice").await;
        let mut signals = stream.signals();

        // Replay the same row through the live path
        let row = f.memory.rows(Table::Messages).remove(0);
        stream
            .state
            .apply(ChangeEvent {
                table: Table::Messages,
                kind: ChangeKind::Insert,
                new: row,
            })
            .await;

        assert_eq!(stream.all().len(), 1);
        assert_eq!(
            signals.try_recv().unwrap(),
            StreamSignal::Updated {
                message_id: "m1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_update_replaces_in_place_without_scroll() {
        let f = fixture();
        seed(&f, "m1", "alice", "hello").await;
        seed(&f, "m2", "alice", "again").await;
        let stream = open(&f, "alice").await;
        let mut signals = stream.signals();

        f.actions.delete_for_everyone("m1", "alice").await.unwrap();
        next_matching(&mut signals, |s| {
            *s == StreamSignal::Updated {
                message_id: "m1".into(),
            }
        })
        .await;

        let all = stream.all();
        assert_eq!(all[0].id, "m1");
        assert!(all[0].is_deleted);
        assert_eq!(all[0].content, None);
        assert!(signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_for_me_hides_only_for_actor() {
        let f = fixture();
        seed(&f, "m1", "alice", "hello").await;
        let alice = open(&f, "alice").await;
        let bob = open(&f, "bob").await;
        let mut bob_signals = bob.signals();

        f.actions.delete_for_me("m1", "bob").await.unwrap();
        next_matching(&mut bob_signals, |_| bob.visible().is_empty()).await;

        assert!(bob.visible().is_empty());
        assert_eq!(bob.all().len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(alice.visible().len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_insert_marks_read() {
        let f = fixture();
        let bob = open(&f, "bob").await;
        let mut signals = bob.signals();

        seed(&f, "m1", "alice", "ping").await;
        next_matching(&mut signals, |s| {
            *s == StreamSignal::Updated {
                message_id: "m1".into(),
            }
        })
        .await;

        let message = bob.get("m1").unwrap();
        assert!(message.is_read);
        assert!(message.is_delivered);
    }

    #[tokio::test]
    async fn test_other_conversations_are_ignored() {
        let f = fixture();
        let stream = open(&f, "alice").await;

        f.memory
            .insert(
                Table::Messages,
                vec![json!({"conversation_id": "c2", "sender_id": "bob", "content": "x", "media_type": MediaKind::Image})],
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(stream.all().is_empty());
    }

    #[tokio::test]
    async fn test_close_releases_subscription() {
        let f = fixture();
        let stream = open(&f, "alice").await;
        assert_eq!(f.memory.live_feed_subscriptions(), 1);

        stream.close().await;
        assert_eq!(f.memory.live_feed_subscriptions(), 0);

        seed(&f, "m1", "bob", "late").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(stream.all().is_empty());
    }
}
