//! # Conversation Directory
//!
//! Cross-conversation aggregation for the viewer: the conversation list, the
//! "start a chat" user list, find-or-create, and the active conversation.
//!
//! ## Refresh Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       DIRECTORY REFRESH                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Triggers: start, any messages INSERT, any profiles change,            │
//! │            conversation created                                        │
//! │                                                                         │
//! │  1. participant rows where user_id = viewer       → conversation ids   │
//! │  2. conversations where id IN (ids)                                    │
//! │  3. per conversation, concurrently:                                    │
//! │       other participant → profile                                      │
//! │       newest message   (ORDER BY created_at DESC LIMIT 1)              │
//! │       unread count     (sender <> viewer AND is_read = false)          │
//! │  4. sort by (last message time | created_at) DESC                      │
//! │  5. publish, unless a later refresh already published                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The list is recomputed from scratch on every trigger. Failed reads keep
//! the previous list (whole refresh) or leave a field empty (one summary).
//!
//! ## Find-or-Create
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  find_or_create(target)                                                │
//! │    target == viewer ──► CannotMessageSelf                              │
//! │    viewer's conversation ids ∩ target's participant rows               │
//! │       found ──► existing id                                            │
//! │       none  ──► new v4 id → insert conversation                        │
//! │                          → insert (viewer, target) participants        │
//! │                             failed ──► ParticipantsNotCreated          │
//! │                                        (conversation row stays)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Uniqueness per pair is enforced only by this search. Two clients racing
//! on the same pair can both create a conversation.

mod session;

pub use session::{BoundConversation, ConversationSession, SessionState};

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backend::{
    decode_row, decode_rows, Backend, ChangeEvent, Direction, EventKind, FeedFilter, Row, Select,
    SubscriptionId, Table,
};
use crate::error::{Error, Result};
use crate::messaging::{Message, EMPTY_PREVIEW};
use crate::profiles::{Profile, ProfileService, Viewer};

/// A conversation row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Conversation id
    pub id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A conversation enriched for the viewer's list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// The conversation row
    pub conversation: Conversation,
    /// The other participant, when resolvable
    pub other: Option<Profile>,
    /// Newest message
    pub last_message: Option<Message>,
    /// Messages from the other participant the viewer has not read
    pub unread_count: usize,
}

impl ConversationSummary {
    /// Conversation id
    pub fn id(&self) -> &str {
        &self.conversation.id
    }

    /// Sort key: newest message time, else creation time
    pub fn activity_at(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.conversation.created_at)
    }

    /// List preview text
    pub fn preview(&self) -> String {
        match &self.last_message {
            Some(message) => message.preview(),
            None => EMPTY_PREVIEW.to_string(),
        }
    }

    /// Name shown for the conversation
    pub fn title(&self) -> &str {
        self.other.as_ref().map(|p| p.full_name.as_str()).unwrap_or("Unknown user")
    }
}

/// Orders concurrent refreshes: a result is published only if no later
/// refresh has published already.
#[derive(Debug, Default)]
struct Sequencer {
    issued: AtomicU64,
    published: Mutex<u64>,
}

impl Sequencer {
    fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish<T>(&self, ticket: u64, tx: &watch::Sender<T>, value: T) -> bool {
        let mut published = self.published.lock();
        if ticket <= *published {
            return false;
        }
        *published = ticket;
        tx.send_replace(value);
        true
    }
}

struct DirectoryState {
    backend: Backend,
    viewer: Viewer,
    profiles: ProfileService,
    conversations: watch::Sender<Vec<ConversationSummary>>,
    users: watch::Sender<Vec<Profile>>,
    conversation_seq: Sequencer,
    user_seq: Sequencer,
}

impl DirectoryState {
    async fn refresh(&self) {
        let ticket = self.conversation_seq.ticket();
        match self.load_summaries().await {
            Ok(summaries) => {
                let count = summaries.len();
                if self.conversation_seq.publish(ticket, &self.conversations, summaries) {
                    tracing::debug!(user_id = %self.viewer.id, count, "Conversation list refreshed");
                } else {
                    tracing::debug!(user_id = %self.viewer.id, ticket, "Discarding superseded refresh");
                }
            }
            Err(e) => {
                tracing::warn!(user_id = %self.viewer.id, error = %e, "Failed to refresh conversations");
            }
        }
    }

    async fn refresh_users(&self) {
        let ticket = self.user_seq.ticket();
        match self.profiles.list_others(&self.viewer.id).await {
            Ok(users) => {
                self.user_seq.publish(ticket, &self.users, users);
            }
            Err(e) => tracing::warn!(user_id = %self.viewer.id, error = %e, "Failed to load users"),
        }
    }

    async fn conversation_ids(&self) -> Result<Vec<String>> {
        let rows = self
            .backend
            .rows
            .select(&Select::from(Table::ConversationParticipants).eq("user_id", self.viewer.id.as_str()))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("conversation_id").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    async fn load_summaries(&self) -> Result<Vec<ConversationSummary>> {
        let ids = self.conversation_ids().await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self
            .backend
            .rows
            .select(&Select::from(Table::Conversations).is_in("id", ids))
            .await?;
        let conversations: Vec<Conversation> = decode_rows(rows)?;

        let mut summaries = join_all(conversations.into_iter().map(|c| self.enrich(c))).await;
        summaries.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
        Ok(summaries)
    }

    async fn enrich(&self, conversation: Conversation) -> ConversationSummary {
        let (other, last_message, unread_count) = futures::join!(
            self.other_participant(&conversation.id),
            self.last_message(&conversation.id),
            self.unread_count(&conversation.id),
        );
        ConversationSummary {
            conversation,
            other,
            last_message,
            unread_count,
        }
    }

    async fn other_participant(&self, conversation_id: &str) -> Option<Profile> {
        let query = Select::from(Table::ConversationParticipants)
            .eq("conversation_id", conversation_id)
            .neq("user_id", self.viewer.id.as_str())
            .limit(1);

        let user_id = match self.backend.rows.select(&query).await {
            Ok(rows) => rows
                .first()
                .and_then(|r| r.get("user_id"))
                .and_then(|v| v.as_str())
                .map(str::to_string)?,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to resolve participant");
                return None;
            }
        };

        match self.profiles.fetch(&user_id).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, user_id = %user_id, error = %e, "Failed to load participant profile");
                None
            }
        }
    }

    async fn last_message(&self, conversation_id: &str) -> Option<Message> {
        let query = Select::from(Table::Messages)
            .eq("conversation_id", conversation_id)
            .order_by("created_at", Direction::Descending)
            .limit(1);

        match self.backend.rows.select(&query).await {
            Ok(rows) => match rows.into_iter().next().map(decode_row::<Message>) {
                Some(Ok(message)) => Some(message.normalize()),
                Some(Err(e)) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "Skipping undecodable last message");
                    None
                }
                None => None,
            },
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to load last message");
                None
            }
        }
    }

    async fn unread_count(&self, conversation_id: &str) -> usize {
        let query = Select::from(Table::Messages)
            .eq("conversation_id", conversation_id)
            .neq("sender_id", self.viewer.id.as_str())
            .eq("is_read", false);

        match self.backend.rows.count(&query).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to count unread messages");
                0
            }
        }
    }
}

// ============================================================================
// DIRECTORY
// ============================================================================

/// The viewer's conversation list plus the active-conversation session
pub struct ConversationDirectory {
    state: Arc<DirectoryState>,
    session: ConversationSession,
    subscriptions: Vec<SubscriptionId>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl ConversationDirectory {
    /// Subscribe to the refresh triggers, then load both lists.
    pub async fn start(
        backend: Backend,
        viewer: Viewer,
        profiles: ProfileService,
        session: ConversationSession,
    ) -> Result<Self> {
        let messages = backend
            .feed
            .subscribe(FeedFilter::new(Table::Messages, EventKind::Insert))
            .await?;
        let profile_changes = match backend
            .feed
            .subscribe(FeedFilter::new(Table::Profiles, EventKind::All))
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                if let Err(e) = backend.feed.unsubscribe(messages.id).await {
                    tracing::debug!(subscription = %messages.id, error = %e, "Unsubscribe failed");
                }
                return Err(e);
            }
        };

        let (conversations, _) = watch::channel(Vec::new());
        let (users, _) = watch::channel(Vec::new());
        let state = Arc::new(DirectoryState {
            backend,
            viewer,
            profiles,
            conversations,
            users,
            conversation_seq: Sequencer::default(),
            user_seq: Sequencer::default(),
        });

        futures::join!(state.refresh(), state.refresh_users());

        let subscriptions = vec![messages.id, profile_changes.id];

        let on_message = state.clone();
        let message_pump = spawn_pump(messages.events, move || {
            let state = on_message.clone();
            async move { state.refresh().await }
        });

        let on_profile = state.clone();
        let profile_pump = spawn_pump(profile_changes.events, move || {
            let state = on_profile.clone();
            async move {
                futures::join!(state.refresh_users(), state.refresh());
            }
        });

        tracing::info!(user_id = %state.viewer.id, "Conversation directory started");
        Ok(Self {
            state,
            session,
            subscriptions,
            pumps: Mutex::new(vec![message_pump, profile_pump]),
        })
    }

    /// The viewer
    pub fn viewer(&self) -> &Viewer {
        &self.state.viewer
    }

    /// Current conversation list, most recently active first
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.state.conversations.borrow().clone()
    }

    /// Receiver that wakes on every published list.
    pub fn watch_conversations(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.state.conversations.subscribe()
    }

    /// Every other user, ordered by name
    pub fn users(&self) -> Vec<Profile> {
        self.state.users.borrow().clone()
    }

    /// Receiver that wakes on every published user list.
    pub fn watch_users(&self) -> watch::Receiver<Vec<Profile>> {
        self.state.users.subscribe()
    }

    /// Conversations whose other participant's name contains `query`.
    pub fn search(&self, query: &str) -> Vec<ConversationSummary> {
        self.state
            .conversations
            .borrow()
            .iter()
            .filter(|s| s.other.as_ref().map(|p| p.name_matches(query)).unwrap_or(false))
            .cloned()
            .collect()
    }

    /// Users whose name contains `query`.
    pub fn search_users(&self, query: &str) -> Vec<Profile> {
        self.state
            .users
            .borrow()
            .iter()
            .filter(|p| p.name_matches(query))
            .cloned()
            .collect()
    }

    /// Recompute the conversation list now.
    pub async fn refresh(&self) {
        self.state.refresh().await;
    }

    /// Reload the user list now.
    pub async fn refresh_users(&self) {
        self.state.refresh_users().await;
    }

    /// Return the conversation shared with `target_id`, creating it if needed.
    pub async fn find_or_create(&self, target_id: &str) -> Result<String> {
        let viewer_id = self.state.viewer.id.as_str();
        if target_id == viewer_id {
            return Err(Error::CannotMessageSelf);
        }

        if let Some(existing) = self.find_shared(target_id).await? {
            tracing::debug!(conversation_id = %existing, target_id = %target_id, "Reusing conversation");
            return Ok(existing);
        }

        let conversation_id = generate_conversation_id();
        let rows = &self.state.backend.rows;

        rows.insert(Table::Conversations, vec![json!({ "id": conversation_id })])
            .await
            .map_err(|e| {
                tracing::error!(target_id = %target_id, error = %e, "Failed to create conversation");
                e
            })?;

        let participants: Vec<Row> = vec![
            json!({ "conversation_id": conversation_id, "user_id": viewer_id }),
            json!({ "conversation_id": conversation_id, "user_id": target_id }),
        ];
        if let Err(e) = rows.insert(Table::ConversationParticipants, participants).await {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Failed to add participants");
            return Err(Error::ParticipantsNotCreated {
                conversation_id,
                reason: e.to_string(),
            });
        }

        tracing::info!(conversation_id = %conversation_id, target_id = %target_id, "Conversation created");
        self.state.refresh().await;
        Ok(conversation_id)
    }

    async fn find_shared(&self, target_id: &str) -> Result<Option<String>> {
        let mine = self.state.conversation_ids().await?;
        if mine.is_empty() {
            return Ok(None);
        }

        let query = Select::from(Table::ConversationParticipants)
            .is_in("conversation_id", mine)
            .eq("user_id", target_id)
            .limit(1);
        let rows = self.state.backend.rows.select(&query).await?;

        Ok(rows
            .first()
            .and_then(|r| r.get("conversation_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    // ========================================================================
    // ACTIVE CONVERSATION
    // ========================================================================

    /// The active-conversation session
    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    /// Make `conversation_id` the active conversation.
    pub async fn open(&self, conversation_id: &str) -> Result<Arc<BoundConversation>> {
        self.session.bind(conversation_id).await
    }

    /// Find or create the conversation with `target_id` and make it active.
    pub async fn open_with(&self, target_id: &str) -> Result<Arc<BoundConversation>> {
        let conversation_id = self.find_or_create(target_id).await?;
        self.session.bind(&conversation_id).await
    }

    /// Leave the active conversation.
    pub async fn close_active(&self) {
        self.session.unbind().await;
    }

    /// Tear down the session and every directory subscription.
    pub async fn close(&self) {
        self.session.unbind().await;

        let pumps: Vec<_> = self.pumps.lock().drain(..).collect();
        if pumps.is_empty() {
            return;
        }
        for pump in pumps {
            pump.abort();
        }
        for id in &self.subscriptions {
            if let Err(e) = self.state.backend.feed.unsubscribe(*id).await {
                tracing::debug!(subscription = %id, error = %e, "Unsubscribe failed");
            }
        }
        tracing::info!(user_id = %self.state.viewer.id, "Conversation directory closed");
    }
}

impl Drop for ConversationDirectory {
    fn drop(&mut self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for ConversationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationDirectory")
            .field("viewer", &self.state.viewer.id)
            .field("conversations", &self.state.conversations.borrow().len())
            .field("session", &self.session)
            .finish()
    }
}

/// Drain a feed, running `on_change` once per burst of queued events.
fn spawn_pump<F, Fut>(mut events: mpsc::UnboundedReceiver<ChangeEvent>, mut on_change: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        while events.recv().await.is_some() {
            while events.try_recv().is_ok() {}
            on_change().await;
        }
    })
}

/// A fresh version-4 conversation id.
///
/// Uses the operating system's random source, falling back to a
/// time-and-hasher seeded generator when it is unavailable.
pub fn generate_conversation_id() -> String {
    let mut bytes = [0u8; 16];
    if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
        tracing::warn!(error = %e, "Secure random source unavailable, using fallback generator");
        fallback_rng().fill_bytes(&mut bytes);
    }
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

fn fallback_rng() -> StdRng {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(nanos);
    StdRng::seed_from_u64(hasher.finish() ^ nanos)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Operation, RowStore};
    use crate::config::ClientConfig;
    use crate::messaging::MessageActions;
    use crate::time::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;
    use uuid::Uuid;

    fn is_v4(id: &str) -> bool {
        Uuid::parse_str(id).map(|u| u.get_version_num() == 4).unwrap_or(false)
    }

    struct World {
        memory: Arc<MemoryBackend>,
        clock: ManualClock,
    }

    impl World {
        async fn new() -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 19, 9, 0, 0).unwrap());
            let memory = Arc::new(MemoryBackend::new(Arc::new(clock.clone())));
            memory
                .insert(
                    Table::Profiles,
                    vec![
                        json!({"id": "alice", "full_name": "Alice"}),
                        json!({"id": "bob", "full_name": "Bob"}),
                        json!({"id": "carol", "full_name": "Carol"}),
                    ],
                )
                .await
                .unwrap();
            Self { memory, clock }
        }

        async fn directory(&self, user: &str) -> ConversationDirectory {
            let backend = Backend::from_shared(self.memory.clone());
            let viewer = Viewer::new(user, user);
            let config = ClientConfig::default();
            let actions = MessageActions::new(backend.clone(), Arc::new(self.clock.clone()), &config);
            let session = ConversationSession::new(backend.clone(), viewer.clone(), config, actions);
            ConversationDirectory::start(backend.clone(), viewer, ProfileService::new(backend), session)
                .await
                .unwrap()
        }

        async fn message(&self, conversation_id: &str, sender: &str, text: &str) {
            self.memory
                .insert(
                    Table::Messages,
                    vec![json!({"conversation_id": conversation_id, "sender_id": sender, "content": text, "is_sent": true})],
                )
                .await
                .unwrap();
        }
    }

    async fn wait_until<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
        tokio::time::timeout(Duration::from_secs(1), rx.wait_for(pred))
            .await
            .expect("timed out")
            .expect("sender dropped")
            .clone()
    }

    #[test]
    fn test_generated_ids_are_v4() {
        let a = generate_conversation_id();
        let b = generate_conversation_id();
        assert!(is_v4(&a));
        assert_ne!(a, b);

        let mut bytes = [0u8; 16];
        fallback_rng().fill_bytes(&mut bytes);
        assert!(is_v4(&uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()));
    }

    #[tokio::test]
    async fn test_create_then_both_sides_see_it() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        let bob = world.directory("bob").await;
        let mut bob_rx = bob.watch_conversations();

        let id = alice.find_or_create("bob").await.unwrap();

        let mine = alice.conversations();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id(), id);
        assert_eq!(mine[0].unread_count, 0);
        assert!(mine[0].last_message.is_none());
        assert_eq!(mine[0].preview(), EMPTY_PREVIEW);
        assert_eq!(mine[0].title(), "Bob");

        // Bob learns about it on the next refresh trigger
        bob.refresh().await;
        let theirs = wait_until(&mut bob_rx, |l| !l.is_empty()).await;
        assert_eq!(theirs[0].id(), id);
        assert_eq!(theirs[0].title(), "Alice");
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent_in_both_directions() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        let bob = world.directory("bob").await;

        let first = alice.find_or_create("bob").await.unwrap();
        assert_eq!(alice.find_or_create("bob").await.unwrap(), first);
        assert_eq!(bob.find_or_create("alice").await.unwrap(), first);
        assert_eq!(world.memory.rows(Table::Conversations).len(), 1);

        let other = alice.find_or_create("carol").await.unwrap();
        assert_ne!(other, first);
    }

    #[tokio::test]
    async fn test_cannot_message_self() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        assert_eq!(alice.find_or_create("alice").await, Err(Error::CannotMessageSelf));
    }

    #[tokio::test]
    async fn test_participant_failure_leaves_invisible_orphan() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        world
            .memory
            .fail_next(Table::ConversationParticipants, Operation::Insert);

        let err = alice.find_or_create("bob").await.unwrap_err();
        let conversation_id = match err {
            Error::ParticipantsNotCreated { conversation_id, .. } => conversation_id,
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(world.memory.rows(Table::Conversations).len(), 1);
        assert!(world.memory.rows(Table::ConversationParticipants).is_empty());

        // The orphan is never matched; a retry creates a fresh conversation
        let retry = alice.find_or_create("bob").await.unwrap();
        assert_ne!(retry, conversation_id);
        assert_eq!(world.memory.rows(Table::Conversations).len(), 2);
    }

    #[tokio::test]
    async fn test_new_messages_reorder_and_count_unread() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        let with_bob = alice.find_or_create("bob").await.unwrap();
        world.clock.advance(chrono::Duration::seconds(1));
        let with_carol = alice.find_or_create("carol").await.unwrap();
        assert_eq!(alice.conversations()[0].id(), with_carol);

        let mut rx = alice.watch_conversations();
        world.clock.advance(chrono::Duration::seconds(1));
        world.message(&with_bob, "bob", "hi").await;
        world.clock.advance(chrono::Duration::seconds(1));
        world.message(&with_bob, "bob", "there").await;

        let list = wait_until(&mut rx, |l| l.first().map(|s| s.unread_count == 2).unwrap_or(false)).await;
        assert_eq!(list[0].id(), with_bob);
        assert_eq!(list[0].preview(), "there");
        assert_eq!(list[1].unread_count, 0);
    }

    #[tokio::test]
    async fn test_undecodable_last_message_shows_empty_preview() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        let id = alice.find_or_create("bob").await.unwrap();
        world
            .memory
            .insert(
                Table::Messages,
                vec![json!({"conversation_id": id, "sender_id": "bob", "content": "hi", "created_at": "not a time"})],
            )
            .await
            .unwrap();

        alice.refresh().await;
        let list = alice.conversations();
        assert_eq!(list.len(), 1);
        assert!(list[0].last_message.is_none());
        assert_eq!(list[0].preview(), EMPTY_PREVIEW);
    }

    #[tokio::test]
    async fn test_profile_changes_refresh_users() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        let names: Vec<_> = alice.users().into_iter().map(|p| p.full_name).collect();
        assert_eq!(names, ["Bob", "Carol"]);

        let mut rx = alice.watch_users();
        world
            .memory
            .insert(Table::Profiles, vec![json!({"id": "dave", "full_name": "Dave"})])
            .await
            .unwrap();
        let users = wait_until(&mut rx, |u| u.len() == 3).await;
        assert_eq!(users[2].full_name, "Dave");

        assert_eq!(alice.search_users("DA").len(), 1);
        assert_eq!(alice.search_users("").len(), 3);
    }

    #[tokio::test]
    async fn test_search_conversations_by_name() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        alice.find_or_create("bob").await.unwrap();
        alice.find_or_create("carol").await.unwrap();

        let hits = alice.search("car");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title(), "Carol");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_list() {
        let world = World::new().await;
        let alice = world.directory("alice").await;
        alice.find_or_create("bob").await.unwrap();

        world
            .memory
            .fail_next(Table::ConversationParticipants, Operation::Select);
        alice.refresh().await;
        assert_eq!(alice.conversations().len(), 1);
    }

    #[test]
    fn test_sequencer_discards_stale_results() {
        let seq = Sequencer::default();
        let (tx, rx) = watch::channel(0);
        let early = seq.ticket();
        let late = seq.ticket();

        assert!(seq.publish(late, &tx, 2));
        assert!(!seq.publish(early, &tx, 1));
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn test_open_with_binds_session() {
        let world = World::new().await;
        let alice = world.directory("alice").await;

        let bound = alice.open_with("bob").await.unwrap();
        assert_eq!(
            alice.session().state(),
            SessionState::Bound(bound.conversation_id.clone())
        );

        alice.close().await;
        assert_eq!(alice.session().state(), SessionState::Idle);
        assert_eq!(world.memory.live_feed_subscriptions(), 0);
    }
}
