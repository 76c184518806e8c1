//! # Conversation Session
//!
//! Owns the per-conversation resources for the active conversation.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SESSION STATE MACHINE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │        bind(c1)                    bind(c2)                             │
//! │  Idle ─────────► Bound(c1) ─────────────────────► Bound(c2)            │
//! │   ▲                  │     1. close stream(c1)                          │
//! │   │    unbind()      │     2. close typing(c1)                          │
//! │   └──────────────────┘     3. open stream(c2), join typing(c2)          │
//! │                                                                         │
//! │  At most one MessageStream and one TypingSignaler are live at a time.  │
//! │  Transitions are serialized; the previous binding is torn down         │
//! │  before the next one subscribes.                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{Backend, Select, Table};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::messaging::{Attachment, MessageActions, MessageStream};
use crate::profiles::Viewer;
use crate::typing::TypingSignaler;

/// Externally visible session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No conversation active
    Idle,
    /// Bound to a conversation id
    Bound(String),
}

/// Resources that live exactly as long as a binding
#[derive(Debug)]
pub struct BoundConversation {
    /// Conversation id
    pub conversation_id: String,
    /// Live message list
    pub stream: MessageStream,
    /// Typing indicators
    pub typing: TypingSignaler,
}

impl BoundConversation {
    async fn close(&self) {
        self.stream.close().await;
        self.typing.close().await;
    }
}

/// Explicit bind/unbind lifecycle for the active conversation
pub struct ConversationSession {
    backend: Backend,
    viewer: Viewer,
    config: ClientConfig,
    actions: MessageActions,
    transition: AsyncMutex<()>,
    current: RwLock<Option<Arc<BoundConversation>>>,
}

impl ConversationSession {
    /// Create an idle session.
    pub fn new(backend: Backend, viewer: Viewer, config: ClientConfig, actions: MessageActions) -> Self {
        Self {
            backend,
            viewer,
            config,
            actions,
            transition: AsyncMutex::new(()),
            current: RwLock::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        match self.current.read().as_ref() {
            Some(bound) => SessionState::Bound(bound.conversation_id.clone()),
            None => SessionState::Idle,
        }
    }

    /// The active binding, if any
    pub fn current(&self) -> Option<Arc<BoundConversation>> {
        self.current.read().clone()
    }

    /// Make `conversation_id` the active conversation.
    ///
    /// Binding the conversation that is already active returns the existing
    /// binding. An unknown id fails with `ConversationNotFound` and leaves the
    /// current binding in place; a later failure leaves the session idle.
    pub async fn bind(&self, conversation_id: &str) -> Result<Arc<BoundConversation>> {
        let _guard = self.transition.lock().await;

        if let Some(bound) = self.current() {
            if bound.conversation_id == conversation_id {
                return Ok(bound);
            }
        }
        self.ensure_exists(conversation_id).await?;
        self.teardown().await;

        let stream = MessageStream::open(
            self.backend.clone(),
            self.viewer.clone(),
            conversation_id,
            self.actions.clone(),
            &self.config,
        )
        .await?;

        let typing = match TypingSignaler::join(&self.backend, conversation_id, self.viewer.clone(), &self.config).await {
            Ok(typing) => typing,
            Err(e) => {
                stream.close().await;
                return Err(e);
            }
        };

        let bound = Arc::new(BoundConversation {
            conversation_id: conversation_id.to_string(),
            stream,
            typing,
        });
        *self.current.write() = Some(bound.clone());

        tracing::info!(conversation_id = %conversation_id, user_id = %self.viewer.id, "Conversation bound");
        Ok(bound)
    }

    async fn ensure_exists(&self, conversation_id: &str) -> Result<()> {
        let query = Select::from(Table::Conversations).eq("id", conversation_id).limit(1);
        let rows = self.backend.rows.select(&query).await?;
        if rows.is_empty() {
            tracing::warn!(conversation_id = %conversation_id, "Refusing to bind unknown conversation");
            return Err(Error::ConversationNotFound);
        }
        Ok(())
    }

    /// Tear down the active conversation, if any.
    pub async fn unbind(&self) {
        let _guard = self.transition.lock().await;
        self.teardown().await;
    }

    async fn teardown(&self) {
        let previous = self.current.write().take();
        if let Some(previous) = previous {
            previous.close().await;
            tracing::info!(conversation_id = %previous.conversation_id, "Conversation unbound");
        }
    }

    /// Send into the active conversation. `Ok(false)` when idle or empty.
    pub async fn send(&self, text: &str, attachment: Option<Attachment>) -> Result<bool> {
        match self.current() {
            Some(bound) => bound.stream.send(text, attachment).await,
            None => Ok(false),
        }
    }

    /// Forward a keystroke to the active conversation's typing signaler.
    pub async fn keystroke(&self) {
        if let Some(bound) = self.current() {
            bound.typing.keystroke().await;
        }
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("viewer", &self.viewer.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RowStore};
    use crate::time::system_clock;
    use serde_json::json;

    async fn seeded() -> Arc<MemoryBackend> {
        let memory = Arc::new(MemoryBackend::default());
        memory
            .insert(Table::Conversations, vec![json!({"id": "c1"}), json!({"id": "c2"})])
            .await
            .unwrap();
        memory
    }

    fn session(memory: &Arc<MemoryBackend>, user: &str) -> ConversationSession {
        let backend = Backend::from_shared(memory.clone());
        let config = ClientConfig::default();
        let actions = MessageActions::new(backend.clone(), system_clock(), &config);
        ConversationSession::new(backend, Viewer::new(user, user), config, actions)
    }

    #[tokio::test]
    async fn test_bind_unknown_conversation_keeps_current() {
        let memory = seeded().await;
        let session = session(&memory, "alice");
        session.bind("c1").await.unwrap();

        assert_eq!(session.bind("missing").await.unwrap_err(), Error::ConversationNotFound);
        assert_eq!(session.state(), SessionState::Bound("c1".into()));
        assert_eq!(memory.live_feed_subscriptions(), 1);
        assert_eq!(memory.live_channel_subscriptions("typing:missing"), 0);
    }

    #[tokio::test]
    async fn test_bind_switch_unbind() {
        let memory = seeded().await;
        let session = session(&memory, "alice");
        assert_eq!(session.state(), SessionState::Idle);

        session.bind("c1").await.unwrap();
        assert_eq!(session.state(), SessionState::Bound("c1".into()));
        assert_eq!(memory.live_feed_subscriptions(), 1);
        assert_eq!(memory.live_channel_subscriptions("typing:c1"), 1);

        session.bind("c2").await.unwrap();
        assert_eq!(session.state(), SessionState::Bound("c2".into()));
        assert_eq!(memory.live_feed_subscriptions(), 1);
        assert_eq!(memory.live_channel_subscriptions("typing:c1"), 0);
        assert_eq!(memory.live_channel_subscriptions("typing:c2"), 1);

        session.unbind().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(memory.live_feed_subscriptions(), 0);
        assert_eq!(memory.live_channel_subscriptions("typing:c2"), 0);
    }

    #[tokio::test]
    async fn test_rebind_same_conversation_keeps_binding() {
        let memory = seeded().await;
        let session = session(&memory, "alice");

        let first = session.bind("c1").await.unwrap();
        let second = session.bind("c1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memory.live_feed_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_stale_binding_stops_receiving() {
        let memory = seeded().await;
        let session = session(&memory, "alice");

        let old = session.bind("c1").await.unwrap();
        session.bind("c2").await.unwrap();

        memory
            .insert(
                Table::Messages,
                vec![json!({"conversation_id": "c1", "sender_id": "bob", "content": "late"})],
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(old.stream.all().is_empty());
    }

    #[tokio::test]
    async fn test_idle_send_is_noop() {
        let memory = seeded().await;
        let session = session(&memory, "alice");

        assert!(!session.send("hello", None).await.unwrap());
        session.keystroke().await;
        assert!(memory.rows(Table::Messages).is_empty());
    }

    #[tokio::test]
    async fn test_send_when_bound() {
        let memory = seeded().await;
        let session = session(&memory, "alice");
        session.bind("c1").await.unwrap();

        assert!(session.send("hello", None).await.unwrap());
        let rows = memory.rows(Table::Messages);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["conversation_id"], "c1");
    }
}
