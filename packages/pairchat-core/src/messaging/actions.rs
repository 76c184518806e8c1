//! # Message Lifecycle Actions
//!
//! Guarded mutations against the message table.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      LIFECYCLE ACTIONS                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  mark_as_read(conversation, viewer)                                    │
//! │     UPDATE messages SET is_read, is_delivered = true                   │
//! │     WHERE conversation_id = ? AND sender_id <> viewer                  │
//! │       AND is_read = false                       (best-effort)          │
//! │                                                                         │
//! │  delete_for_me(message, user)                                          │
//! │     read deleted_for_user_ids → append user → write back               │
//! │                                                                         │
//! │  delete_for_everyone(message, actor)                                   │
//! │     actor == sender ?                 no  → NotMessageSender            │
//! │     now - created_at <= window ?      no  → DeleteWindowExpired         │
//! │     UPDATE SET is_deleted = true, content = NULL, media_url = NULL     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde_json::{json, Value};

use super::Message;
use crate::backend::{decode_row, Backend, Filter, Select, Table};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::time::SharedClock;

/// Guarded message mutations
#[derive(Clone)]
pub struct MessageActions {
    backend: Backend,
    clock: SharedClock,
    delete_window: chrono::Duration,
}

impl std::fmt::Debug for MessageActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageActions")
            .field("delete_window", &self.delete_window)
            .finish_non_exhaustive()
    }
}

impl MessageActions {
    /// Create the action set.
    pub fn new(backend: Backend, clock: SharedClock, config: &ClientConfig) -> Self {
        Self {
            backend,
            clock,
            delete_window: config.delete_window(),
        }
    }

    /// Mark every unread incoming message in a conversation as read and
    /// delivered. Returns the number of rows changed; failures count as zero.
    pub async fn mark_as_read(&self, conversation_id: &str, viewer_id: &str) -> usize {
        let filters = [
            Filter::eq("conversation_id", conversation_id),
            Filter::neq("sender_id", viewer_id),
            Filter::eq("is_read", false),
        ];
        let patch = json!({ "is_read": true, "is_delivered": true });

        match self.backend.rows.update(Table::Messages, &filters, patch).await {
            Ok(0) => 0,
            Ok(n) => {
                tracing::debug!(conversation_id = %conversation_id, count = n, "Marked messages as read");
                n
            }
            Err(e) => {
                tracing::debug!(conversation_id = %conversation_id, error = %e, "Mark-as-read skipped");
                0
            }
        }
    }

    /// Hide a message from `user_id`'s own view.
    pub async fn delete_for_me(&self, message_id: &str, user_id: &str) -> Result<()> {
        let row = self.fetch_row(message_id).await?;

        let mut hidden_for: Vec<Value> = row
            .get("deleted_for_user_ids")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if hidden_for.iter().any(|id| id == user_id) {
            return Ok(());
        }
        hidden_for.push(Value::String(user_id.to_string()));

        self.backend
            .rows
            .update(
                Table::Messages,
                &[Filter::eq("id", message_id)],
                json!({ "deleted_for_user_ids": hidden_for }),
            )
            .await
            .map_err(|e| {
                tracing::error!(message_id = %message_id, error = %e, "Delete for me failed");
                e
            })?;

        tracing::info!(message_id = %message_id, user_id = %user_id, "Message hidden for user");
        Ok(())
    }

    /// Soft-delete a message for both participants.
    ///
    /// Only the sender may do this, and only within the configured window
    /// of the stored creation time. Nothing is written on rejection.
    pub async fn delete_for_everyone(&self, message_id: &str, actor_id: &str) -> Result<()> {
        let message: Message = decode_row(self.fetch_row(message_id).await?)?;

        if !message.is_from(actor_id) {
            return Err(Error::NotMessageSender);
        }

        let age = self.clock.now() - message.created_at;
        if age > self.delete_window {
            return Err(Error::DeleteWindowExpired {
                minutes: self.delete_window.num_minutes(),
            });
        }

        self.backend
            .rows
            .update(
                Table::Messages,
                &[Filter::eq("id", message_id)],
                json!({ "is_deleted": true, "content": null, "media_url": null }),
            )
            .await
            .map_err(|e| {
                tracing::error!(message_id = %message_id, error = %e, "Delete for everyone failed");
                e
            })?;

        tracing::info!(message_id = %message_id, "Message deleted for everyone");
        Ok(())
    }

    async fn fetch_row(&self, message_id: &str) -> Result<Value> {
        let rows = self
            .backend
            .rows
            .select(&Select::from(Table::Messages).eq("id", message_id).limit(1))
            .await?;
        rows.into_iter().next().ok_or(Error::MessageNotFound)
    }
}

// ============================================================================
// TESTS
// ============================================================================
