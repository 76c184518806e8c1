//! # Messaging Module
//!
//! Message rows, the per-conversation live stream, lifecycle actions and
//! display helpers.
//!
//! ## Message Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MESSAGE LIFECYCLE                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender                                        Recipient                │
//! │  ──────                                        ─────────                │
//! │                                                                         │
//! │  send(text, attachment)                                                │
//! │     │  insert { is_sent: true }                                        │
//! │     ▼                                                                   │
//! │  ┌──────────┐    change feed (INSERT)    ┌──────────────────────────┐  │
//! │  │ messages │ ─────────────────────────► │ MessageStream (both ends)│  │
//! │  └──────────┘                            └────────────┬─────────────┘  │
//! │       ▲                                               │                │
//! │       │  update { is_read, is_delivered }             │ viewing        │
//! │       └─────────────────────────────── mark_as_read ◄─┘                │
//! │                                                                         │
//! │  Flags only move forward:                                              │
//! │                                                                         │
//! │    is_sent ──► is_delivered ──► is_read          (never reset)         │
//! │    is_deleted: false ──► true                    (terminal, no undo)   │
//! │    deleted_for_user_ids: grows only                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Submodules
//!
//! - [`stream`] - live, de-duplicated message list for one conversation
//! - [`actions`] - mark-as-read, delete-for-me, delete-for-everyone
//! - [`grouping`] - calendar-date groups and time labels

pub mod actions;
pub mod grouping;
pub mod stream;

pub use actions::MessageActions;
pub use grouping::{date_label, group_by_date, list_time_label, DateGroup};
pub use stream::{MessageStream, StreamSignal};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Preview shown for a soft-deleted last message
pub const DELETED_PREVIEW: &str = "This message was deleted";

/// Preview shown for a conversation without messages
pub const EMPTY_PREVIEW: &str = "Start a conversation";

// ============================================================================
// MEDIA KIND
// ============================================================================

/// Kind of attachment carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Photo or picture
    Image,
    /// PDF document
    Pdf,
    /// Recorded voice note
    Voice,
}

impl MediaKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Pdf => "pdf",
            Self::Voice => "voice",
        }
    }

    /// Extension used when a file name carries none
    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Pdf => "pdf",
            Self::Voice => "webm",
        }
    }

    /// Conversation-list preview for a message carrying this kind
    pub fn preview_label(&self) -> &'static str {
        match self {
            Self::Image => "Photo",
            Self::Pdf => "Document",
            Self::Voice => "Voice message",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(Self::Image),
            "pdf" => Ok(Self::Pdf),
            "voice" => Ok(Self::Voice),
            other => Err(Error::InvalidMedia(format!("unknown media kind '{}'", other))),
        }
    }
}

/// An uploaded attachment ready to be referenced by a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Public URL returned by the media pipeline
    pub url: String,
    /// Attachment kind
    pub kind: MediaKind,
}

// ============================================================================
// DELIVERY STATE
// ============================================================================

/// Sender-side status derived from the delivery flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Stored by the backend
    Sent,
    /// Seen by the recipient's client
    Delivered,
    /// Read by the recipient
    Read,
}

impl DeliveryState {
    /// Status glyph shown next to outgoing messages
    pub fn glyph(&self) -> &'static str {
        match self {
            Self::Sent => "✓",
            Self::Delivered => "✓✓",
            Self::Read => "✓✓ read",
        }
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A message row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// Text content, absent for media-only or deleted messages
    #[serde(default)]
    pub content: Option<String>,
    /// Attachment URL
    #[serde(default)]
    pub media_url: Option<String>,
    /// Attachment kind
    #[serde(default)]
    pub media_type: Option<MediaKind>,
    /// Stored by the backend
    #[serde(default)]
    pub is_sent: bool,
    /// Seen by the recipient's client
    #[serde(default)]
    pub is_delivered: bool,
    /// Read by the recipient
    #[serde(default)]
    pub is_read: bool,
    /// Deleted for everyone
    #[serde(default)]
    pub is_deleted: bool,
    /// Users who hid this message from their own view
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted_for_user_ids: Vec<String>,
    /// Creation time (backend commit)
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Enforce the soft-delete invariant: a deleted message has no payload.
    pub fn normalize(mut self) -> Self {
        if self.is_deleted {
            self.content = None;
            self.media_url = None;
            self.media_type = None;
        }
        self
    }

    /// Fold a newer row image into this one without regressing any
    /// forward-only state.
    pub fn merge_monotonic(&mut self, incoming: Message) {
        let mut merged = incoming;
        merged.is_sent |= self.is_sent;
        merged.is_delivered |= self.is_delivered;
        merged.is_read |= self.is_read;
        merged.is_deleted |= self.is_deleted;

        for user_id in self.deleted_for_user_ids.drain(..) {
            if !merged.deleted_for_user_ids.contains(&user_id) {
                merged.deleted_for_user_ids.push(user_id);
            }
        }

        *self = merged.normalize();
    }

    /// Whether `viewer_id` may see this message
    pub fn is_visible_to(&self, viewer_id: &str) -> bool {
        !self.deleted_for_user_ids.iter().any(|id| id == viewer_id)
    }

    /// Whether `user_id` wrote this message
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender_id == user_id
    }

    /// Sender-side delivery status
    pub fn delivery_state(&self) -> DeliveryState {
        if self.is_read {
            DeliveryState::Read
        } else if self.is_delivered {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    }

    /// One-line summary for the conversation list
    pub fn preview(&self) -> String {
        if self.is_deleted {
            return DELETED_PREVIEW.to_string();
        }
        match self.media_type {
            Some(kind) => kind.preview_label().to_string(),
            None => self.content.clone().unwrap_or_default(),
        }
    }

    /// Creation time as `HH:MM` in `tz`
    pub fn time_label<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: fmt::Display,
    {
        self.created_at.with_timezone(tz).format("%H:%M").to_string()
    }
}

// ============================================================================
// OUTGOING MESSAGE
// ============================================================================

/// A validated message about to be inserted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Trimmed text, `None` when empty
    pub content: Option<String>,
    /// Optional attachment
    pub attachment: Option<Attachment>,
}

impl OutgoingMessage {
    /// Trim the text and require text or an attachment.
    pub fn compose(text: &str, attachment: Option<Attachment>) -> Result<Self> {
        let trimmed = text.trim();
        let content = (!trimmed.is_empty()).then(|| trimmed.to_string());

        if content.is_none() && attachment.is_none() {
            return Err(Error::EmptyMessage);
        }
        Ok(Self { content, attachment })
    }

    /// Row image for the insert.
    pub fn to_row(&self, conversation_id: &str, sender_id: &str) -> Value {
        json!({
            "conversation_id": conversation_id,
            "sender_id": sender_id,
            "content": self.content,
            "media_url": self.attachment.as_ref().map(|a| a.url.clone()),
            "media_type": self.attachment.as_ref().map(|a| a.kind),
            "is_sent": true,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
