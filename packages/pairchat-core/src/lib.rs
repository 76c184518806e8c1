//! # Pairchat Core
//!
//! The realtime synchronization core of a one-to-one messaging client. A
//! hosted relational backend with row-change notifications, ephemeral
//! broadcast channels and object storage is the source of truth; this crate
//! keeps each client's local view of it live and consistent.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PAIRCHAT CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   Conversation Directory                         │  │
//! │  │  list · unread · find-or-create · active-conversation session    │  │
//! │  └───────────────┬──────────────────────────────┬───────────────────┘  │
//! │                  │ bind / unbind                │                      │
//! │  ┌───────────────▼──────┐  ┌─────────────────┐  │  ┌────────────────┐  │
//! │  │   Message Stream     │  │ Typing Signaler │  │  │   Presence     │  │
//! │  │ - initial load       │  │ - debounce      │  │  │ - heartbeat    │  │
//! │  │ - live merge         │  │ - idle stop     │  │  │ - visibility   │  │
//! │  │ - mark as read       │  │ - display clear │  │  │ - beacon       │  │
//! │  └───────────┬──────────┘  └────────┬────────┘  │  └───────┬────────┘  │
//! │              │                      │           │          │           │
//! │  ┌───────────▼──────────┐  ┌────────▼────────┐  │          │           │
//! │  │  Message Actions     │  │ Media Pipeline  │  │          │           │
//! │  │ - delete for me      │  │ - upload        │  │          │           │
//! │  │ - delete for all     │  │ - public URL    │  │          │           │
//! │  └───────────┬──────────┘  └────────┬────────┘  │          │           │
//! │              └──────────────────────┴───────────┴──────────┘           │
//! │                                     │                                   │
//! │  ┌──────────────────────────────────▼──────────────────────────────┐   │
//! │  │  Backend: RowStore · ChangeFeed · Broadcast · BlobStore · Beacon│   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Client configuration
//! - [`time`] - Injected wall clock
//! - [`backend`] - Collaborator contracts and the in-process backend
//! - [`profiles`] - User profiles and the authenticated viewer
//! - [`media`] - Attachment uploads
//! - [`presence`] - Own online status and watching others
//! - [`typing`] - Typing indicators
//! - [`messaging`] - Message model, live stream and lifecycle actions
//! - [`conversations`] - Conversation list and the active conversation
//!
//! ## Consistency Model
//!
//! The backend is authoritative. Every local view is rebuilt from a load
//! plus a change-feed subscription opened before the load. Sends are not
//! echoed locally; a message appears once the backend reports it.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod backend;
pub mod config;
pub mod conversations;
pub mod error;
pub mod media;
pub mod messaging;
pub mod presence;
pub mod profiles;
/// Injected wall clock for timestamps and time windows.
pub mod time;
pub mod typing;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use backend::{Backend, MemoryBackend};
pub use config::ClientConfig;
pub use conversations::{ConversationDirectory, ConversationSession, ConversationSummary, SessionState};
pub use error::{Error, Result};
pub use media::MediaPipeline;
pub use messaging::{Attachment, MediaKind, Message, MessageActions, MessageStream, StreamSignal};
pub use presence::{PresenceTracker, StatusBoard, StatusWatcher, UserStatus, Visibility};
pub use profiles::{Profile, ProfileService, ProfileUpdate, Viewer};
pub use time::{Clock, ManualClock, SharedClock, SystemClock};
pub use typing::TypingSignaler;

// ============================================================================
// CLIENT
// ============================================================================

use bytes::Bytes;

/// Every component of one signed-in client, wired to a shared backend
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                       CHAT CLIENT LIFECYCLE                             │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. start()                                                            │
/// │     ├──► validate config                                               │
/// │     ├──► presence: upsert online, start heartbeat                      │
/// │     ├──► status board: load + subscribe                                │
/// │     └──► directory: subscribe, load conversations and users            │
/// │                                                                         │
/// │  2. Active                                                             │
/// │     ├──► open / open_with  (binds stream + typing)                     │
/// │     ├──► send / send_attachment / keystroke                            │
/// │     └──► delete_for_me / delete_for_everyone                           │
/// │                                                                         │
/// │  3. shutdown()                                                         │
/// │     ├──► directory: unbind session, drop subscriptions                 │
/// │     ├──► status board: unsubscribe                                     │
/// │     └──► presence: stop heartbeat, beacon offline                      │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct ChatClient {
    viewer: Viewer,
    config: ClientConfig,
    profiles: ProfileService,
    actions: MessageActions,
    media: MediaPipeline,
    presence: PresenceTracker,
    statuses: StatusBoard,
    directory: ConversationDirectory,
}

impl ChatClient {
    /// Bring every component up for `viewer`.
    ///
    /// ## Example
    ///
    /// ```ignore
    /// use std::sync::Arc;
    /// use pairchat_core::{Backend, ChatClient, ClientConfig, MemoryBackend, Viewer, time::system_clock};
    ///
    /// let backend = Backend::from_shared(Arc::new(MemoryBackend::default()));
    /// let client = ChatClient::start(backend, Viewer::new("u1", "Ada"), ClientConfig::default(), system_clock()).await?;
    /// ```
    pub async fn start(backend: Backend, viewer: Viewer, config: ClientConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        tracing::info!(user_id = %viewer.id, "Starting Pairchat Core v{}", version());

        let profiles = ProfileService::new(backend.clone());
        let actions = MessageActions::new(backend.clone(), clock.clone(), &config);
        let media = MediaPipeline::new(backend.blobs.clone(), clock.clone(), &config);

        let presence = PresenceTracker::start(backend.clone(), &viewer.id, clock, &config).await;
        let statuses = StatusBoard::watch_all(backend.clone()).await?;

        let session = ConversationSession::new(backend.clone(), viewer.clone(), config.clone(), actions.clone());
        let directory = match ConversationDirectory::start(backend, viewer.clone(), profiles.clone(), session).await {
            Ok(directory) => directory,
            Err(e) => {
                statuses.close().await;
                presence.shutdown();
                return Err(e);
            }
        };

        tracing::info!(user_id = %viewer.id, "Client ready");
        Ok(Self {
            viewer,
            config,
            profiles,
            actions,
            media,
            presence,
            statuses,
            directory,
        })
    }

    /// The signed-in user
    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    /// Configuration in effect
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Profile reads and edits
    pub fn profiles(&self) -> &ProfileService {
        &self.profiles
    }

    /// Delete and read-state operations
    pub fn actions(&self) -> &MessageActions {
        &self.actions
    }

    /// Attachment uploads
    pub fn media(&self) -> &MediaPipeline {
        &self.media
    }

    /// Own presence
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Everyone's presence
    pub fn statuses(&self) -> &StatusBoard {
        &self.statuses
    }

    /// Conversation list and active conversation
    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    /// Send text into the active conversation. `Ok(false)` if nothing was sent.
    pub async fn send(&self, text: &str) -> Result<bool> {
        self.directory.session().send(text, None).await
    }

    /// Upload a file, then send it with an optional caption.
    ///
    /// Nothing is uploaded while no conversation is active. The message
    /// is only inserted after the upload succeeded.
    pub async fn send_attachment(
        &self,
        bytes: Bytes,
        file_name: &str,
        kind: MediaKind,
        caption: &str,
    ) -> Result<bool> {
        if self.directory.session().current().is_none() {
            return Ok(false);
        }
        let attachment = self
            .media
            .upload_attachment(bytes, &self.viewer.id, file_name, kind)
            .await?;
        self.directory.session().send(caption, Some(attachment)).await
    }

    /// Forward a keystroke in the composer.
    pub async fn keystroke(&self) {
        self.directory.session().keystroke().await;
    }

    /// Hide a message from the viewer only.
    pub async fn delete_for_me(&self, message_id: &str) -> Result<()> {
        self.actions.delete_for_me(message_id, &self.viewer.id).await
    }

    /// Retract one of the viewer's messages for both participants.
    pub async fn delete_for_everyone(&self, message_id: &str) -> Result<()> {
        self.actions.delete_for_everyone(message_id, &self.viewer.id).await
    }

    /// Tear everything down and mark the viewer offline.
    pub async fn shutdown(&self) {
        tracing::info!(user_id = %self.viewer.id, "Shutting down client");
        self.directory.close().await;
        self.statuses.close().await;
        self.presence.shutdown();
        tracing::info!(user_id = %self.viewer.id, "Client shutdown complete");
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("viewer", &self.viewer)
            .field("presence", &self.presence)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Pairchat Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::OS,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Build information for debugging
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version
    pub version: &'static str,
    /// Target operating system
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================
