//! # Error Handling
//!
//! Error types shared by every component of the synchronization core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Transport Errors                                                  │
//! │  │   └── Transport             - Backend unreachable or rejected call  │
//! │  │                                                                      │
//! │  ├── Permission Errors                                                 │
//! │  │   ├── PermissionDenied      - Operation disallowed for the actor    │
//! │  │   └── ObjectExists          - Blob key taken, overwrite refused     │
//! │  │                                                                      │
//! │  ├── Validation Errors                                                 │
//! │  │   ├── EmptyMessage          - Neither text nor media                │
//! │  │   ├── NotMessageSender      - Delete-for-everyone by non-sender     │
//! │  │   ├── DeleteWindowExpired   - Delete-for-everyone too late          │
//! │  │   ├── CannotMessageSelf     - Conversation target is the viewer     │
//! │  │   ├── InvalidMedia          - Unknown media kind / bad attachment   │
//! │  │   ├── ProfileUpdateFailed   - Profile field rejected                │
//! │  │   └── InvalidConfig         - Client configuration rejected         │
//! │  │                                                                      │
//! │  ├── Not Found Errors                                                  │
//! │  │   ├── MessageNotFound                                               │
//! │  │   ├── ConversationNotFound                                          │
//! │  │   └── ProfileNotFound                                               │
//! │  │                                                                      │
//! │  ├── Partial Failure                                                   │
//! │  │   └── ParticipantsNotCreated - Conversation row left orphaned       │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      └── Serialization         - Row could not be encoded/decoded      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation
//!
//! Reads degrade to empty results (logged), writes return the error to the
//! caller so it can be shown to the user, and best-effort paths (presence,
//! read receipts) swallow it. [`UserFacingError`] is the flattened form a host
//! UI displays.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the synchronization core
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Transport Errors (100-199)
    // ========================================================================

    /// The backend was unreachable or rejected the call
    #[error("Backend request failed: {0}")]
    Transport(String),

    // ========================================================================
    // Permission Errors (200-299)
    // ========================================================================

    /// The operation is not allowed for the acting user
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A blob already exists under the key and overwriting is disabled
    #[error("An object already exists at {0}")]
    ObjectExists(String),

    // ========================================================================
    // Validation Errors (300-399)
    // ========================================================================

    /// Message has neither text nor media
    #[error("Message is empty.")]
    EmptyMessage,

    /// Only the sender may delete a message for everyone
    #[error("Not your message")]
    NotMessageSender,

    /// The delete-for-everyone window has passed
    #[error("Cannot delete after {minutes} minutes")]
    DeleteWindowExpired {
        /// Length of the window in minutes
        minutes: i64,
    },

    /// A conversation cannot target the viewer themselves
    #[error("Cannot start a conversation with yourself.")]
    CannotMessageSelf,

    /// Attachment metadata is not usable
    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    /// Profile update rejected by validation
    #[error("Failed to update profile: {0}")]
    ProfileUpdateFailed(String),

    /// Client configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Not Found Errors (400-499)
    // ========================================================================

    /// Message row absent
    #[error("Message not found")]
    MessageNotFound,

    /// Conversation row absent
    #[error("Conversation not found.")]
    ConversationNotFound,

    /// Profile row absent
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    // ========================================================================
    // Partial Failures (500-599)
    // ========================================================================

    /// The conversation row exists but its participant rows could not be written.
    ///
    /// No rollback is attempted; the orphan stays invisible to directory
    /// scans because it never matches a participant pair.
    #[error("Conversation {conversation_id} was created but its participants were not: {reason}")]
    ParticipantsNotCreated {
        /// Id of the orphaned conversation row
        conversation_id: String,
        /// Underlying failure
        reason: String,
    },

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// A row could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse error classes used to pick a propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or backend failure
    Transport,
    /// Actor not allowed to perform the operation
    Permission,
    /// Caller-side precondition failed
    Validation,
    /// Referenced row absent
    NotFound,
    /// Everything else
    Internal,
}

impl Error {
    /// Get the numeric error code
    ///
    /// Error codes are organized by category:
    /// - 100-199: Transport
    /// - 200-299: Permission
    /// - 300-399: Validation
    /// - 400-499: Not found
    /// - 500-599: Partial failure
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            // Transport (100-199)
            Error::Transport(_) => 100,

            // Permission (200-299)
            Error::PermissionDenied(_) => 200,
            Error::ObjectExists(_) => 201,

            // Validation (300-399)
            Error::EmptyMessage => 300,
            Error::NotMessageSender => 301,
            Error::DeleteWindowExpired { .. } => 302,
            Error::CannotMessageSelf => 303,
            Error::InvalidMedia(_) => 304,
            Error::ProfileUpdateFailed(_) => 305,
            Error::InvalidConfig(_) => 306,

            // Not found (400-499)
            Error::MessageNotFound => 400,
            Error::ConversationNotFound => 401,
            Error::ProfileNotFound(_) => 402,

            // Partial failure (500-599)
            Error::ParticipantsNotCreated { .. } => 500,

            // Internal (900-999)
            Error::Serialization(_) => 900,
        }
    }

    /// Which class of failure this is
    pub fn category(&self) -> ErrorCategory {
        match self.code() {
            100..=199 | 500..=599 => ErrorCategory::Transport,
            200..=299 => ErrorCategory::Permission,
            300..=399 => ErrorCategory::Validation,
            400..=499 => ErrorCategory::NotFound,
            _ => ErrorCategory::Internal,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by retrying or re-navigating.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::ParticipantsNotCreated { .. })
    }

    /// Whether the message is meant to be shown to the user verbatim
    pub fn is_user_facing(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Internal)
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

// ============================================================================
// USER-FACING REPRESENTATION
// ============================================================================

/// Flattened error a host UI can display or serialize
#[derive(Debug, Clone, Serialize)]
pub struct UserFacingError {
    /// Numeric error code
    pub code: i32,
    /// Error class
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Whether retrying may help
    pub recoverable: bool,
}

impl From<&Error> for UserFacingError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

impl From<Error> for UserFacingError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

// ============================================================================
// TESTS
// ============================================================================
