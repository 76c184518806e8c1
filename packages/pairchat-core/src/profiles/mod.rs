//! # Profiles
//!
//! Identity-bearing user records and the viewer supplied by the auth layer.
//!
//! ## Profile Data
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          USER PROFILE                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  id: String                stable identifier issued by auth            │
//! │  full_name: String         1-64 characters, shown everywhere           │
//! │  avatar_url: Option        public URL of an uploaded picture           │
//! │  status_message: Option    0-256 characters                            │
//! │  created_at: DateTime      set by the store on insert                  │
//! │                                                                         │
//! │  Profiles are read broadly and written only by their owner through     │
//! │  ProfileService::update. Every write fans out as a change event that   │
//! │  makes directories refresh their user list.                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::{decode_row, decode_rows, Backend, Direction, Filter, Select, Table};
use crate::error::{Error, Result};

/// Maximum length for a full name
pub const MAX_FULL_NAME_LENGTH: usize = 64;

/// Maximum length for a status message
pub const MAX_STATUS_LENGTH: usize = 256;

/// A user profile row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    /// Stable user id
    pub id: String,
    /// Human-readable name
    pub full_name: String,
    /// Optional avatar URL
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Optional status text
    #[serde(default)]
    pub status_message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Up to two uppercase initials taken from the first words of the name.
    pub fn initials(&self) -> String {
        self.full_name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .take(2)
            .flat_map(char::to_uppercase)
            .collect()
    }

    /// Case-insensitive substring match on the name.
    pub fn name_matches(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        query.is_empty() || self.full_name.to_lowercase().contains(&query)
    }
}

/// The authenticated actor on whose behalf a client runs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewer {
    /// User id
    pub id: String,
    /// Name broadcast with typing signals
    pub display_name: String,
}

impl Viewer {
    /// Create a viewer.
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// A partial update to the viewer's own profile
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProfileUpdate {
    /// Change the full name
    FullName(String),
    /// Set or clear the status message
    StatusMessage(Option<String>),
    /// Set or clear the avatar URL
    AvatarUrl(Option<String>),
}

impl ProfileUpdate {
    /// Check field limits before anything is written.
    pub fn validate(&self) -> Result<()> {
        match self {
            ProfileUpdate::FullName(name) => {
                if name.trim().is_empty() {
                    return Err(Error::ProfileUpdateFailed("Name cannot be empty".into()));
                }
                if name.chars().count() > MAX_FULL_NAME_LENGTH {
                    return Err(Error::ProfileUpdateFailed(format!(
                        "Name too long: max {} characters",
                        MAX_FULL_NAME_LENGTH
                    )));
                }
            }
            ProfileUpdate::StatusMessage(Some(status)) => {
                if status.chars().count() > MAX_STATUS_LENGTH {
                    return Err(Error::ProfileUpdateFailed(format!(
                        "Status too long: max {} characters",
                        MAX_STATUS_LENGTH
                    )));
                }
            }
            ProfileUpdate::StatusMessage(None) | ProfileUpdate::AvatarUrl(_) => {}
        }
        Ok(())
    }

    fn patch(&self) -> serde_json::Value {
        match self {
            ProfileUpdate::FullName(name) => json!({ "full_name": name.trim() }),
            ProfileUpdate::StatusMessage(status) => json!({ "status_message": status }),
            ProfileUpdate::AvatarUrl(url) => json!({ "avatar_url": url }),
        }
    }
}

// ============================================================================
// PROFILE SERVICE
// ============================================================================

/// Reads and writes profile rows
#[derive(Debug, Clone)]
pub struct ProfileService {
    backend: Backend,
}

impl ProfileService {
    /// Create a service over the shared backend handle.
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    /// Fetch one profile.
    pub async fn fetch(&self, user_id: &str) -> Result<Profile> {
        let rows = self
            .backend
            .rows
            .select(&Select::from(Table::Profiles).eq("id", user_id).limit(1))
            .await?;

        match rows.into_iter().next() {
            Some(row) => decode_row(row),
            None => Err(Error::ProfileNotFound(user_id.to_string())),
        }
    }

    /// Every profile except the viewer's, ordered by name.
    pub async fn list_others(&self, viewer_id: &str) -> Result<Vec<Profile>> {
        let rows = self
            .backend
            .rows
            .select(
                &Select::from(Table::Profiles)
                    .neq("id", viewer_id)
                    .order_by("full_name", Direction::Ascending),
            )
            .await?;
        decode_rows(rows)
    }

    /// Apply an update to the viewer's own profile and return the new row.
    pub async fn update(&self, viewer: &Viewer, update: ProfileUpdate) -> Result<Profile> {
        update.validate()?;

        let changed = self
            .backend
            .rows
            .update(Table::Profiles, &[Filter::eq("id", viewer.id.as_str())], update.patch())
            .await
            .map_err(|e| {
                tracing::error!(user_id = %viewer.id, error = %e, "Profile update failed");
                e
            })?;

        if changed == 0 {
            return Err(Error::ProfileNotFound(viewer.id.clone()));
        }

        tracing::info!(user_id = %viewer.id, "Profile updated");
        self.fetch(&viewer.id).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Arc;

    async fn seeded() -> (Arc<MemoryBackend>, ProfileService) {
        let memory = Arc::new(MemoryBackend::default());
        let backend = Backend::from_shared(memory.clone());
        backend
            .rows
            .insert(
                Table::Profiles,
                vec![
                    json!({"id": "alice", "full_name": "Alice Liddell"}),
                    json!({"id": "bob", "full_name": "Bob Stone"}),
                    json!({"id": "carol", "full_name": "Carol"}),
                ],
            )
            .await
            .unwrap();
        (memory, ProfileService::new(backend))
    }

    #[test]
    fn test_initials() {
        let profile = Profile {
            id: "a".into(),
            full_name: "ada  lovelace byron".into(),
            avatar_url: None,
            status_message: None,
            created_at: Utc::now(),
        };
        assert_eq!(profile.initials(), "AL");
    }

    #[test]
    fn test_update_validation() {
        assert!(ProfileUpdate::FullName("  ".into()).validate().is_err());
        assert!(ProfileUpdate::FullName("a".repeat(65)).validate().is_err());
        assert!(ProfileUpdate::StatusMessage(Some("x".repeat(257))).validate().is_err());
        assert!(ProfileUpdate::StatusMessage(None).validate().is_ok());
        assert!(ProfileUpdate::AvatarUrl(Some("https://x/a.png".into())).validate().is_ok());
    }

    #[tokio::test]
    async fn test_list_others_excludes_viewer_sorted() {
        let (_, service) = seeded().await;
        let names: Vec<_> = service
            .list_others("bob")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.full_name)
            .collect();
        assert_eq!(names, ["Alice Liddell", "Carol"]);
    }

    #[tokio::test]
    async fn test_fetch_missing_profile() {
        let (_, service) = seeded().await;
        let err = service.fetch("nobody").await.unwrap_err();
        assert_eq!(err, Error::ProfileNotFound("nobody".into()));
    }

    #[tokio::test]
    async fn test_update_writes_row() {
        let (memory, service) = seeded().await;
        let viewer = Viewer::new("carol", "Carol");

        let updated = service
            .update(&viewer, ProfileUpdate::StatusMessage(Some("Away".into())))
            .await
            .unwrap();
        assert_eq!(updated.status_message.as_deref(), Some("Away"));

        let rejected = service
            .update(&viewer, ProfileUpdate::FullName(String::new()))
            .await;
        assert!(matches!(rejected, Err(Error::ProfileUpdateFailed(_))));
        let row = memory
            .rows(Table::Profiles)
            .into_iter()
            .find(|r| r["id"] == "carol")
            .unwrap();
        assert_eq!(row["full_name"], "Carol");
    }
}
