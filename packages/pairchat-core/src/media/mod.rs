//! # Media Pipeline
//!
//! Uploads attachments to blob storage and hands back addressable URLs.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        MEDIA UPLOAD                                     │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  upload(bytes, owner_id, extension)                                    │
//! │     │                                                                   │
//! │     ├── key = "{owner_id}/{millis}.{extension}"                        │
//! │     │         millis strictly increasing per pipeline                   │
//! │     │                                                                   │
//! │     ├── put(bucket, key, bytes, { cache: 3600s, upsert: false })       │
//! │     │         rejected → error, no URL                                  │
//! │     │                                                                   │
//! │     └── public_url(bucket, key) → URL for the message row              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed upload yields no URL, so no message can reference an object
//! that was never stored.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::backend::{BlobStore, PutOptions};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::messaging::{Attachment, MediaKind};
use crate::time::SharedClock;

/// Uploads attachments and derives their public URLs
pub struct MediaPipeline {
    blobs: Arc<dyn BlobStore>,
    clock: SharedClock,
    bucket: String,
    cache_control_secs: u32,
    last_stamp: AtomicI64,
}

impl MediaPipeline {
    /// Create a pipeline writing into the configured bucket.
    pub fn new(blobs: Arc<dyn BlobStore>, clock: SharedClock, config: &ClientConfig) -> Self {
        Self {
            blobs,
            clock,
            bucket: config.media_bucket.clone(),
            cache_control_secs: config.media_cache_control_secs,
            last_stamp: AtomicI64::new(i64::MIN),
        }
    }

    /// Bucket attachments are written to
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Store `bytes` under the owner's namespace and return the public URL.
    pub async fn upload(&self, bytes: Bytes, owner_id: &str, extension: &str) -> Result<String> {
        let extension = normalize_extension(extension)?;
        if owner_id.is_empty() || owner_id.contains('/') {
            return Err(Error::InvalidMedia(format!("invalid owner id '{}'", owner_id)));
        }

        let key = format!("{}/{}.{}", owner_id, self.next_stamp(), extension);
        let options = PutOptions {
            cache_control_secs: self.cache_control_secs,
            upsert: false,
            content_type: content_type_for(&extension).map(str::to_string),
        };
        let size = bytes.len();

        self.blobs
            .put(&self.bucket, &key, bytes, options)
            .await
            .map_err(|e| {
                tracing::error!(owner_id = %owner_id, key = %key, error = %e, "Media upload failed");
                e
            })?;

        tracing::info!(owner_id = %owner_id, key = %key, size, "Media uploaded");
        Ok(self.public_url(&key))
    }

    /// Upload a picked file as an attachment of `kind`.
    ///
    /// The extension comes from `file_name`, falling back to the kind's
    /// default when the name has none.
    pub async fn upload_attachment(
        &self,
        bytes: Bytes,
        owner_id: &str,
        file_name: &str,
        kind: MediaKind,
    ) -> Result<Attachment> {
        let extension = extension_for(file_name, kind);
        let url = self.upload(bytes, owner_id, &extension).await?;
        Ok(Attachment { url, kind })
    }

    /// Public URL of an object in the media bucket. No network involved.
    pub fn public_url(&self, path: &str) -> String {
        self.blobs.public_url(&self.bucket, path)
    }

    /// Milliseconds since the epoch, bumped so consecutive keys never collide.
    fn next_stamp(&self) -> i64 {
        let now = self.clock.now_millis();
        let mut last = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .last_stamp
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

impl std::fmt::Debug for MediaPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPipeline")
            .field("bucket", &self.bucket)
            .field("cache_control_secs", &self.cache_control_secs)
            .finish_non_exhaustive()
    }
}

/// Extension of `file_name`, or the kind's default when it has none.
pub fn extension_for(file_name: &str, kind: MediaKind) -> String {
    file_name
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.trim()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_else(|| kind.default_extension().to_string())
}

fn normalize_extension(extension: &str) -> Result<String> {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidMedia(format!("invalid extension '{}'", extension)));
    }
    Ok(ext)
}

/// MIME type for the extensions the client produces.
pub fn content_type_for(extension: &str) -> Option<&'static str> {
    match extension {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "webm" => Some("audio/webm"),
        "ogg" => Some("audio/ogg"),
        "m4a" => Some("audio/mp4"),
        _ => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
