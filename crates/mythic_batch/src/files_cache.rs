//! Cache of staged reference uploads, keyed by content hash.

use chrono::{DateTime, Duration, Utc};
use mythic_error::MythicResult;
use mythic_storage::{read_json, write_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CACHE_FILE: &str = "files-cache.json";

/// Entries expiring sooner than this are treated as already gone.
const EXPIRATION_MARGIN_MINUTES: i64 = 60;

/// One staged upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_getters::Getters)]
pub struct FilesCacheEntry {
    /// Local file the bytes came from
    local_path: PathBuf,
    /// Remote URI
    uri: String,
    /// Content hash
    sha256: String,
    /// MIME type
    mime: String,
    /// When the remote copy expires, if ever
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl FilesCacheEntry {
    /// Create an entry.
    pub fn new(
        local_path: impl Into<PathBuf>,
        uri: impl Into<String>,
        sha256: impl Into<String>,
        mime: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            uri: uri.into(),
            sha256: sha256.into(),
            mime: mime.into(),
            expires_at,
        }
    }

    /// Whether the entry can still be used at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at - now > Duration::minutes(EXPIRATION_MARGIN_MINUTES),
        }
    }
}

/// The `files-cache.json` document in the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesCache {
    #[serde(default)]
    entries: BTreeMap<String, FilesCacheEntry>,
    updated_at: DateTime<Utc>,
}

impl Default for FilesCache {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl FilesCache {
    fn path(artifact_dir: &Path) -> PathBuf {
        artifact_dir.join(CACHE_FILE)
    }

    /// Load the cache. A missing or corrupt file yields an empty cache.
    pub async fn load(artifact_dir: &Path) -> Self {
        match read_json(&Self::path(artifact_dir)).await {
            Ok(Some(cache)) => cache,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable files cache");
                Self::default()
            }
        }
    }

    /// Persist the cache atomically.
    pub async fn save(&mut self, artifact_dir: &Path) -> MythicResult<()> {
        self.updated_at = Utc::now();
        write_json(&Self::path(artifact_dir), self).await?;
        debug!(entries = self.entries.len(), "Saved files cache");
        Ok(())
    }

    /// A usable entry for `sha256`.
    pub fn get_valid(&self, sha256: &str) -> Option<&FilesCacheEntry> {
        let now = Utc::now();
        self.entries.get(sha256).filter(|e| e.is_valid_at(now))
    }

    /// Record an upload, replacing any previous entry for the same hash.
    pub fn insert(&mut self, entry: FilesCacheEntry) {
        self.entries.insert(entry.sha256.clone(), entry);
    }

    /// Drop an entry.
    pub fn remove(&mut self, sha256: &str) -> Option<FilesCacheEntry> {
        self.entries.remove(sha256)
    }

    /// Drop every entry that is no longer usable. Returns how many were removed.
    pub fn clean_expired(&mut self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_valid_at(now));
        before - self.entries.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
