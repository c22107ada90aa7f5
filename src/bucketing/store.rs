//! A thread-safe in-memory storage for the currently active bucketing file. [`ManifestStore`]
//! provides concurrent access for readers (local decisions) and the writer (the poller).
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{bucketing::BucketingFile, Result};

/// A bucketing file together with the validator it was served with. Both are always replaced
/// together.
#[derive(Debug, Clone)]
pub struct CachedManifest {
    pub file: BucketingFile,
    /// `Last-Modified` header of the response, sent back as `If-Modified-Since`.
    pub last_modified: Option<String>,
    pub fetched_at: DateTime<Utc>,
    raw: serde_json::Value,
}

/// On-disk representation used by the bucketing cache.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedManifest {
    last_modified: Option<String>,
    content: serde_json::Value,
}

impl CachedManifest {
    pub fn from_json(raw: serde_json::Value, last_modified: Option<String>) -> Result<CachedManifest> {
        let file = BucketingFile::deserialize(&raw)?;
        Ok(CachedManifest {
            file,
            last_modified,
            fetched_at: Utc::now(),
            raw,
        })
    }

    pub(crate) fn to_persisted(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&PersistedManifest {
            last_modified: self.last_modified.clone(),
            content: self.raw.clone(),
        })?)
    }

    pub(crate) fn from_persisted(data: &[u8]) -> Result<CachedManifest> {
        let persisted: PersistedManifest = serde_json::from_slice(data)?;
        CachedManifest::from_json(persisted.content, persisted.last_modified)
    }
}

/// `ManifestStore` provides a thread-safe (`Sync`) storage for the bucketing file.
///
/// The manifest itself is always immutable and can only be replaced completely, so readers see
/// either the old or the new version, never a mix.
#[derive(Default)]
pub struct ManifestStore {
    manifest: RwLock<Option<Arc<CachedManifest>>>,
}

impl ManifestStore {
    pub fn new() -> Self {
        ManifestStore::default()
    }

    /// Get the active manifest. Returns `None` if none has been fetched or restored yet.
    pub fn get_manifest(&self) -> Option<Arc<CachedManifest>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the
        // lock). The slot only ever holds a complete value, so reading through the poison is safe.
        let manifest = self
            .manifest
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        manifest.clone()
    }

    /// Set new manifest, returning the previous one.
    pub fn set_manifest(&self, manifest: Arc<CachedManifest>) -> Option<Arc<CachedManifest>> {
        let mut slot = self
            .manifest
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        slot.replace(manifest)
    }

    pub fn last_modified(&self) -> Option<String> {
        self.get_manifest()?.last_modified.clone()
    }
}
