//! Persistence collaborators.
//!
//! The SDK never persists anything itself: visitors, hits and bucketing files are handed to the
//! host through [`VisitorCache`], [`HitCache`] and [`BucketingCache`]. Payloads are plain JSON so
//! implementations do not depend on SDK types. A failing or slow cache never fails an SDK
//! operation: lookups are bounded by the configured lookup timeout and treated as a miss on
//! error.
use std::{collections::HashMap, future::Future, path::PathBuf, time::Duration};

use async_trait::async_trait;

use crate::{Error, Result};

/// Stores visitor data (assignments history, last campaigns, consent) between sessions.
#[async_trait]
pub trait VisitorCache: Send + Sync {
    async fn cache_visitor(&self, visitor_id: &str, data: serde_json::Value) -> Result<()>;
    async fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<serde_json::Value>>;
    async fn flush_visitor(&self, visitor_id: &str) -> Result<()>;
}

/// Stores hits that were not confirmed delivered, keyed by hit id.
#[async_trait]
pub trait HitCache: Send + Sync {
    async fn cache_hits(&self, hits: HashMap<String, serde_json::Value>) -> Result<()>;
    async fn lookup_hits(&self) -> Result<HashMap<String, serde_json::Value>>;
    async fn flush_hits(&self, hit_ids: &[String]) -> Result<()>;
    async fn flush_all_hits(&self) -> Result<()>;
}

/// Stores the last bucketing file and its validator.
#[async_trait]
pub trait BucketingCache: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()>;
}

/// Cache that stores nothing. Used when the host does not provide one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

#[async_trait]
impl VisitorCache for NoopCache {
    async fn cache_visitor(&self, _visitor_id: &str, _data: serde_json::Value) -> Result<()> {
        Ok(())
    }
    async fn lookup_visitor(&self, _visitor_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
    async fn flush_visitor(&self, _visitor_id: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl HitCache for NoopCache {
    async fn cache_hits(&self, _hits: HashMap<String, serde_json::Value>) -> Result<()> {
        Ok(())
    }
    async fn lookup_hits(&self) -> Result<HashMap<String, serde_json::Value>> {
        Ok(HashMap::new())
    }
    async fn flush_hits(&self, _hit_ids: &[String]) -> Result<()> {
        Ok(())
    }
    async fn flush_all_hits(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BucketingCache for NoopCache {
    async fn load(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn store(&self, _key: &str, _data: Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// [`BucketingCache`] keeping one `<key>.json` file per environment in a directory.
#[derive(Debug, Clone)]
pub struct FileBucketingCache {
    directory: PathBuf,
}

impl FileBucketingCache {
    pub fn new(directory: impl Into<PathBuf>) -> FileBucketingCache {
        FileBucketingCache {
            directory: directory.into(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

#[async_trait]
impl BucketingCache for FileBucketingCache {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory).await?;
        // Write then rename so a crash never leaves a truncated file behind.
        let tmp = self.directory.join(format!("{key}.json.tmp"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, self.path(key)).await?;
        Ok(())
    }
}

/// Run a cache lookup bounded by `timeout`. Timeouts and errors are logged and resolve to an
/// empty value.
pub(crate) async fn bounded_lookup<T: Default>(
    timeout: Duration,
    operation: &'static str,
    lookup: impl Future<Output = Result<T>>,
) -> T {
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            log::warn!(target: "flagship", operation; "cache lookup failed: {:?}", err);
            T::default()
        }
        Err(_) => {
            log::warn!(target: "flagship",
                       operation,
                       timeout_ms = timeout.as_millis() as u64;
                       "cache lookup timed out");
            T::default()
        }
    }
}

/// Log a failed cache write. Cache failures never propagate to callers.
pub(crate) fn log_cache_error(operation: &'static str, result: Result<()>) {
    if let Err(err) = result {
        log::warn!(target: "flagship", operation; "cache operation failed: {:?}", err);
    }
}

#[cfg(test)]
impl Error {
    pub(crate) fn cache(message: impl Into<String>) -> Error {
        Error::Cache(message.into())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{bounded_lookup, BucketingCache, FileBucketingCache};
    use crate::{Error, Result};

    #[tokio::test]
    async fn file_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileBucketingCache::new(dir.path().join("nested"));

        assert_eq!(cache.load("bucketing_env").await.unwrap(), None);
        cache
            .store("bucketing_env", b"{\"a\":1}".to_vec())
            .await
            .unwrap();
        assert_eq!(
            cache.load("bucketing_env").await.unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
    }

    #[tokio::test]
    async fn lookup_errors_are_misses() {
        let value: Option<u32> = bounded_lookup(Duration::from_millis(50), "test", async {
            Err::<Option<u32>, _>(Error::cache("broken"))
        })
        .await;
        assert_eq!(value, None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_lookups_are_misses() {
        let value: Vec<u8> = bounded_lookup(Duration::from_millis(200), "test", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Result::Ok(vec![1])
        })
        .await;
        assert!(value.is_empty());
    }
}
