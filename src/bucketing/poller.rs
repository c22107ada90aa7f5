//! A background poller task that periodically requests the bucketing file and stores it in a
//! manifest store.
use std::{sync::Arc, time::Duration};

use tokio::sync::{watch, Notify};

use crate::{
    bucketing::{
        fetcher::{FetchOutcome, ManifestFetcher},
        store::{CachedManifest, ManifestStore},
    },
    cache::{bounded_lookup, log_cache_error, BucketingCache},
    status::StatusHandle,
    tracking::troubleshooting::{TroubleshootingLabel, TroubleshootingReporter},
    Error, Result,
};

/// Everything the poller task owns or shares.
pub(crate) struct ManifestPollerConfig {
    pub fetcher: ManifestFetcher,
    pub store: Arc<ManifestStore>,
    pub cache: Arc<dyn BucketingCache>,
    /// Per-environment key under which the manifest is persisted.
    pub cache_key: String,
    pub lookup_timeout: Duration,
    pub interval: Duration,
    pub status: StatusHandle,
    pub troubleshooting: Arc<TroubleshootingReporter>,
}

/// A bucketing file poller.
///
/// The poller restores the last persisted bucketing file, then polls the CDN every interval,
/// storing new versions in the [`ManifestStore`] and persisting them through the
/// [`BucketingCache`].
pub struct ManifestPoller {
    join_handle: tokio::task::JoinHandle<()>,

    /// Used to send a stop command to the poller task.
    stop: Arc<Notify>,

    /// Holds `None` if no bucketing file is available yet. Holds `Some(Ok(()))` once one has been
    /// restored or fetched. Holds `Some(Err(...))` if polling stopped on an unrecoverable error.
    result: watch::Receiver<Option<Result<()>>>,
}

impl ManifestPoller {
    /// Spawn the poller task on the current tokio runtime.
    pub(crate) fn start(mut config: ManifestPollerConfig) -> ManifestPoller {
        let stop = Arc::new(Notify::new());
        let (result_sender, result) = watch::channel(None);

        let join_handle = {
            let stop = Arc::clone(&stop);
            let update_result = move |value: Result<()>| {
                result_sender.send_replace(Some(value));
            };

            tokio::spawn(async move {
                if config.store.get_manifest().is_none() && config.restore().await {
                    update_result(Ok(()));
                }

                loop {
                    let last_modified = config.store.last_modified();
                    match config.fetcher.fetch(last_modified.as_deref()).await {
                        Ok(FetchOutcome::Modified(manifest)) => {
                            config.apply(manifest).await;
                            update_result(Ok(()));
                        }
                        Ok(FetchOutcome::NotModified) => update_result(Ok(())),
                        Err(err) if err.is_unrecoverable() => {
                            // Nothing will change by polling again.
                            update_result(Err(err));
                            return;
                        }
                        Err(err) => {
                            log::warn!(target: "flagship", "error while polling the bucketing file: {:?}", err);
                            config.troubleshooting.report_sdk(
                                TroubleshootingLabel::SdkBucketingFileError,
                                [("error".to_owned(), err.to_string())],
                            );
                        }
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(config.interval) => {
                            // Timed out. Loop back to poll again.
                        }
                        _ = stop.notified() => {
                            log::debug!(target: "flagship", "bucketing poller received stop command");
                            return;
                        }
                    }
                }
            })
        };

        ManifestPoller {
            join_handle,
            stop,
            result,
        }
    }

    /// Waits until a bucketing file is available.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] or [`Error::InvalidBaseUrl`] if polling stopped for good.
    /// - [`Error::TaskPanicked`] if the poller task ended before any bucketing file was
    ///   available.
    pub async fn wait_for_configuration(&self) -> Result<()> {
        ManifestPoller::wait_for_result(self.result.clone()).await
    }

    pub(crate) fn result_receiver(&self) -> watch::Receiver<Option<Result<()>>> {
        self.result.clone()
    }

    pub(crate) async fn wait_for_result(
        mut result: watch::Receiver<Option<Result<()>>>,
    ) -> Result<()> {
        loop {
            if let Some(result) = result.borrow_and_update().clone() {
                return result;
            }
            result.changed().await.map_err(|_| Error::TaskPanicked)?;
        }
    }

    /// Stop the poller task. This function does not wait for the task to actually stop.
    pub fn stop(&self) {
        // `notify_one` stores a permit, so the task stops even if it's in the middle of a fetch.
        self.stop.notify_one();
    }

    /// Stop the poller task and wait for it to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join_handle.await?;
        Ok(())
    }
}

impl ManifestPollerConfig {
    /// Restore the persisted bucketing file. Returns `true` if one was restored.
    async fn restore(&self) -> bool {
        let data = bounded_lookup(
            self.lookup_timeout,
            "load_bucketing",
            self.cache.load(&self.cache_key),
        )
        .await;
        let Some(data) = data else {
            return false;
        };

        match CachedManifest::from_persisted(&data) {
            Ok(manifest) => {
                log::debug!(target: "flagship", "restored bucketing file from cache");
                self.publish(manifest);
                true
            }
            Err(err) => {
                log::warn!(target: "flagship", "ignoring malformed cached bucketing file: {:?}", err);
                false
            }
        }
    }

    async fn apply(&self, manifest: CachedManifest) {
        match manifest.to_persisted() {
            Ok(data) => log_cache_error(
                "store_bucketing",
                self.cache.store(&self.cache_key, data).await,
            ),
            Err(err) => log::warn!(target: "flagship", "failed to serialize bucketing file: {:?}", err),
        }

        self.troubleshooting.report_sdk(
            TroubleshootingLabel::SdkBucketingFile,
            [(
                "bucketing.lastModified".to_owned(),
                manifest.last_modified.clone().unwrap_or_default(),
            )],
        );
        self.publish(manifest);
    }

    fn publish(&self, manifest: CachedManifest) {
        self.troubleshooting
            .set_account_settings(manifest.file.account_settings());
        let panic = manifest.file.panic;
        self.store.set_manifest(Arc::new(manifest));
        self.status.apply_panic(panic);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use reqwest::{
        header::{HeaderValue, LAST_MODIFIED},
        StatusCode,
    };
    use serde_json::json;

    use super::{ManifestPoller, ManifestPollerConfig};
    use crate::{
        bucketing::{fetcher::ManifestFetcher, store::ManifestStore},
        cache::BucketingCache,
        http::HttpResponse,
        status::{SdkStatus, StatusHandle},
        test_utils::{test_troubleshooting, MemoryCache, MockHttpClient},
        Error,
    };

    fn config(
        http: Arc<MockHttpClient>,
        store: Arc<ManifestStore>,
        cache: Arc<MemoryCache>,
        status: StatusHandle,
    ) -> ManifestPollerConfig {
        ManifestPollerConfig {
            fetcher: ManifestFetcher::new(
                http.clone(),
                "https://cdn.flagship.io",
                "env",
                "key",
                Duration::from_secs(2),
            )
            .unwrap(),
            store,
            cache,
            cache_key: "bucketing_env".to_owned(),
            lookup_timeout: Duration::from_millis(200),
            interval: Duration::from_secs(60),
            status,
            troubleshooting: test_troubleshooting(http),
        }
    }

    fn ok_response(body: serde_json::Value, last_modified: &'static str) -> HttpResponse {
        let mut response = HttpResponse::new(StatusCode::OK, body.to_string());
        response
            .headers
            .insert(LAST_MODIFIED, HeaderValue::from_static(last_modified));
        response
    }

    #[tokio::test]
    async fn fetches_stores_and_persists() {
        let http = MockHttpClient::new(|_| Ok(ok_response(json!({"campaigns": []}), "v1")));
        let store = Arc::new(ManifestStore::new());
        let cache = Arc::new(MemoryCache::default());
        let status = StatusHandle::new(SdkStatus::Initializing);

        let poller =
            ManifestPoller::start(config(http, store.clone(), cache.clone(), status.clone()));
        poller.wait_for_configuration().await.unwrap();

        assert_eq!(store.last_modified().as_deref(), Some("v1"));
        assert_eq!(status.get(), SdkStatus::Initialized);
        assert!(cache.load("bucketing_env").await.unwrap().is_some());

        poller.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn not_modified_keeps_manifest_and_validator() {
        let served = Arc::new(AtomicBool::new(false));
        let http = {
            let served = served.clone();
            MockHttpClient::new(move |_| {
                if served.swap(true, Ordering::SeqCst) {
                    Ok(HttpResponse::new(StatusCode::NOT_MODIFIED, ""))
                } else {
                    Ok(ok_response(json!({"campaigns": [{"id": "c", "variationGroups": []}]}), "v1"))
                }
            })
        };
        let store = Arc::new(ManifestStore::new());
        let status = StatusHandle::new(SdkStatus::Initializing);

        let poller = ManifestPoller::start(config(
            http.clone(),
            store.clone(),
            Arc::new(MemoryCache::default()),
            status,
        ));
        poller.wait_for_configuration().await.unwrap();
        let first = store.get_manifest().unwrap();

        // Let a few poll intervals elapse.
        tokio::time::sleep(Duration::from_secs(185)).await;

        let current = store.get_manifest().unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.last_modified.as_deref(), Some("v1"));
        assert!(http.requests_matching("bucketing.json") >= 3);

        poller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restores_persisted_manifest_before_polling() {
        let http = MockHttpClient::new(|_| Err(Error::Timeout));
        let store = Arc::new(ManifestStore::new());
        let cache = Arc::new(MemoryCache::default());
        let persisted = crate::bucketing::store::CachedManifest::from_json(
            json!({"panic": true}),
            Some("cached".to_owned()),
        )
        .unwrap();
        cache
            .store("bucketing_env", persisted.to_persisted().unwrap())
            .await
            .unwrap();
        let status = StatusHandle::new(SdkStatus::Initializing);

        let poller = ManifestPoller::start(config(http, store.clone(), cache, status.clone()));
        poller.wait_for_configuration().await.unwrap();

        assert_eq!(store.last_modified().as_deref(), Some("cached"));
        assert_eq!(status.get(), SdkStatus::Panic);

        poller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_unauthorized() {
        let http = MockHttpClient::new(|_| Ok(HttpResponse::new(StatusCode::FORBIDDEN, "")));
        let poller = ManifestPoller::start(config(
            http,
            Arc::new(ManifestStore::new()),
            Arc::new(MemoryCache::default()),
            StatusHandle::new(SdkStatus::Initializing),
        ));

        assert!(matches!(
            poller.wait_for_configuration().await,
            Err(Error::Unauthorized)
        ));
        poller.shutdown().await.unwrap();
    }
}
