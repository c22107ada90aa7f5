use std::sync::{Arc, Mutex, PoisonError};

use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};

use crate::{
    bucketing::{
        fetcher::ManifestFetcher,
        poller::{ManifestPoller, ManifestPollerConfig},
        store::ManifestStore,
    },
    config::{DecisionMode, FlagshipConfig},
    decision::{ApiDecision, BucketingDecision, DecisionSource},
    status::{SdkStatus, StatusHandle},
    tracking::{
        sender::HitSender,
        troubleshooting::{TroubleshootingLabel, TroubleshootingReporter},
        TrackingManager,
    },
    visitor::{Services, VisitorBuilder},
    Error, Result,
};

enum Source {
    Api(ApiDecision),
    Bucketing(ManifestFetcher),
}

/// A Flagship SDK instance.
///
/// Each instance owns its decision source, tracking manager and background tasks. Several
/// instances may run in the same process, and a stopped instance leaves nothing behind.
///
/// # Examples
/// ```no_run
/// # async fn run() -> flagship::Result<()> {
/// use flagship::{Flagship, FlagshipConfig};
///
/// let flagship = Flagship::start(FlagshipConfig::decision_api("env-id", "api-key")).await?;
/// let visitor = flagship
///     .new_visitor("visitor-1")
///     .context_value("age", 30)
///     .build()
///     .await;
/// visitor.fetch_flags().await?;
/// let title = visitor.get_flag("title", "Welcome".to_owned()).value(true);
/// # let _ = title;
/// flagship.stop().await
/// # }
/// ```
pub struct Flagship {
    env_id: String,
    mode: DecisionMode,
    services: Arc<Services>,
    poller: Mutex<Option<ManifestPoller>>,
    troubleshooting_stop: Arc<Notify>,
    troubleshooting_task: Mutex<Option<JoinHandle<()>>>,
}

impl Flagship {
    /// Start an instance: restore and send hits cached by a previous run, then start polling the
    /// bucketing file in bucketing mode. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if an endpoint URL is invalid.
    pub async fn start(config: FlagshipConfig) -> Result<Flagship> {
        let status = StatusHandle::new(match config.mode {
            DecisionMode::DecisionApi => SdkStatus::Initialized,
            DecisionMode::Bucketing => SdkStatus::Initializing,
        });

        // Everything that can fail is built before any task is spawned.
        let troubleshooting = Arc::new(TroubleshootingReporter::new(
            config.http_client.clone(),
            &config.events_url,
            &config.env_id,
            &config.api_key,
            config.timeout,
            status.clone(),
            config.disable_developer_usage,
            uuid::Uuid::new_v4().to_string(),
        )?);
        let sender = HitSender::new(
            config.http_client.clone(),
            &config.events_url,
            &config.decision_url,
            &config.env_id,
            &config.api_key,
            config.timeout,
        )?;
        let source = match config.mode {
            DecisionMode::DecisionApi => Source::Api(ApiDecision::new(
                config.http_client.clone(),
                &config.decision_url,
                &config.env_id,
                config.api_key.clone(),
                config.timeout,
            )?),
            DecisionMode::Bucketing => Source::Bucketing(ManifestFetcher::new(
                config.http_client.clone(),
                &config.bucketing_url,
                &config.env_id,
                config.api_key.clone(),
                config.timeout,
            )?),
        };

        let troubleshooting_stop = Arc::new(Notify::new());
        let troubleshooting_task = troubleshooting
            .spawn_flush_loop(config.tracking.batch_interval, troubleshooting_stop.clone());
        let tracking = TrackingManager::start(
            config.tracking.clone(),
            sender,
            config.hit_cache.clone(),
            config.lookup_timeout,
            status.clone(),
            troubleshooting.clone(),
        )
        .await;

        let (decision, poller): (Arc<dyn DecisionSource>, Option<ManifestPoller>) = match source {
            Source::Api(decision) => (Arc::new(decision), None),
            Source::Bucketing(fetcher) => {
                let store = Arc::new(ManifestStore::new());
                let poller = ManifestPoller::start(ManifestPollerConfig {
                    fetcher,
                    store: store.clone(),
                    cache: config.bucketing_cache.clone(),
                    cache_key: format!("bucketing_{}", config.env_id),
                    lookup_timeout: config.lookup_timeout,
                    interval: config.polling_interval,
                    status: status.clone(),
                    troubleshooting: troubleshooting.clone(),
                });
                (Arc::new(BucketingDecision::new(store)), Some(poller))
            }
        };

        troubleshooting.report_usage(
            TroubleshootingLabel::SdkConfig,
            [
                ("sdk.config.mode".to_owned(), format!("{:?}", config.mode)),
                (
                    "sdk.config.timeout".to_owned(),
                    config.timeout.as_millis().to_string(),
                ),
                (
                    "sdk.config.pollingInterval".to_owned(),
                    config.polling_interval.as_millis().to_string(),
                ),
                (
                    "sdk.config.trackingManager.strategy".to_owned(),
                    format!("{:?}", config.tracking.strategy),
                ),
                (
                    "sdk.config.trackingManager.batchIntervals".to_owned(),
                    config.tracking.batch_interval.as_millis().to_string(),
                ),
                (
                    "sdk.config.trackingManager.poolMaxSize".to_owned(),
                    config.tracking.max_pool_size.to_string(),
                ),
            ],
        );

        log::info!(target: "flagship",
                   env_id = config.env_id.as_str(),
                   mode:debug = config.mode,
                   status:display = status.get();
                   "flagship started");

        Ok(Flagship {
            env_id: config.env_id.clone(),
            mode: config.mode,
            services: Arc::new(Services {
                decision,
                mode: config.mode,
                tracking,
                troubleshooting,
                visitor_cache: config.visitor_cache.clone(),
                context_provider: config.context_provider.clone(),
                status,
                lookup_timeout: config.lookup_timeout,
            }),
            poller: Mutex::new(poller),
            troubleshooting_stop,
            troubleshooting_task: Mutex::new(Some(troubleshooting_task)),
        })
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn mode(&self) -> DecisionMode {
        self.mode
    }

    pub fn status(&self) -> SdkStatus {
        self.services.status.get()
    }

    /// Watch SDK status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SdkStatus> {
        self.services.status.subscribe()
    }

    /// Start building a visitor. An empty id is replaced by a generated one.
    pub fn new_visitor(&self, visitor_id: impl Into<String>) -> VisitorBuilder {
        VisitorBuilder::new(self.services.clone(), visitor_id.into())
    }

    /// Wait until decisions can be made. Returns immediately in decision API mode; in bucketing
    /// mode, waits for the first bucketing file to be restored or fetched.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`](crate::Error::Unauthorized) if the CDN rejected the credentials.
    /// - [`Error::TaskPanicked`](crate::Error::TaskPanicked) if the poller ended unexpectedly.
    pub async fn wait_for_configuration(&self) -> Result<()> {
        let result = {
            let poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
            match poller.as_ref() {
                Some(poller) => poller.result_receiver(),
                None => return Ok(()),
            }
        };
        ManifestPoller::wait_for_result(result).await
    }

    /// Hit queues of this instance, for hosts that send hits themselves or flush on demand.
    pub fn tracking_manager(&self) -> &Arc<TrackingManager> {
        &self.services.tracking
    }

    /// Stop background tasks, then send (or persist, with the periodic strategy) the remaining
    /// hits one last time. Calling it again is a no-op.
    ///
    /// Every teardown step runs even if an earlier one failed; the first error is returned.
    pub async fn stop(&self) -> Result<()> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let troubleshooting_task = self
            .troubleshooting_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(troubleshooting_task) = troubleshooting_task else {
            return Ok(());
        };

        let mut outcome = Ok(());
        if let Some(poller) = poller {
            outcome = outcome.and(poller.shutdown().await);
        }
        outcome = outcome.and(self.services.tracking.stop().await);
        self.troubleshooting_stop.notify_one();
        outcome = outcome.and(troubleshooting_task.await.map_err(Error::from));

        self.services.status.set(SdkStatus::NotInitialized);
        match &outcome {
            Ok(()) => log::info!(target: "flagship", env_id = self.env_id.as_str(); "flagship stopped"),
            Err(err) => log::warn!(target: "flagship",
                                   env_id = self.env_id.as_str();
                                   "flagship stopped with an error: {:?}", err),
        }
        outcome
    }
}
