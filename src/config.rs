use std::{fmt, sync::Arc, time::Duration};

use crate::{
    cache::{BucketingCache, HitCache, NoopCache, VisitorCache},
    context::ContextProvider,
    http::{HttpClient, ReqwestHttpClient},
};

/// Where campaign decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionMode {
    /// Every fetch asks the decision API.
    DecisionApi,
    /// Fetches evaluate a periodically polled bucketing file locally.
    Bucketing,
}

/// How hits are batched and persisted before delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Send every hit immediately. Hits that fail to send are cached and retried.
    NoBatching,
    /// Cache every hit on enqueue and send batches every interval or once the pool is full.
    #[default]
    ContinuousCaching,
    /// Keep hits in memory; every interval send a batch and persist what is left.
    PeriodicCaching,
}

/// Configuration of the tracking manager.
///
/// ```
/// # use std::time::Duration;
/// # use flagship::{CacheStrategy, TrackingConfig};
/// let tracking = TrackingConfig::new()
///     .strategy(CacheStrategy::PeriodicCaching)
///     .batch_interval(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub(crate) strategy: CacheStrategy,
    pub(crate) batch_interval: Duration,
    pub(crate) max_pool_size: usize,
}

impl TrackingConfig {
    pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

    pub fn new() -> TrackingConfig {
        TrackingConfig {
            strategy: CacheStrategy::default(),
            batch_interval: TrackingConfig::DEFAULT_BATCH_INTERVAL,
            max_pool_size: TrackingConfig::DEFAULT_MAX_POOL_SIZE,
        }
    }

    pub fn strategy(mut self, strategy: CacheStrategy) -> TrackingConfig {
        self.strategy = strategy;
        self
    }

    /// Interval between two batch sends.
    pub fn batch_interval(mut self, batch_interval: Duration) -> TrackingConfig {
        self.batch_interval = batch_interval;
        self
    }

    /// Queue size that triggers an early batch send. Also the maximum batch size.
    pub fn max_pool_size(mut self, max_pool_size: usize) -> TrackingConfig {
        self.max_pool_size = max_pool_size.max(1);
        self
    }
}

impl Default for TrackingConfig {
    fn default() -> TrackingConfig {
        TrackingConfig::new()
    }
}

/// Configuration for [`Flagship`](crate::Flagship).
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagship::FlagshipConfig;
/// let config = FlagshipConfig::bucketing("env-id", "api-key")
///     .polling_interval(Duration::from_secs(30))
///     .timeout(Duration::from_secs(1));
/// ```
#[derive(Clone)]
pub struct FlagshipConfig {
    pub(crate) env_id: String,
    pub(crate) api_key: String,
    pub(crate) mode: DecisionMode,
    pub(crate) timeout: Duration,
    pub(crate) polling_interval: Duration,
    pub(crate) lookup_timeout: Duration,
    pub(crate) tracking: TrackingConfig,
    pub(crate) decision_url: String,
    pub(crate) bucketing_url: String,
    pub(crate) events_url: String,
    pub(crate) disable_developer_usage: bool,
    pub(crate) http_client: Arc<dyn HttpClient>,
    pub(crate) visitor_cache: Arc<dyn VisitorCache>,
    pub(crate) hit_cache: Arc<dyn HitCache>,
    pub(crate) bucketing_cache: Arc<dyn BucketingCache>,
    pub(crate) context_provider: Option<Arc<dyn ContextProvider>>,
}

impl FlagshipConfig {
    /// Default timeout of network calls.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
    /// Default interval between two bucketing file polls.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
    /// Default time allowed to cache lookups before they count as a miss.
    pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(200);

    pub const DEFAULT_DECISION_URL: &'static str = "https://decision.flagship.io/v2";
    pub const DEFAULT_BUCKETING_URL: &'static str = "https://cdn.flagship.io";
    pub const DEFAULT_EVENTS_URL: &'static str = "https://events.flagship.io";

    /// Configuration asking the decision API for every fetch.
    pub fn decision_api(env_id: impl Into<String>, api_key: impl Into<String>) -> FlagshipConfig {
        FlagshipConfig::new(env_id.into(), api_key.into(), DecisionMode::DecisionApi)
    }

    /// Configuration evaluating campaigns locally from the polled bucketing file.
    pub fn bucketing(env_id: impl Into<String>, api_key: impl Into<String>) -> FlagshipConfig {
        FlagshipConfig::new(env_id.into(), api_key.into(), DecisionMode::Bucketing)
    }

    fn new(env_id: String, api_key: String, mode: DecisionMode) -> FlagshipConfig {
        FlagshipConfig {
            env_id,
            api_key,
            mode,
            timeout: FlagshipConfig::DEFAULT_TIMEOUT,
            polling_interval: FlagshipConfig::DEFAULT_POLLING_INTERVAL,
            lookup_timeout: FlagshipConfig::DEFAULT_LOOKUP_TIMEOUT,
            tracking: TrackingConfig::default(),
            decision_url: FlagshipConfig::DEFAULT_DECISION_URL.to_owned(),
            bucketing_url: FlagshipConfig::DEFAULT_BUCKETING_URL.to_owned(),
            events_url: FlagshipConfig::DEFAULT_EVENTS_URL.to_owned(),
            disable_developer_usage: false,
            http_client: Arc::new(ReqwestHttpClient::new()),
            visitor_cache: Arc::new(NoopCache),
            hit_cache: Arc::new(NoopCache),
            bucketing_cache: Arc::new(NoopCache),
            context_provider: None,
        }
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn mode(&self) -> DecisionMode {
        self.mode
    }

    /// Timeout of decision calls, bucketing polls and hit sends.
    pub fn timeout(mut self, timeout: Duration) -> FlagshipConfig {
        self.timeout = timeout;
        self
    }

    /// Interval between two bucketing file polls. Ignored in decision API mode.
    pub fn polling_interval(mut self, polling_interval: Duration) -> FlagshipConfig {
        self.polling_interval = polling_interval;
        self
    }

    /// Time allowed to visitor and hit cache lookups before they count as a miss.
    pub fn lookup_timeout(mut self, lookup_timeout: Duration) -> FlagshipConfig {
        self.lookup_timeout = lookup_timeout;
        self
    }

    pub fn tracking(mut self, tracking: TrackingConfig) -> FlagshipConfig {
        self.tracking = tracking;
        self
    }

    /// Override the decision API base URL. Clients should use the default setting in most cases.
    pub fn decision_url(mut self, url: impl Into<String>) -> FlagshipConfig {
        self.decision_url = url.into();
        self
    }

    /// Override the bucketing CDN base URL. Clients should use the default setting in most cases.
    pub fn bucketing_url(mut self, url: impl Into<String>) -> FlagshipConfig {
        self.bucketing_url = url.into();
        self
    }

    /// Override the hit collection base URL. Clients should use the default setting in most cases.
    pub fn events_url(mut self, url: impl Into<String>) -> FlagshipConfig {
        self.events_url = url.into();
        self
    }

    /// Stop sending anonymous SDK usage reports.
    pub fn disable_developer_usage(mut self, disable: bool) -> FlagshipConfig {
        self.disable_developer_usage = disable;
        self
    }

    pub fn http_client(mut self, http_client: impl HttpClient + 'static) -> FlagshipConfig {
        self.http_client = Arc::new(http_client);
        self
    }

    pub fn visitor_cache(mut self, cache: impl VisitorCache + 'static) -> FlagshipConfig {
        self.visitor_cache = Arc::new(cache);
        self
    }

    pub fn hit_cache(mut self, cache: impl HitCache + 'static) -> FlagshipConfig {
        self.hit_cache = Arc::new(cache);
        self
    }

    /// Persist the bucketing file and its validator across restarts, e.g. with
    /// [`FileBucketingCache`](crate::FileBucketingCache).
    pub fn bucketing_cache(mut self, cache: impl BucketingCache + 'static) -> FlagshipConfig {
        self.bucketing_cache = Arc::new(cache);
        self
    }

    /// Supply device and app facts merged into every visitor context.
    pub fn context_provider(mut self, provider: impl ContextProvider + 'static) -> FlagshipConfig {
        self.context_provider = Some(Arc::new(provider));
        self
    }

    /// Same as [`FlagshipConfig::http_client`] for a client that is already shared.
    pub fn shared_http_client(mut self, http_client: Arc<dyn HttpClient>) -> FlagshipConfig {
        self.http_client = http_client;
        self
    }

    /// Same as [`FlagshipConfig::visitor_cache`] for a cache that is already shared.
    pub fn shared_visitor_cache(mut self, cache: Arc<dyn VisitorCache>) -> FlagshipConfig {
        self.visitor_cache = cache;
        self
    }

    /// Same as [`FlagshipConfig::hit_cache`] for a cache that is already shared.
    pub fn shared_hit_cache(mut self, cache: Arc<dyn HitCache>) -> FlagshipConfig {
        self.hit_cache = cache;
        self
    }

    /// Same as [`FlagshipConfig::bucketing_cache`] for a cache that is already shared.
    pub fn shared_bucketing_cache(mut self, cache: Arc<dyn BucketingCache>) -> FlagshipConfig {
        self.bucketing_cache = cache;
        self
    }
}

impl fmt::Debug for FlagshipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagshipConfig")
            .field("env_id", &self.env_id)
            .field("mode", &self.mode)
            .field("timeout", &self.timeout)
            .field("polling_interval", &self.polling_interval)
            .field("lookup_timeout", &self.lookup_timeout)
            .field("tracking", &self.tracking)
            .field("decision_url", &self.decision_url)
            .field("bucketing_url", &self.bucketing_url)
            .field("events_url", &self.events_url)
            .finish_non_exhaustive()
    }
}
