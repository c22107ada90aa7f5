//! Hit queueing, caching and delivery.
//!
//! [`TrackingManager`] owns two [`HitQueue`](queue::HitQueue)s, one for analytics hits and one
//! for activations, and a single flush task. How hits are cached and when they are sent depends on
//! the configured [`CacheStrategy`](crate::CacheStrategy); in panic mode every operation is a
//! no-op and the hit cache is left untouched.
//!
//! Delivery is at-least-once: hits leave the queue and the cache only after the collection
//! endpoint acknowledged them. A batch that fails is put back and retried on the next tick.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::{watch, Notify},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    cache::{bounded_lookup, log_cache_error, HitCache},
    config::TrackingConfig,
    hit::Hit,
    status::StatusHandle,
    Result,
};

use self::{
    queue::HitQueue,
    sender::HitSender,
    strategy::ActiveStrategy,
    troubleshooting::{TroubleshootingLabel, TroubleshootingReporter},
};

pub(crate) mod queue;
pub(crate) mod sender;
pub(crate) mod strategy;
pub(crate) mod troubleshooting;

pub struct TrackingManager {
    config: TrackingConfig,
    sender: HitSender,
    hits: HitQueue,
    activations: HitQueue,
    cache: Arc<dyn HitCache>,
    lookup_timeout: Duration,
    status: StatusHandle,
    troubleshooting: Arc<TroubleshootingReporter>,
    /// Hit and activation sends from `add_hit` run on this runtime.
    runtime: Handle,
    /// Wakes the flush task before the next tick.
    wake: Notify,
    stop: Notify,
    /// Serializes flushes so a batch is never sent twice concurrently.
    flush_lock: tokio::sync::Mutex<()>,
    /// Number of enqueue-time cache writes still in flight.
    cache_writes: Arc<watch::Sender<usize>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    Hits,
    Activations,
}

impl TrackingManager {
    /// Create the manager, resend hits left in the cache by a previous run, then start the flush
    /// task. Must be called within a tokio runtime.
    pub(crate) async fn start(
        config: TrackingConfig,
        sender: HitSender,
        cache: Arc<dyn HitCache>,
        lookup_timeout: Duration,
        status: StatusHandle,
        troubleshooting: Arc<TroubleshootingReporter>,
    ) -> Arc<TrackingManager> {
        let manager = Arc::new(TrackingManager {
            config,
            sender,
            hits: HitQueue::new(),
            activations: HitQueue::new(),
            cache,
            lookup_timeout,
            status,
            troubleshooting,
            runtime: Handle::current(),
            wake: Notify::new(),
            stop: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            cache_writes: Arc::new(watch::channel(0).0),
            flush_task: Mutex::new(None),
        });

        if manager.rehydrate().await > 0 {
            manager.flush().await;
        }

        let task = manager.spawn_flush_loop();
        *manager
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        manager
    }

    fn strategy(&self) -> ActiveStrategy {
        ActiveStrategy::resolve(self.config.strategy, &self.status)
    }

    fn queue(&self, kind: QueueKind) -> &HitQueue {
        match kind {
            QueueKind::Hits => &self.hits,
            QueueKind::Activations => &self.activations,
        }
    }

    /// Restore cached hits into the queues. Returns the number of restored hits.
    async fn rehydrate(&self) -> usize {
        let cached: HashMap<String, serde_json::Value> =
            bounded_lookup(self.lookup_timeout, "lookup_hits", self.cache.lookup_hits()).await;

        let mut hits = Vec::with_capacity(cached.len());
        let mut malformed = Vec::new();
        for (id, value) in cached {
            match serde_json::from_value::<Hit>(value) {
                Ok(hit) => hits.push(hit),
                Err(err) => {
                    log::warn!(target: "flagship", hit_id = id.as_str(); "ignoring malformed cached hit: {:?}", err);
                    malformed.push(id);
                }
            }
        }
        if !malformed.is_empty() {
            log_cache_error("flush_hits", self.cache.flush_hits(&malformed).await);
        }

        hits.sort_by_key(|hit| hit.created_at);
        let restored = hits.len();
        for hit in hits {
            if hit.is_activation() {
                self.activations.push(hit);
            } else {
                self.hits.push(hit);
            }
        }
        if restored > 0 {
            log::info!(target: "flagship", hits = restored; "restored cached hits");
        }
        restored
    }

    /// Queue an analytics hit, or an activation, according to the active strategy.
    pub fn add_hit(self: &Arc<Self>, hit: Hit) {
        if hit.is_activation() {
            self.enqueue(QueueKind::Activations, hit);
        } else {
            self.enqueue(QueueKind::Hits, hit);
        }
    }

    /// Queue an activation. Activations are sent to their own endpoint but follow the same
    /// strategy and pool size as other hits.
    pub fn add_activation(self: &Arc<Self>, hit: Hit) {
        self.enqueue(QueueKind::Activations, hit);
    }

    fn enqueue(self: &Arc<Self>, kind: QueueKind, hit: Hit) {
        let strategy = self.strategy();
        if strategy.is_panic() {
            log::info!(target: "flagship", operation = "add_hit"; "deactivated in panic mode");
            return;
        }

        if strategy.sends_immediately() {
            let manager = Arc::clone(self);
            self.runtime.spawn(async move { manager.send_now(kind, hit).await });
            return;
        }

        if strategy.caches_on_enqueue() {
            let manager = Arc::clone(self);
            let write = CacheWrite::start(&self.cache_writes);
            let hit = hit.clone();
            self.runtime.spawn(async move {
                manager.cache_hits(&[hit]).await;
                drop(write);
            });
        }

        let len = self.queue(kind).push(hit);
        if len >= self.config.max_pool_size {
            self.wake.notify_one();
        }
    }

    async fn send_now(&self, kind: QueueKind, hit: Hit) {
        let result = match kind {
            QueueKind::Hits => self.sender.send_single(&hit).await,
            QueueKind::Activations => {
                self.sender
                    .send_activations(std::slice::from_ref(&hit))
                    .await
            }
        };
        match result {
            Ok(()) => {
                // Replay what failed before now that the endpoint answers.
                if !self.hits.is_empty() || !self.activations.is_empty() {
                    self.wake.notify_one();
                }
            }
            Err(err) => {
                self.report_send_error(kind, &err);
                self.cache_hits(std::slice::from_ref(&hit)).await;
                self.queue(kind).push(hit);
            }
        }
    }

    /// Take up to `max` analytics hits from the front of the queue. The caller becomes
    /// responsible for their delivery. Returns nothing in panic mode.
    pub fn poll(&self, max: usize) -> Vec<Hit> {
        self.poll_queue(QueueKind::Hits, max)
    }

    fn poll_queue(&self, kind: QueueKind, max: usize) -> Vec<Hit> {
        if self.strategy().is_panic() {
            log::info!(target: "flagship", operation = "poll"; "deactivated in panic mode");
            return Vec::new();
        }
        self.queue(kind).poll(max)
    }

    /// Send every queued hit and activation in batches of at most `max_pool_size`.
    pub async fn flush(&self) {
        let strategy = self.strategy();
        if strategy.is_panic() {
            log::info!(target: "flagship", operation = "flush"; "deactivated in panic mode");
            return;
        }

        let _guard = self.flush_lock.lock().await;
        self.flush_queue(QueueKind::Hits).await;
        self.flush_queue(QueueKind::Activations).await;
        if strategy.persists_snapshot() {
            self.persist_snapshot().await;
        }
    }

    async fn flush_queue(&self, kind: QueueKind) {
        loop {
            let batch = self.poll_queue(kind, self.config.max_pool_size);
            if batch.is_empty() {
                return;
            }

            let result = match kind {
                QueueKind::Hits => self.sender.send_batch(&batch).await,
                QueueKind::Activations => self.sender.send_activations(&batch).await,
            };
            match result {
                Ok(()) => {
                    let ids: Vec<String> = batch.into_iter().map(|hit| hit.id).collect();
                    // A write landing after this removal would resurrect delivered hits.
                    self.cache_writes_settled().await;
                    log_cache_error("flush_hits", self.cache.flush_hits(&ids).await);
                }
                Err(err) => {
                    self.report_send_error(kind, &err);
                    // Keep the batch for the next tick.
                    self.queue(kind).requeue(batch);
                    return;
                }
            }
        }
    }

    /// Replace the cached hits with the current content of the queues. The snapshot is written
    /// before stale entries are removed, so an interruption never leaves the cache empty.
    async fn persist_snapshot(&self) {
        let snapshot: Vec<Hit> = self
            .hits
            .snapshot()
            .into_iter()
            .chain(self.activations.snapshot())
            .collect();
        if !snapshot.is_empty() {
            self.cache_hits(&snapshot).await;
        }

        let cached: HashMap<String, serde_json::Value> =
            bounded_lookup(self.lookup_timeout, "lookup_hits", self.cache.lookup_hits()).await;
        let stale: Vec<String> = cached
            .into_keys()
            .filter(|id| !snapshot.iter().any(|hit| &hit.id == id))
            .collect();
        if !stale.is_empty() {
            log_cache_error("flush_hits", self.cache.flush_hits(&stale).await);
        }
    }

    async fn cache_writes_settled(&self) {
        let mut writes = self.cache_writes.subscribe();
        // The sender lives as long as `self`, so waiting cannot fail.
        let _ = writes.wait_for(|pending| *pending == 0).await;
    }

    async fn cache_hits(&self, hits: &[Hit]) {
        let mut entries = HashMap::with_capacity(hits.len());
        for hit in hits {
            match serde_json::to_value(hit) {
                Ok(value) => {
                    entries.insert(hit.id.clone(), value);
                }
                Err(err) => {
                    log::warn!(target: "flagship", hit_id = hit.id.as_str(); "failed to serialize hit: {:?}", err)
                }
            }
        }
        log_cache_error("cache_hits", self.cache.cache_hits(entries).await);
    }

    fn report_send_error(&self, kind: QueueKind, err: &crate::Error) {
        log::warn!(target: "flagship", "failed to send {:?}, will retry: {:?}", kind, err);
        let label = match kind {
            QueueKind::Hits => TroubleshootingLabel::SendBatchHitRouteResponseError,
            QueueKind::Activations => TroubleshootingLabel::SendActivateHitRouteError,
        };
        self.troubleshooting
            .report_sdk(label, [("error".to_owned(), err.to_string())]);
    }

    /// Drop the pending hits of the visitor identified by `stable_id`, except consent hits.
    pub(crate) async fn remove_visitor_hits(&self, stable_id: &str) {
        if self.strategy().is_panic() {
            log::info!(target: "flagship", operation = "remove_visitor_hits"; "deactivated in panic mode");
            return;
        }
        let matches = |hit: &Hit| hit.stable_id() == stable_id && !hit.is_consent();
        let ids: Vec<String> = self
            .hits
            .remove_where(matches)
            .into_iter()
            .chain(self.activations.remove_where(matches))
            .map(|hit| hit.id)
            .collect();
        if !ids.is_empty() {
            log::debug!(target: "flagship", visitor_id = stable_id, hits = ids.len(); "dropped pending hits");
            self.cache_writes_settled().await;
            log_cache_error("flush_hits", self.cache.flush_hits(&ids).await);
        }
    }

    /// Analytics hits waiting to be sent.
    pub fn pending_hits(&self) -> Vec<Hit> {
        self.hits.snapshot()
    }

    /// Activations waiting to be sent.
    pub fn pending_activations(&self) -> Vec<Hit> {
        self.activations.snapshot()
    }

    fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        self.runtime.spawn(async move {
            let period = manager.config.batch_interval;
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = manager.wake.notified() => {}
                    _ = manager.stop.notified() => {
                        log::debug!(target: "flagship", "tracking flush task received stop command");
                        return;
                    }
                }
                manager.flush().await;
            }
        })
    }

    /// Stop the flush task, then send the remaining hits (or persist them with the periodic
    /// strategy) one last time.
    pub(crate) async fn stop(&self) -> Result<()> {
        self.stop.notify_one();
        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.await?;
        }

        let strategy = self.strategy();
        if strategy.is_panic() {
            return Ok(());
        }
        if strategy.persists_snapshot() {
            self.persist_snapshot().await;
        } else {
            self.flush().await;
        }
        Ok(())
    }
}

/// An enqueue-time cache write in flight. Dropping it, even when the write task is cancelled,
/// marks the write as done.
struct CacheWrite(Arc<watch::Sender<usize>>);

impl CacheWrite {
    fn start(writes: &Arc<watch::Sender<usize>>) -> CacheWrite {
        writes.send_modify(|pending| *pending += 1);
        CacheWrite(Arc::clone(writes))
    }
}

impl Drop for CacheWrite {
    fn drop(&mut self) {
        self.0.send_modify(|pending| *pending -= 1);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };

    use reqwest::StatusCode;

    use super::TrackingManager;
    use crate::{
        cache::HitCache,
        config::{CacheStrategy, TrackingConfig},
        hit::{Activation, Event, EventCategory, Hit, HitKind},
        http::HttpResponse,
        status::{SdkStatus, StatusHandle},
        test_utils::{test_hit_sender, test_troubleshooting, MemoryCache, MockHttpClient},
    };

    struct Fixture {
        manager: Arc<TrackingManager>,
        http: Arc<MockHttpClient>,
        cache: Arc<MemoryCache>,
        status: StatusHandle,
        online: Arc<AtomicBool>,
    }

    async fn fixture(strategy: CacheStrategy, cache: Arc<MemoryCache>) -> Fixture {
        let online = Arc::new(AtomicBool::new(true));
        let http = {
            let online = online.clone();
            MockHttpClient::new(move |_| {
                if online.load(Ordering::SeqCst) {
                    Ok(HttpResponse::new(StatusCode::OK, ""))
                } else {
                    Ok(HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE, ""))
                }
            })
        };
        let status = StatusHandle::new(SdkStatus::Initialized);
        let manager = TrackingManager::start(
            TrackingConfig::new()
                .strategy(strategy)
                .max_pool_size(5)
                .batch_interval(Duration::from_secs(10)),
            test_hit_sender(http.clone()),
            cache.clone(),
            Duration::from_millis(200),
            status.clone(),
            test_troubleshooting(http.clone()),
        )
        .await;
        Fixture {
            manager,
            http,
            cache,
            status,
            online,
        }
    }

    fn event(visitor_id: &str) -> Hit {
        Hit::new(
            visitor_id,
            None,
            HitKind::Event(Event::new(EventCategory::ActionTracking, "click")),
        )
    }

    fn activation(visitor_id: &str) -> Hit {
        Hit::new(
            visitor_id,
            None,
            HitKind::Activation(Activation {
                variation_group_id: "vg".to_owned(),
                variation_id: "v".to_owned(),
                flag_key: Some("title".to_owned()),
            }),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_caches_then_flushes_on_tick() {
        let f = fixture(CacheStrategy::ContinuousCaching, Arc::default()).await;

        f.manager.add_hit(event("a"));
        f.manager.add_hit(activation("a"));
        settle().await;
        assert_eq!(f.cache.hit_count(), 2);
        assert!(f.http.requests().is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(f.http.requests_matching("activate"), 1);
        assert_eq!(f.http.requests().len(), 2);
        assert_eq!(f.cache.hit_count(), 0);
        assert!(f.manager.pending_hits().is_empty());
        assert!(f.manager.pending_activations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cache_writes_do_not_outlive_delivery() {
        let cache = Arc::new(MemoryCache::with_hit_write_delay(Duration::from_millis(50)));
        let f = fixture(CacheStrategy::ContinuousCaching, cache).await;

        for _ in 0..5 {
            f.manager.add_hit(event("a"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(f.http.requests().len(), 1);
        assert!(f.manager.pending_hits().is_empty());
        assert_eq!(f.cache.hit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pool_triggers_an_early_flush() {
        let f = fixture(CacheStrategy::ContinuousCaching, Arc::default()).await;

        for _ in 0..5 {
            f.manager.add_hit(event("a"));
        }
        settle().await;

        let requests = f.http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body.as_ref().unwrap()["h"].as_array().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batches_are_retried_until_delivered() {
        let f = fixture(CacheStrategy::ContinuousCaching, Arc::default()).await;
        f.online.store(false, Ordering::SeqCst);

        f.manager.add_hit(event("a"));
        f.manager.add_hit(event("b"));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(f.http.requests().len(), 1);
        assert_eq!(f.manager.pending_hits().len(), 2);
        assert_eq!(f.cache.hit_count(), 2);

        f.online.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let requests = f.http.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].body.as_ref().unwrap()["h"].as_array().unwrap().len(), 2);
        assert!(f.manager.pending_hits().is_empty());
        assert_eq!(f.cache.hit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_batching_sends_immediately_and_caches_failures() {
        let f = fixture(CacheStrategy::NoBatching, Arc::default()).await;

        f.manager.add_hit(event("a"));
        settle().await;
        assert_eq!(f.http.requests().len(), 1);
        assert_eq!(f.cache.hit_count(), 0);

        f.online.store(false, Ordering::SeqCst);
        f.manager.add_hit(event("b"));
        settle().await;
        assert_eq!(f.cache.hit_count(), 1);
        assert_eq!(f.manager.pending_hits().len(), 1);

        // The next successful send replays the failed hit.
        f.online.store(true, Ordering::SeqCst);
        f.manager.add_hit(event("c"));
        settle().await;
        assert!(f.manager.pending_hits().is_empty());
        assert_eq!(f.cache.hit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_persists_snapshot_and_on_stop() {
        let f = fixture(CacheStrategy::PeriodicCaching, Arc::default()).await;
        f.online.store(false, Ordering::SeqCst);

        f.manager.add_hit(event("a"));
        settle().await;
        assert_eq!(f.cache.hit_count(), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.cache.hit_count(), 1);

        f.manager.add_hit(event("b"));
        f.manager.stop().await.unwrap();
        assert_eq!(f.cache.hit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_drops_only_entries_no_longer_queued() {
        let cache: Arc<MemoryCache> = Arc::default();
        let delivered = event("gone");
        cache
            .cache_hits(HashMap::from([(
                delivered.id.clone(),
                serde_json::to_value(&delivered).unwrap(),
            )]))
            .await
            .unwrap();
        let f = fixture(CacheStrategy::PeriodicCaching, cache).await;
        assert_eq!(f.cache.hit_count(), 0);

        f.online.store(false, Ordering::SeqCst);
        let queued = event("a");
        let queued_id = queued.id.clone();
        f.manager.add_hit(queued);
        f.cache
            .cache_hits(HashMap::from([("stale".to_owned(), serde_json::json!({}))]))
            .await
            .unwrap();

        f.manager.stop().await.unwrap();
        let cached = f.cache.lookup_hits().await.unwrap();
        assert_eq!(cached.len(), 1);
        assert!(cached.contains_key(&queued_id));
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_resend_cached_hits() {
        let cache: Arc<MemoryCache> = Arc::default();
        {
            let f = fixture(CacheStrategy::PeriodicCaching, cache.clone()).await;
            f.online.store(false, Ordering::SeqCst);
            f.manager.add_hit(event("a"));
            f.manager.add_hit(activation("a"));
            f.manager.stop().await.unwrap();
        }
        assert_eq!(cache.hit_count(), 2);

        let f = fixture(CacheStrategy::PeriodicCaching, cache.clone()).await;
        assert_eq!(f.http.requests().len(), 2);
        assert!(f.manager.pending_hits().is_empty());
        assert!(f.manager.pending_activations().is_empty());
        assert_eq!(cache.hit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_mode_is_a_no_op() {
        let f = fixture(CacheStrategy::ContinuousCaching, Arc::default()).await;
        f.manager.add_hit(event("a"));
        settle().await;

        f.status.apply_panic(true);
        f.manager.add_hit(event("b"));
        f.manager.add_activation(activation("b"));
        f.manager.flush().await;
        settle().await;

        assert!(f.manager.poll(10).is_empty());
        assert_eq!(f.manager.pending_hits().len(), 1);
        assert!(f.manager.pending_activations().is_empty());
        assert!(f.http.requests().is_empty());
        assert_eq!(f.cache.lookup_hits().await.unwrap().len(), 1);

        f.manager.stop().await.unwrap();
        assert_eq!(f.cache.hit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removes_pending_hits_of_a_visitor() {
        let f = fixture(CacheStrategy::ContinuousCaching, Arc::default()).await;
        f.manager.add_hit(event("a"));
        f.manager.add_hit(activation("a"));
        f.manager
            .add_hit(Hit::new("a", None, HitKind::Consent { consent: false }));
        f.manager.add_hit(event("b"));
        settle().await;

        f.manager.remove_visitor_hits("a").await;

        assert_eq!(f.manager.pending_hits().len(), 2);
        assert!(f.manager.pending_activations().is_empty());
        assert_eq!(f.cache.hit_count(), 2);
    }
}
