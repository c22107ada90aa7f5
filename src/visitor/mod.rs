//! Visitors: per-user context, identity, consent and the flag store.
//!
//! Every [`Visitor`] owns its state behind its own lock, so visitors never wait on each other.
//! Fetches of the same visitor are serialized: the last fetch to start is also the last to finish
//! and its assignments win. Status notifications are sent over the channel registered with
//! [`VisitorBuilder::status_listener`] after the state lock is released.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tokio::{sync::mpsc::UnboundedSender, task::JoinHandle};

use crate::{
    cache::{bounded_lookup, log_cache_error, VisitorCache},
    campaign::FlagEntry,
    config::DecisionMode,
    context::{effective_context, ContextProvider},
    decision::{DecisionRequest, DecisionSource},
    flag::{Flag, FlagMetadata, FlagValue},
    hit::{Activation, Hit, HitKind},
    status::StatusHandle,
    tracking::{
        troubleshooting::{TroubleshootingLabel, TroubleshootingReporter},
        TrackingManager,
    },
    Context, ContextValue, Result,
};

mod state;

pub use state::{FetchFlagsRequiredStatusReason, FlagStatus, VisitorEvent};

use state::{CachedVisitor, VisitorState};

/// SDK services shared by all visitors of one [`Flagship`](crate::Flagship) instance.
pub(crate) struct Services {
    pub decision: Arc<dyn DecisionSource>,
    pub mode: DecisionMode,
    pub tracking: Arc<TrackingManager>,
    pub troubleshooting: Arc<TroubleshootingReporter>,
    pub visitor_cache: Arc<dyn VisitorCache>,
    pub context_provider: Option<Arc<dyn ContextProvider>>,
    pub status: StatusHandle,
    pub lookup_timeout: Duration,
}

/// Builder returned by [`Flagship::new_visitor`](crate::Flagship::new_visitor).
pub struct VisitorBuilder {
    services: Arc<Services>,
    visitor_id: String,
    context: Context,
    consent: bool,
    authenticated: bool,
    listener: Option<UnboundedSender<VisitorEvent>>,
}

impl VisitorBuilder {
    pub(crate) fn new(services: Arc<Services>, visitor_id: String) -> VisitorBuilder {
        VisitorBuilder {
            services,
            visitor_id,
            context: Context::new(),
            consent: true,
            authenticated: false,
            listener: None,
        }
    }

    pub fn context(mut self, context: Context) -> VisitorBuilder {
        self.context = context;
        self
    }

    pub fn context_value(
        mut self,
        key: impl Into<String>,
        value: impl Into<ContextValue>,
    ) -> VisitorBuilder {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Whether the visitor consented to tracking. Defaults to `true`.
    pub fn has_consented(mut self, consent: bool) -> VisitorBuilder {
        self.consent = consent;
        self
    }

    /// Create the visitor already logged in: the visitor id is the custom id and a fresh
    /// anonymous id is generated.
    pub fn is_authenticated(mut self, authenticated: bool) -> VisitorBuilder {
        self.authenticated = authenticated;
        self
    }

    /// Receive the visitor's [`VisitorEvent`]s.
    pub fn status_listener(mut self, listener: UnboundedSender<VisitorEvent>) -> VisitorBuilder {
        self.listener = Some(listener);
        self
    }

    /// Create the visitor. Assignments cached by a previous session are restored as
    /// best-available values until the first fetch.
    pub async fn build(self) -> Visitor {
        let visitor_id = if self.visitor_id.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            log::warn!(target: "flagship", visitor_id = generated.as_str(); "empty visitor id, generated one");
            generated
        } else {
            self.visitor_id
        };
        let anonymous_id = self
            .authenticated
            .then(|| uuid::Uuid::new_v4().to_string());

        let mut state = VisitorState::new(visitor_id, anonymous_id, self.context, self.consent);
        if self.consent {
            if let Some(cached) = lookup_cached_visitor(&self.services, &state.visitor_id).await {
                state.restore(cached);
            }
        }

        let visitor = Visitor {
            inner: Arc::new(VisitorInner {
                services: self.services,
                state: Mutex::new(state),
                fetch_lock: tokio::sync::Mutex::new(()),
                listener: self.listener,
            }),
        };
        visitor.with_state(|state, events| {
            state.set_status(
                FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::NeverFetched),
                events,
            )
        });
        visitor
    }
}

async fn lookup_cached_visitor(services: &Services, visitor_id: &str) -> Option<CachedVisitor> {
    let value = bounded_lookup(
        services.lookup_timeout,
        "lookup_visitor",
        services.visitor_cache.lookup_visitor(visitor_id),
    )
    .await?;

    match CachedVisitor::from_json(value) {
        Ok(Some(cached)) if cached.visitor_id == visitor_id => Some(cached),
        Ok(_) => {
            log::debug!(target: "flagship", visitor_id; "ignoring cached visitor of another version or id");
            None
        }
        Err(err) => {
            log::warn!(target: "flagship", visitor_id; "ignoring malformed cached visitor: {:?}", err);
            None
        }
    }
}

/// A user of the host application. Cheap to clone: clones share the same state.
#[derive(Clone)]
pub struct Visitor {
    inner: Arc<VisitorInner>,
}

struct VisitorInner {
    services: Arc<Services>,
    state: Mutex<VisitorState>,
    /// Serializes fetches.
    fetch_lock: tokio::sync::Mutex<()>,
    listener: Option<UnboundedSender<VisitorEvent>>,
}

impl fmt::Debug for Visitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Visitor")
            .field("visitor_id", &state.visitor_id)
            .field("anonymous_id", &state.anonymous_id)
            .field("status", &state.status)
            .finish_non_exhaustive()
    }
}

impl Visitor {
    fn lock(&self) -> MutexGuard<'_, VisitorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the state lock, then send the events it produced.
    fn with_state<R>(&self, f: impl FnOnce(&mut VisitorState, &mut Vec<VisitorEvent>) -> R) -> R {
        let mut events = Vec::new();
        let result = {
            let mut state = self.lock();
            f(&mut state, &mut events)
        };
        if let Some(listener) = &self.inner.listener {
            for event in events {
                // The host dropping its receiver only means nobody listens anymore.
                let _ = listener.send(event);
            }
        }
        result
    }

    fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn visitor_id(&self) -> String {
        self.lock().visitor_id.clone()
    }

    pub fn anonymous_id(&self) -> Option<String> {
        self.lock().anonymous_id.clone()
    }

    pub fn flag_status(&self) -> FlagStatus {
        self.lock().status
    }

    /// The visitor context, without the keys reserved by the SDK.
    pub fn context(&self) -> Context {
        self.lock().context.clone()
    }

    /// Set one context value. Fetched flags become stale only if the context actually changes.
    pub fn update_context(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let values = [(key.into(), value.into())];
        self.with_state(|state, events| state.update_context(values, events));
    }

    pub fn update_contexts(&self, values: impl IntoIterator<Item = (String, ContextValue)>) {
        self.with_state(|state, events| state.update_context(values, events));
    }

    pub fn clear_context(&self) {
        self.with_state(|state, events| state.clear_context(events));
    }

    /// Log the visitor in. The current id becomes the anonymous id, which keeps being used for
    /// allocation, and flags must be fetched again.
    pub fn authenticate(&self, visitor_id: impl Into<String>) {
        let visitor_id = visitor_id.into();
        if visitor_id.is_empty() {
            log::warn!(target: "flagship", "ignoring authentication with an empty visitor id");
            return;
        }
        let authenticated = self.with_state(|state, events| {
            state
                .authenticate(visitor_id, events)
                .then(|| (state.visitor_id.clone(), state.anonymous_id.clone()))
        });
        if let Some((visitor_id, anonymous_id)) = authenticated {
            self.services().troubleshooting.report_visitor(
                &visitor_id,
                anonymous_id.as_deref(),
                TroubleshootingLabel::VisitorAuthenticate,
                [],
            );
        }
    }

    /// Log the visitor out, going back to the anonymous id. Flags must be fetched again.
    pub fn unauthenticate(&self) {
        let visitor_id = self.with_state(|state, events| {
            state
                .unauthenticate(events)
                .then(|| state.visitor_id.clone())
        });
        match visitor_id {
            Some(visitor_id) => self.services().troubleshooting.report_visitor(
                &visitor_id,
                None,
                TroubleshootingLabel::VisitorUnauthenticate,
                [],
            ),
            None => {
                log::warn!(target: "flagship", "unauthenticate called on a visitor that is not authenticated")
            }
        }
    }

    pub fn has_consented(&self) -> bool {
        self.lock().consent
    }

    /// Change tracking consent. Each actual change sends one consent hit. Revoking consent drops
    /// the visitor's pending hits and cached data.
    pub async fn set_consent(&self, consent: bool) {
        let identity = {
            let mut state = self.lock();
            let changed = state.consent != consent;
            state.consent = consent;
            changed.then(|| {
                (
                    state.visitor_id.clone(),
                    state.anonymous_id.clone(),
                    state.hash_key().to_owned(),
                )
            })
        };
        let Some((visitor_id, anonymous_id, stable_id)) = identity else {
            return;
        };

        let services = self.services();
        services.tracking.add_hit(Hit::new(
            visitor_id.clone(),
            anonymous_id,
            HitKind::Consent { consent },
        ));
        if !consent {
            services.tracking.remove_visitor_hits(&stable_id).await;
            log_cache_error(
                "flush_visitor",
                services.visitor_cache.flush_visitor(&visitor_id).await,
            );
        }
    }

    /// Fetch the visitor's assignments from the decision source.
    ///
    /// On failure the previous assignments are kept, the status goes back to what it was and a
    /// [`VisitorEvent::FetchFailed`] is sent.
    pub async fn fetch_flags(&self) -> Result<()> {
        let _fetching = self.inner.fetch_lock.lock().await;
        let services = self.services();

        let (request, context, previous) = self.with_state(|state, events| {
            let previous = state.status;
            state.set_status(FlagStatus::Fetching, events);
            let request = DecisionRequest {
                visitor_id: state.visitor_id.clone(),
                anonymous_id: state.anonymous_id.clone(),
                context: effective_context(
                    &state.visitor_id,
                    &state.context,
                    services.context_provider.as_deref(),
                ),
                assignments_history: state.assignments_history.clone(),
            };
            (request, state.context.clone(), previous)
        });

        log::debug!(target: "flagship", visitor_id = request.visitor_id.as_str(); "fetching flags");
        let started = Instant::now();
        let response = match services.decision.get_campaigns(&request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!(target: "flagship",
                           visitor_id = request.visitor_id.as_str();
                           "failed to fetch flags: {:?}", err);
                self.with_state(|state, events| {
                    if state.status == FlagStatus::Fetching {
                        state.set_status(previous, events);
                        state.check_context(events);
                    }
                    events.push(VisitorEvent::FetchFailed {
                        visitor_id: state.visitor_id.clone(),
                        error: err.clone(),
                    });
                });
                services.troubleshooting.report_visitor(
                    &request.visitor_id,
                    request.anonymous_id.as_deref(),
                    TroubleshootingLabel::VisitorFetchCampaignsError,
                    [("error".to_owned(), err.to_string())],
                );
                return Err(err);
            }
        };

        services.status.apply_panic(response.panic);
        services
            .troubleshooting
            .set_account_settings(response.account_settings.as_ref());

        // Flags fall back to their defaults while the SDK is in panic mode.
        let campaigns = if response.panic {
            Vec::new()
        } else {
            response.campaigns
        };
        let campaign_count = campaigns.len();
        let applied = self.with_state(|state, events| {
            if state.visitor_id != request.visitor_id || state.anonymous_id != request.anonymous_id
            {
                return false;
            }
            state.apply_campaigns(campaigns, context, events);
            true
        });
        if !applied {
            log::debug!(target: "flagship",
                        visitor_id = request.visitor_id.as_str();
                        "identity changed during fetch, discarding fetched flags");
            return Ok(());
        }

        log::debug!(target: "flagship",
                    visitor_id = request.visitor_id.as_str(),
                    campaigns = campaign_count;
                    "fetched flags");
        services.troubleshooting.report_visitor(
            &request.visitor_id,
            request.anonymous_id.as_deref(),
            TroubleshootingLabel::VisitorFetchCampaigns,
            [
                ("visitor.campaigns".to_owned(), campaign_count.to_string()),
                (
                    "http.response.time".to_owned(),
                    started.elapsed().as_millis().to_string(),
                ),
            ],
        );

        self.cache_visitor().await;
        if services.mode == DecisionMode::Bucketing {
            self.send_segment();
        }
        Ok(())
    }

    /// Same as [`Visitor::fetch_flags`], on a background task.
    pub fn fetch_flags_in_background(&self) -> JoinHandle<Result<()>> {
        let visitor = self.clone();
        tokio::spawn(async move { visitor.fetch_flags().await })
    }

    /// Alias of [`Visitor::fetch_flags`].
    pub async fn synchronize_modifications(&self) -> Result<()> {
        self.fetch_flags().await
    }

    async fn cache_visitor(&self) {
        let cached = {
            let state = self.lock();
            state.consent.then(|| state.to_cached())
        };
        let Some(cached) = cached else {
            return;
        };
        match cached.to_json() {
            Ok(data) => log_cache_error(
                "cache_visitor",
                self.services()
                    .visitor_cache
                    .cache_visitor(&cached.visitor_id, data)
                    .await,
            ),
            Err(err) => {
                log::warn!(target: "flagship", "failed to serialize visitor: {:?}", err)
            }
        }
    }

    /// Send the visitor context to the collection endpoint when it changed since the last time.
    /// Only needed in bucketing mode, where decisions never reach the server.
    fn send_segment(&self) {
        let segment = {
            let mut state = self.lock();
            if state.segment_context.as_ref() == Some(&state.context) {
                return;
            }
            state.segment_context = Some(state.context.clone());
            state
                .context
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect()
        };
        self.track(HitKind::Segment { context: segment });
    }

    /// Get a lazy view over the flag `key`, falling back to `default`.
    pub fn get_flag<T: FlagValue>(&self, key: impl Into<String>, default: T) -> Flag<T> {
        Flag::new(self.clone(), key.into(), default)
    }

    /// Metadata of every flag the visitor currently has.
    pub fn get_flags_metadata(&self) -> HashMap<String, FlagMetadata> {
        self.lock()
            .flags
            .iter()
            .map(|(key, entry)| (key.clone(), entry.metadata.clone()))
            .collect()
    }

    /// Send the activation of the variation holding `key`, whatever its value type.
    pub fn activate_modification(&self, key: &str) {
        match self.flag_entry(key) {
            Some(entry) => self.expose(key, &entry),
            None => {
                log::warn!(target: "flagship", flag_key = key; "cannot activate a flag the visitor does not have")
            }
        }
    }

    /// Send an analytics hit. Dropped while the visitor has not consented, except consent hits.
    pub fn send_hit(&self, kind: HitKind) {
        if matches!(kind, HitKind::Troubleshooting(_) | HitKind::Usage(_)) {
            log::warn!(target: "flagship", "troubleshooting and usage hits are reserved to the SDK");
            return;
        }
        self.track(kind);
    }

    fn track(&self, kind: HitKind) {
        let hit = {
            let state = self.lock();
            if !state.consent && !matches!(kind, HitKind::Consent { .. }) {
                log::debug!(target: "flagship",
                            visitor_id = state.visitor_id.as_str();
                            "visitor has not consented, dropping hit");
                return;
            }
            Hit::new(state.visitor_id.clone(), state.anonymous_id.clone(), kind)
        };
        let services = self.services();
        services.troubleshooting.report_visitor(
            &hit.visitor_id,
            hit.anonymous_id.as_deref(),
            TroubleshootingLabel::VisitorSendHit,
            [("hit.id".to_owned(), hit.id.clone())],
        );
        services.tracking.add_hit(hit);
    }

    pub(crate) fn flag_entry(&self, key: &str) -> Option<FlagEntry> {
        self.lock().flags.get(key).cloned()
    }

    /// Log once per staleness that flags are read before being fetched.
    fn warn_if_stale(state: &mut VisitorState) {
        if state.status != FlagStatus::Fetched && !state.stale_warned {
            state.stale_warned = true;
            log::warn!(target: "flagship",
                       visitor_id = state.visitor_id.as_str(),
                       status:display = state.status;
                       "reading flags that are not fetched, values may be outdated");
        }
    }

    pub(crate) fn flag_value<T: FlagValue>(&self, key: &str, default: &T, expose: bool) -> T {
        let (entry, visitor_id, anonymous_id) = {
            let mut state = self.lock();
            Visitor::warn_if_stale(&mut state);
            (
                state.flags.get(key).cloned(),
                state.visitor_id.clone(),
                state.anonymous_id.clone(),
            )
        };

        let Some(entry) = entry else {
            log::info!(target: "flagship",
                       visitor_id = visitor_id.as_str(),
                       flag_key = key;
                       "flag not found, returning the default value");
            self.services().troubleshooting.report_visitor(
                &visitor_id,
                anonymous_id.as_deref(),
                TroubleshootingLabel::GetFlagValueFlagNotFound,
                [("flag.key".to_owned(), key.to_owned())],
            );
            return default.clone();
        };

        if entry.value.is_null() {
            if expose {
                self.expose(key, &entry);
            }
            return default.clone();
        }

        match T::from_json(&entry.value) {
            Some(value) => {
                if expose {
                    self.expose(key, &entry);
                }
                value
            }
            None => {
                log::warn!(target: "flagship",
                           visitor_id = visitor_id.as_str(),
                           flag_key = key;
                           "flag value has another type than the default value, returning the default value");
                self.services().troubleshooting.report_visitor(
                    &visitor_id,
                    anonymous_id.as_deref(),
                    TroubleshootingLabel::GetFlagValueTypeWarning,
                    [
                        ("flag.key".to_owned(), key.to_owned()),
                        ("flag.value".to_owned(), entry.value.to_string()),
                    ],
                );
                default.clone()
            }
        }
    }

    pub(crate) fn expose_flag<T: FlagValue>(&self, key: &str) {
        let Some(entry) = self.flag_entry(key) else {
            log::warn!(target: "flagship", flag_key = key; "cannot expose a flag the visitor does not have");
            return;
        };
        if !entry.value.is_null() && T::from_json(&entry.value).is_none() {
            log::warn!(target: "flagship", flag_key = key; "cannot expose a flag whose value has another type than the default value");
            return;
        }
        self.expose(key, &entry);
    }

    /// Send one activation per flag key and fetch.
    fn expose(&self, key: &str, entry: &FlagEntry) {
        let hit = {
            let mut state = self.lock();
            if state.exposed.contains(key) {
                return;
            }
            if !state.consent {
                log::debug!(target: "flagship",
                            visitor_id = state.visitor_id.as_str(),
                            flag_key = key;
                            "visitor has not consented, dropping activation");
                return;
            }
            state.exposed.insert(key.to_owned());
            Hit::new(
                state.visitor_id.clone(),
                state.anonymous_id.clone(),
                HitKind::Activation(Activation {
                    variation_group_id: entry.metadata.variation_group_id.clone(),
                    variation_id: entry.metadata.variation_id.clone(),
                    flag_key: Some(key.to_owned()),
                }),
            )
        };
        log::debug!(target: "flagship", flag_key = key; "exposing flag");
        let services = self.services();
        services.troubleshooting.report_visitor(
            &hit.visitor_id,
            hit.anonymous_id.as_deref(),
            TroubleshootingLabel::VisitorSendActivate,
            [
                ("flag.key".to_owned(), key.to_owned()),
                (
                    "flag.metadata.variationGroupId".to_owned(),
                    entry.metadata.variation_group_id.clone(),
                ),
                (
                    "flag.metadata.variationId".to_owned(),
                    entry.metadata.variation_id.clone(),
                ),
            ],
        );
        services.tracking.add_activation(hit);
    }
}
