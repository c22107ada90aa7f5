//! Troubleshooting and usage telemetry.
//!
//! A low-priority hit stream with its own queue and flush task, so it never blocks nor is blocked
//! by the tracking queues. Troubleshooting reports are only produced while the account settings
//! enable them for the current time window and traffic share. Sends that fail are dropped.
use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::Utc;
use reqwest::Url;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    account_settings::{AccountSettings, TroubleshootingSettings},
    hit::{Diagnostic, Hit, HitKind},
    http::{endpoint, HttpClient, HttpRequest},
    sharder::allocate,
    status::StatusHandle,
    tracking::queue::HitQueue,
    Result,
};

const TROUBLESHOOTING_PATH: &str = "troubleshooting";
const USAGE_PATH: &str = "analytics";

/// Reports beyond this many pending ones are dropped.
pub(crate) const MAX_PENDING_REPORTS: usize = 100;

/// Share of SDK instances, in percent, sending usage reports.
pub(crate) const USAGE_TRAFFIC: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TroubleshootingLabel {
    #[display("VISITOR_FETCH_CAMPAIGNS")]
    VisitorFetchCampaigns,
    #[display("VISITOR_FETCH_CAMPAIGNS_ERROR")]
    VisitorFetchCampaignsError,
    #[display("VISITOR_AUTHENTICATE")]
    VisitorAuthenticate,
    #[display("VISITOR_UNAUTHENTICATE")]
    VisitorUnauthenticate,
    #[display("VISITOR_SEND_HIT")]
    VisitorSendHit,
    #[display("VISITOR_SEND_ACTIVATE")]
    VisitorSendActivate,
    #[display("GET_FLAG_VALUE_FLAG_NOT_FOUND")]
    GetFlagValueFlagNotFound,
    #[display("GET_FLAG_VALUE_TYPE_WARNING")]
    GetFlagValueTypeWarning,
    #[display("SDK_BUCKETING_FILE")]
    SdkBucketingFile,
    #[display("SDK_BUCKETING_FILE_ERROR")]
    SdkBucketingFileError,
    #[display("SEND_BATCH_HIT_ROUTE_RESPONSE_ERROR")]
    SendBatchHitRouteResponseError,
    #[display("SEND_ACTIVATE_HIT_ROUTE_ERROR")]
    SendActivateHitRouteError,
    #[display("SDK_CONFIG")]
    SdkConfig,
}

pub(crate) struct TroubleshootingReporter {
    http: Arc<dyn HttpClient>,
    env_id: String,
    api_key: String,
    troubleshooting_url: Url,
    usage_url: Url,
    timeout: Duration,
    /// Identifies this SDK instance in SDK-level reports.
    instance_id: String,
    settings: RwLock<Option<TroubleshootingSettings>>,
    queue: HitQueue,
    status: StatusHandle,
    disable_usage: bool,
}

impl TroubleshootingReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Arc<dyn HttpClient>,
        events_url: &str,
        env_id: &str,
        api_key: &str,
        timeout: Duration,
        status: StatusHandle,
        disable_usage: bool,
        instance_id: String,
    ) -> Result<TroubleshootingReporter> {
        Ok(TroubleshootingReporter {
            http,
            env_id: env_id.to_owned(),
            api_key: api_key.to_owned(),
            troubleshooting_url: endpoint(events_url, &[TROUBLESHOOTING_PATH])?,
            usage_url: endpoint(events_url, &[USAGE_PATH])?,
            timeout,
            instance_id,
            settings: RwLock::new(None),
            queue: HitQueue::new(),
            status,
            disable_usage,
        })
    }

    /// Apply the troubleshooting window of the latest account settings. `None` disables
    /// troubleshooting.
    pub fn set_account_settings(&self, account_settings: Option<&AccountSettings>) {
        let settings = account_settings.and_then(|it| it.troubleshooting.clone());
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn includes(&self, hash_key: &str) -> bool {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|settings| settings.includes(hash_key, Utc::now()))
    }

    /// Report an event concerning one visitor.
    pub fn report_visitor(
        &self,
        visitor_id: &str,
        anonymous_id: Option<&str>,
        label: TroubleshootingLabel,
        values: impl IntoIterator<Item = (String, String)>,
    ) {
        if !self.includes(anonymous_id.unwrap_or(visitor_id)) {
            return;
        }
        let mut values: BTreeMap<String, String> = values.into_iter().collect();
        values.insert("visitor.visitorId".to_owned(), visitor_id.to_owned());
        if let Some(anonymous_id) = anonymous_id {
            values.insert("visitor.anonymousId".to_owned(), anonymous_id.to_owned());
        }
        self.enqueue(Hit::new(
            visitor_id,
            anonymous_id.map(str::to_owned),
            HitKind::Troubleshooting(Diagnostic {
                label: label.to_string(),
                values,
            }),
        ));
    }

    /// Report an event concerning the SDK instance itself.
    pub fn report_sdk(
        &self,
        label: TroubleshootingLabel,
        values: impl IntoIterator<Item = (String, String)>,
    ) {
        if !self.includes(&self.instance_id) {
            return;
        }
        self.enqueue(Hit::new(
            self.instance_id.clone(),
            None,
            HitKind::Troubleshooting(Diagnostic {
                label: label.to_string(),
                values: values.into_iter().collect(),
            }),
        ));
    }

    /// Report how the SDK is used. Sampled per instance.
    pub fn report_usage(
        &self,
        label: TroubleshootingLabel,
        values: impl IntoIterator<Item = (String, String)>,
    ) {
        if self.disable_usage || allocate(&self.instance_id) >= USAGE_TRAFFIC {
            return;
        }
        self.enqueue(Hit::new(
            self.instance_id.clone(),
            None,
            HitKind::Usage(Diagnostic {
                label: label.to_string(),
                values: values.into_iter().collect(),
            }),
        ));
    }

    fn enqueue(&self, hit: Hit) {
        if self.status.is_panic() {
            return;
        }
        if self.queue.len() >= MAX_PENDING_REPORTS {
            log::debug!(target: "flagship", "troubleshooting queue is full, dropping report");
            return;
        }
        self.queue.push(hit);
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Send every pending report.
    pub async fn flush(&self) {
        if self.status.is_panic() {
            return;
        }
        for hit in self.queue.poll(MAX_PENDING_REPORTS) {
            let Some(body) = hit.diagnostic_payload(&self.env_id) else {
                continue;
            };
            let url = match hit.kind {
                HitKind::Usage(_) => self.usage_url.clone(),
                _ => self.troubleshooting_url.clone(),
            };
            let request = HttpRequest::post(url, body, self.timeout).sdk_headers(&self.api_key);
            let result = match self.http.send(request).await {
                Ok(response) => response.error_for_status().map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                log::debug!(target: "flagship", "dropping troubleshooting report: {:?}", err);
            }
        }
    }

    /// Spawn the task sending pending reports every `period` until `stop` is notified.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        period: Duration,
        stop: Arc<Notify>,
    ) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => reporter.flush().await,
                    _ = stop.notified() => {
                        reporter.flush().await;
                        return;
                    }
                }
            }
        })
    }
}
