//! Delivery of hits to the collection endpoints.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};

use crate::{
    hit::{Hit, DATA_SOURCE},
    http::{endpoint, HttpClient, HttpRequest},
    Result,
};

const ACTIVATE_PATH: &str = "activate";

pub(crate) struct HitSender {
    http: Arc<dyn HttpClient>,
    env_id: String,
    api_key: String,
    events_url: Url,
    activate_url: Url,
    timeout: Duration,
}

impl HitSender {
    pub fn new(
        http: Arc<dyn HttpClient>,
        events_url: &str,
        decision_url: &str,
        env_id: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<HitSender> {
        Ok(HitSender {
            http,
            env_id: env_id.to_owned(),
            api_key: api_key.to_owned(),
            events_url: endpoint(events_url, &[])?,
            activate_url: endpoint(decision_url, &[ACTIVATE_PATH])?,
            timeout,
        })
    }

    /// Send analytics hits as one `BATCH` request. Activations and diagnostics are skipped.
    pub async fn send_batch(&self, hits: &[Hit]) -> Result<()> {
        let now = Utc::now();
        let entries: Vec<Value> = hits.iter().filter_map(|hit| hit.batch_entry(now)).collect();
        if entries.is_empty() {
            return Ok(());
        }

        let body = json!({
            "t": "BATCH",
            "cid": self.env_id,
            "ds": DATA_SOURCE,
            "h": entries,
        });
        log::debug!(target: "flagship", hits = entries.len(); "sending hit batch");
        self.post(self.events_url.clone(), body).await
    }

    /// Send one analytics hit without the batch wrapper.
    pub async fn send_single(&self, hit: &Hit) -> Result<()> {
        match hit.single_payload(&self.env_id, Utc::now()) {
            Some(body) => self.post(self.events_url.clone(), body).await,
            None if hit.is_activation() => self.send_activations(std::slice::from_ref(hit)).await,
            None => Ok(()),
        }
    }

    pub async fn send_activations(&self, hits: &[Hit]) -> Result<()> {
        let now = Utc::now();
        let batch: Vec<Value> = hits
            .iter()
            .filter_map(|hit| hit.activation_entry(now))
            .collect();
        if batch.is_empty() {
            return Ok(());
        }

        let body = json!({
            "cid": self.env_id,
            "batch": batch,
        });
        log::debug!(target: "flagship", activations = batch.len(); "sending activation batch");
        self.post(self.activate_url.clone(), body).await
    }

    async fn post(&self, url: Url, body: Value) -> Result<()> {
        let request = HttpRequest::post(url, body, self.timeout).sdk_headers(&self.api_key);
        self.http.send(request).await?.error_for_status()?;
        Ok(())
    }
}
