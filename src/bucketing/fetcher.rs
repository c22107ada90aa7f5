//! An HTTP client that fetches the bucketing file from the CDN.
use std::{sync::Arc, time::Duration};

use reqwest::{StatusCode, Url};

use crate::{
    bucketing::store::CachedManifest,
    http::{endpoint, HttpClient, HttpRequest},
    Error, Result,
};

const BUCKETING_FILE: &str = "bucketing.json";

const HEADER_IF_MODIFIED_SINCE: &str = "if-modified-since";
const HEADER_LAST_MODIFIED: &str = "last-modified";

/// Result of a conditional fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The server confirmed the cached manifest is current (`304`).
    NotModified,
    /// A new manifest and its validator.
    Modified(CachedManifest),
}

/// A client that fetches the bucketing file with conditional GET requests.
pub struct ManifestFetcher {
    http: Arc<dyn HttpClient>,
    url: Url,
    api_key: String,
    timeout: Duration,
    /// If we receive a 401/403 during a request, the environment or API key is not valid. We
    /// cache this error so we don't issue additional requests to the server.
    unauthorized: bool,
}

impl ManifestFetcher {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: &str,
        env_id: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<ManifestFetcher> {
        Ok(ManifestFetcher {
            http,
            url: endpoint(base_url, &[env_id, BUCKETING_FILE])?,
            api_key: api_key.into(),
            timeout,
            unauthorized: false,
        })
    }

    /// Fetch the bucketing file. `last_modified` is the validator of the manifest currently held,
    /// if any.
    pub async fn fetch(&mut self, last_modified: Option<&str>) -> Result<FetchOutcome> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        let mut request = HttpRequest::get(self.url.clone(), self.timeout).sdk_headers(&self.api_key);
        if let Some(last_modified) = last_modified {
            request = request.header(HEADER_IF_MODIFIED_SINCE, last_modified);
        }

        log::debug!(target: "flagship", "fetching bucketing file");
        let response = self.http.send(request).await?;

        let response = response.error_for_status().map_err(|err| {
            if matches!(err, Error::Unauthorized) {
                log::warn!(target: "flagship", "client is not authorized. Check your env_id and api_key");
                self.unauthorized = true;
            } else {
                log::warn!(target: "flagship", "received non-200 response while fetching the bucketing file: {:?}", err);
            }
            err
        })?;

        if response.status == StatusCode::NOT_MODIFIED {
            log::debug!(target: "flagship", "bucketing file not modified");
            return Ok(FetchOutcome::NotModified);
        }

        let raw: serde_json::Value = response.json()?;
        let manifest = CachedManifest::from_json(
            raw,
            response.header_str(HEADER_LAST_MODIFIED).map(str::to_owned),
        )?;

        log::debug!(target: "flagship", "successfully fetched bucketing file");

        Ok(FetchOutcome::Modified(manifest))
    }
}
