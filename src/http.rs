//! HTTP transport used for decisions, bucketing polls and hit delivery.
//!
//! The SDK talks to the network only through the [`HttpClient`] trait, so hosts can plug their own
//! transport. [`ReqwestHttpClient`] is the default implementation.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Method, StatusCode, Url};

use crate::{Error, Result};

/// Header carrying the API key.
pub(crate) const HEADER_API_KEY: &str = "x-api-key";
/// Header carrying the SDK name.
pub(crate) const HEADER_SDK_CLIENT: &str = "x-sdk-client";
/// Header carrying the SDK version.
pub(crate) const HEADER_SDK_VERSION: &str = "x-sdk-version";

pub(crate) const SDK_NAME: &str = "rust";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A request handed to an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
    /// JSON body. `None` for GET requests.
    pub body: Option<serde_json::Value>,
    /// The request fails with [`Error::Timeout`] once this duration elapses.
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn get(url: Url, timeout: Duration) -> HttpRequest {
        HttpRequest {
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn post(url: Url, body: serde_json::Value, timeout: Duration) -> HttpRequest {
        HttpRequest {
            method: Method::POST,
            url,
            headers: Vec::new(),
            body: Some(body),
            timeout,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> HttpRequest {
        self.headers.push((name, value.into()));
        self
    }

    /// Add the API key and SDK identification headers.
    pub(crate) fn sdk_headers(self, api_key: &str) -> HttpRequest {
        self.header(HEADER_API_KEY, api_key)
            .header(HEADER_SDK_CLIENT, SDK_NAME)
            .header(HEADER_SDK_VERSION, SDK_VERSION)
    }
}

/// A response returned by an [`HttpClient`]. Any status code is a valid response; transport
/// failures are reported as errors instead.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> HttpResponse {
        HttpResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Return the response itself for 2xx (and 304) responses, or the matching error.
    pub fn error_for_status(self) -> Result<HttpResponse> {
        let status = self.status;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(self)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(Error::Unauthorized)
        } else {
            Err(Error::Status(status))
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// The transport collaborator.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> ReqwestHttpClient {
        ReqwestHttpClient::default()
    }

    pub fn with_client(client: reqwest::Client) -> ReqwestHttpClient {
        ReqwestHttpClient { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Parse `base` and append path `segments`, e.g. `endpoint("https://x.io/v2", &["env", "campaigns"])`.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url> {
    let base = base.trim_end_matches('/');
    let joined = std::iter::once(base)
        .chain(segments.iter().copied())
        .collect::<Vec<_>>()
        .join("/");
    Url::parse(&joined).map_err(Error::InvalidBaseUrl)
}
