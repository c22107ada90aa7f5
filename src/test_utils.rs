//! Test doubles shared by the unit tests.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    cache::{BucketingCache, HitCache, VisitorCache},
    http::{HttpClient, HttpRequest, HttpResponse},
    status::{SdkStatus, StatusHandle},
    tracking::{sender::HitSender, troubleshooting::TroubleshootingReporter},
    Result,
};

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

/// [`HttpClient`] answering every request with a scripted responder and recording requests.
pub(crate) struct MockHttpClient {
    responder: Box<Responder>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpClient {
    pub fn new(
        responder: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<MockHttpClient> {
        Arc::new(MockHttpClient {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of recorded requests whose URL contains `fragment`.
    pub fn requests_matching(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.url.as_str().contains(fragment))
            .count()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = (self.responder)(&request);
        self.requests.lock().unwrap().push(request);
        response
    }
}

/// In-memory implementation of every cache collaborator.
#[derive(Default)]
pub(crate) struct MemoryCache {
    visitors: Mutex<HashMap<String, serde_json::Value>>,
    hits: Mutex<HashMap<String, serde_json::Value>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    hit_write_delay: Duration,
}

impl MemoryCache {
    /// A cache whose `cache_hits` takes `delay` to complete.
    pub fn with_hit_write_delay(delay: Duration) -> MemoryCache {
        MemoryCache {
            hit_write_delay: delay,
            ..MemoryCache::default()
        }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    pub fn visitor(&self, visitor_id: &str) -> Option<serde_json::Value> {
        self.visitors.lock().unwrap().get(visitor_id).cloned()
    }
}

#[async_trait]
impl VisitorCache for MemoryCache {
    async fn cache_visitor(&self, visitor_id: &str, data: serde_json::Value) -> Result<()> {
        self.visitors
            .lock()
            .unwrap()
            .insert(visitor_id.to_owned(), data);
        Ok(())
    }

    async fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.visitor(visitor_id))
    }

    async fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
        self.visitors.lock().unwrap().remove(visitor_id);
        Ok(())
    }
}

#[async_trait]
impl HitCache for MemoryCache {
    async fn cache_hits(&self, hits: HashMap<String, serde_json::Value>) -> Result<()> {
        if !self.hit_write_delay.is_zero() {
            tokio::time::sleep(self.hit_write_delay).await;
        }
        self.hits.lock().unwrap().extend(hits);
        Ok(())
    }

    async fn lookup_hits(&self) -> Result<HashMap<String, serde_json::Value>> {
        Ok(self.hits.lock().unwrap().clone())
    }

    async fn flush_hits(&self, hit_ids: &[String]) -> Result<()> {
        let mut hits = self.hits.lock().unwrap();
        for id in hit_ids {
            hits.remove(id);
        }
        Ok(())
    }

    async fn flush_all_hits(&self) -> Result<()> {
        self.hits.lock().unwrap().clear();
        Ok(())
    }
}

#[async_trait]
impl BucketingCache for MemoryCache {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(key).cloned())
    }

    async fn store(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.files.lock().unwrap().insert(key.to_owned(), data);
        Ok(())
    }
}

pub(crate) fn test_hit_sender(http: Arc<MockHttpClient>) -> HitSender {
    HitSender::new(
        http,
        "https://events.flagship.io",
        "https://decision.flagship.io/v2",
        "env",
        "key",
        Duration::from_secs(2),
    )
    .unwrap()
}

/// Reporter with troubleshooting disabled until account settings enable it.
pub(crate) fn test_troubleshooting(http: Arc<MockHttpClient>) -> Arc<TroubleshootingReporter> {
    Arc::new(
        TroubleshootingReporter::new(
            http,
            "https://events.flagship.io",
            "env",
            "key",
            Duration::from_secs(2),
            StatusHandle::new(SdkStatus::Initialized),
            true,
            "test-instance".to_owned(),
        )
        .unwrap(),
    )
}
