use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    bucketing::store::ManifestStore,
    decision::{DecisionRequest, DecisionResponse, DecisionSource},
    Error, Result,
};

/// Local decisions against the bucketing file currently held by the [`ManifestStore`].
pub struct BucketingDecision {
    store: Arc<ManifestStore>,
}

impl BucketingDecision {
    pub fn new(store: Arc<ManifestStore>) -> BucketingDecision {
        BucketingDecision { store }
    }
}

#[async_trait]
impl DecisionSource for BucketingDecision {
    async fn get_campaigns(&self, request: &DecisionRequest) -> Result<DecisionResponse> {
        // One snapshot for the whole evaluation, a concurrent poll cannot tear it.
        let Some(manifest) = self.store.get_manifest() else {
            log::warn!(target: "flagship",
                       visitor_id:display = request.visitor_id;
                       "fetching flags before the bucketing file has been fetched");
            return Err(Error::ConfigurationNotFetched);
        };

        if manifest.file.panic {
            return Ok(DecisionResponse {
                campaigns: Vec::new(),
                panic: true,
                account_settings: manifest.file.account_settings().cloned(),
            });
        }

        Ok(DecisionResponse {
            campaigns: manifest.file.eval(request),
            panic: false,
            account_settings: manifest.file.account_settings().cloned(),
        })
    }
}
