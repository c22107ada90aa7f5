//! Decision sources produce the campaign assignments of a visitor.
//!
//! Two interchangeable strategies exist: [`ApiDecision`] asks the decision API for every fetch,
//! [`BucketingDecision`] evaluates the polled bucketing file locally. Both surface failures as an
//! [`Error`](crate::Error) and never alter visitor state themselves.
use std::collections::HashMap;

use async_trait::async_trait;

use crate::{account_settings::AccountSettings, campaign::CampaignAssignment, Context, Result};

mod api;
mod bucketing;

pub use api::ApiDecision;
pub use bucketing::BucketingDecision;

/// Snapshot of a visitor taken when a fetch starts.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub visitor_id: String,
    pub anonymous_id: Option<String>,
    /// Effective context: visitor context merged with reserved keys.
    pub context: Context,
    /// `variationGroupId -> variationId` of previous assignments.
    pub assignments_history: HashMap<String, String>,
}

impl DecisionRequest {
    /// Key used for consistent hashing. Authenticated visitors keep hashing on their anonymous
    /// id so they stay in the same variations after logging in.
    pub fn hash_key(&self) -> &str {
        self.anonymous_id.as_deref().unwrap_or(&self.visitor_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionResponse {
    pub campaigns: Vec<CampaignAssignment>,
    /// Server-declared kill switch.
    pub panic: bool,
    pub account_settings: Option<AccountSettings>,
}

/// A strategy producing campaign assignments.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn get_campaigns(&self, request: &DecisionRequest) -> Result<DecisionResponse>;
}
