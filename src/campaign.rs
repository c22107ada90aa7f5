use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::flag::FlagMetadata;

/// Variation-level changes: a map of flag key to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifications {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: BTreeMap<String, serde_json::Value>,
}

/// The variation a visitor was assigned to in one campaign. Immutable once produced by a
/// decision; a new decision replaces the whole set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignAssignment {
    pub campaign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_name: Option<String>,
    pub variation_group_id: String,
    pub variation_id: String,
    #[serde(default)]
    pub is_reference: bool,
    #[serde(rename = "type", default)]
    pub campaign_type: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, serde_json::Value>,
}

impl CampaignAssignment {
    fn metadata(&self) -> FlagMetadata {
        FlagMetadata {
            campaign_id: self.campaign_id.clone(),
            campaign_name: self.campaign_name.clone(),
            variation_group_id: self.variation_group_id.clone(),
            variation_id: self.variation_id.clone(),
            is_reference: self.is_reference,
            campaign_type: self.campaign_type.clone(),
            slug: self.slug.clone(),
        }
    }
}

/// A flag value together with the assignment it comes from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FlagEntry {
    pub value: serde_json::Value,
    pub metadata: FlagMetadata,
}

/// Index assignments by flag key. When several campaigns carry the same key, the first campaign
/// in decision order wins.
pub(crate) fn index_flags(campaigns: &[CampaignAssignment]) -> HashMap<String, FlagEntry> {
    let mut flags = HashMap::new();
    for campaign in campaigns {
        for (key, value) in &campaign.flags {
            flags.entry(key.clone()).or_insert_with(|| FlagEntry {
                value: value.clone(),
                metadata: campaign.metadata(),
            });
        }
    }
    flags
}
