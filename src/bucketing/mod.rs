//! Bucketing file: the polled manifest that allows deciding campaigns locally.
//!
//! [`ManifestFetcher`](fetcher::ManifestFetcher) downloads it with conditional requests,
//! [`ManifestStore`](store::ManifestStore) holds the active version,
//! [`ManifestPoller`](poller::ManifestPoller) keeps it fresh, and [`eval`] turns it into
//! campaign assignments for a visitor.
use serde::{Deserialize, Serialize};

use crate::{account_settings::AccountSettings, campaign::Modifications, targeting::TargetingGroups};

pub mod eval;
pub mod fetcher;
pub mod poller;
pub mod store;

/// The bucketing file as served by the CDN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketingFile {
    /// Kill switch set from the dashboard.
    #[serde(default)]
    pub panic: bool,
    #[serde(default)]
    pub campaigns: Vec<TryParse<Campaign>>,
    #[serde(default)]
    pub account_settings: Option<TryParse<AccountSettings>>,
}

impl BucketingFile {
    /// Account settings, unless absent or malformed.
    pub fn account_settings(&self) -> Option<&AccountSettings> {
        self.account_settings.as_ref().and_then(Option::from)
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub campaign_type: String,
    #[serde(default)]
    pub slug: Option<String>,
    /// Share of targeted visitors entering the campaign, `0..=100`. Absent means everybody.
    #[serde(default)]
    pub traffic: Option<f64>,
    #[serde(default)]
    pub variation_groups: Vec<VariationGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationGroup {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub targeting: TargetingGroups,
    #[serde(default)]
    pub variations: Vec<Variation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub reference: bool,
    /// Share of the variation group traffic, `0..=100`.
    #[serde(default)]
    pub allocation: f64,
    #[serde(default)]
    pub modifications: Modifications,
}

#[cfg(test)]
mod tests {
    use super::{BucketingFile, TryParse};

    #[test]
    fn parse_partially_if_unexpected() {
        let file: BucketingFile = serde_json::from_str(
            r#"
              {
                "campaigns": [
                  {
                    "id": "success",
                    "type": "ab",
                    "variationGroups": []
                  },
                  {
                    "type": "ab",
                    "variationGroups": "not a list"
                  }
                ],
                "accountSettings": { "enabledXPC": true }
              }
            "#,
        )
        .unwrap();

        assert!(!file.panic);
        assert!(matches!(file.campaigns[0], TryParse::Parsed(_)));
        assert!(matches!(file.campaigns[1], TryParse::ParseFailed(_)));
        assert!(file.account_settings().unwrap().enabled_xpc);
    }

    #[test]
    fn malformed_account_settings_keep_campaigns() {
        let file: BucketingFile = serde_json::from_str(
            r#"
              {
                "campaigns": [{"id": "c1", "type": "ab", "variationGroups": []}],
                "accountSettings": {
                  "troubleshooting": {"startDate": "yesterday", "endDate": "2024-01-02T00:00:00Z", "traffic": "all"}
                }
              }
            "#,
        )
        .unwrap();

        assert!(matches!(file.campaigns[0], TryParse::Parsed(_)));
        assert!(matches!(file.account_settings, Some(TryParse::ParseFailed(_))));
        assert!(file.account_settings().is_none());
    }

    #[test]
    fn parse_panic_file() {
        let file: BucketingFile = serde_json::from_str(r#"{"panic": true}"#).unwrap();
        assert!(file.panic);
        assert!(file.campaigns.is_empty());
    }
}
