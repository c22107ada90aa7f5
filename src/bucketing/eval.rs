//! Local campaign evaluation against a bucketing file.
use std::collections::HashMap;

use crate::{
    bucketing::{BucketingFile, Campaign, Variation, VariationGroup},
    campaign::CampaignAssignment,
    decision::DecisionRequest,
    sharder::allocate_or_random,
    Context,
};

impl BucketingFile {
    /// Evaluate every campaign for the visitor described by `request`, in file order.
    pub fn eval(&self, request: &DecisionRequest) -> Vec<CampaignAssignment> {
        let hash_key = request.hash_key();
        self.campaigns
            .iter()
            .filter_map(|campaign| Option::<&Campaign>::from(campaign))
            .filter_map(|campaign| {
                campaign.eval(hash_key, &request.context, &request.assignments_history)
            })
            .collect()
    }
}

impl Campaign {
    /// Returns the assignment of the visitor, or `None` if the visitor is excluded by targeting,
    /// traffic or allocation.
    pub fn eval(
        &self,
        hash_key: &str,
        context: &Context,
        assignments_history: &HashMap<String, String>,
    ) -> Option<CampaignAssignment> {
        let group = self
            .variation_groups
            .iter()
            .find(|group| group.targeting.eval(context))?;

        if !self.is_in_traffic(hash_key) {
            log::trace!(target: "flagship",
                        campaign_id:display = self.id,
                        hash_key;
                        "visitor excluded by campaign traffic");
            return None;
        }

        let variation = group.select_variation(hash_key, assignments_history)?;

        Some(CampaignAssignment {
            campaign_id: self.id.clone(),
            campaign_name: self.name.clone(),
            variation_group_id: group.id.clone(),
            variation_id: variation.id.clone(),
            is_reference: variation.reference,
            campaign_type: self.campaign_type.clone(),
            slug: self.slug.clone(),
            flags: variation.modifications.value.clone(),
        })
    }

    fn is_in_traffic(&self, hash_key: &str) -> bool {
        match self.traffic {
            None => true,
            Some(traffic) => {
                (allocate_or_random(Some(&format!("{}{}", self.id, hash_key))) as f64) < traffic
            }
        }
    }
}

impl VariationGroup {
    /// Pick the visitor's variation: the previously assigned one if it still exists, otherwise by
    /// cumulative allocation over the visitor's bucket.
    pub fn select_variation(
        &self,
        hash_key: &str,
        assignments_history: &HashMap<String, String>,
    ) -> Option<&Variation> {
        if let Some(variation_id) = assignments_history.get(&self.id) {
            if let Some(variation) = self.variations.iter().find(|v| &v.id == variation_id) {
                return Some(variation);
            }
        }

        let bucket = allocate_or_random(Some(&format!("{}{}", self.id, hash_key))) as f64;
        let mut cumulative = 0.0;
        for variation in &self.variations {
            if variation.allocation <= 0.0 {
                continue;
            }
            cumulative += variation.allocation;
            if bucket < cumulative {
                return Some(variation);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use crate::{bucketing::BucketingFile, decision::DecisionRequest, Context};

    fn file() -> BucketingFile {
        serde_json::from_value(json!({
            "campaigns": [
                {
                    "id": "campaign-1",
                    "type": "ab",
                    "slug": "adult-title",
                    "variationGroups": [{
                        "id": "vgroup-1",
                        "targeting": {"targetingGroups": [{"targetings": [
                            {"key": "age", "operator": "GREATER_THAN", "value": 18}
                        ]}]},
                        "variations": [
                            {"id": "original", "reference": true, "allocation": 0,
                             "modifications": {"type": "JSON", "value": {"title": "original"}}},
                            {"id": "var-1", "allocation": 100,
                             "modifications": {"type": "JSON", "value": {"title": "Hello adult"}}}
                        ]
                    }]
                },
                {
                    "id": "campaign-2",
                    "type": "ab",
                    "variationGroups": [{
                        "id": "vgroup-2",
                        "targeting": {"targetingGroups": [{"targetings": [
                            {"key": "fs_all_users", "operator": "EQUALS", "value": ""}
                        ]}]},
                        "variations": [
                            {"id": "a", "reference": true, "allocation": 50,
                             "modifications": {"type": "JSON", "value": {"color": "red"}}},
                            {"id": "b", "allocation": 50,
                             "modifications": {"type": "JSON", "value": {"color": "blue"}}}
                        ]
                    }]
                },
                {"broken": true}
            ]
        }))
        .unwrap()
    }

    fn request(visitor_id: &str, age: i32) -> DecisionRequest {
        DecisionRequest {
            visitor_id: visitor_id.to_owned(),
            anonymous_id: None,
            context: [("age".to_owned(), age.into())].into_iter().collect::<Context>(),
            assignments_history: HashMap::new(),
        }
    }

    #[test]
    fn targeted_full_allocation() {
        let assignments = file().eval(&request("visitor-30", 30));

        assert_eq!(assignments.len(), 2);
        let first = &assignments[0];
        assert_eq!(first.campaign_id, "campaign-1");
        assert_eq!(first.variation_group_id, "vgroup-1");
        assert_eq!(first.variation_id, "var-1");
        assert!(!first.is_reference);
        assert_eq!(first.slug.as_deref(), Some("adult-title"));
        assert_eq!(first.flags["title"], json!("Hello adult"));
    }

    #[test]
    fn untargeted_visitor_is_excluded() {
        let assignments = file().eval(&request("visitor-12", 12));
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].campaign_id, "campaign-2");
    }

    #[test]
    fn allocation_is_deterministic() {
        let file = file();
        let first = file.eval(&request("visitor-7", 20));
        for _ in 0..10 {
            assert_eq!(file.eval(&request("visitor-7", 20)), first);
        }
    }

    #[test]
    fn authenticated_visitors_hash_on_anonymous_id() {
        let file = file();
        let anonymous = file.eval(&request("anon-1", 20));

        let mut authenticated = request("user@example.com", 20);
        authenticated.anonymous_id = Some("anon-1".to_owned());
        let logged_in = file.eval(&authenticated);

        assert_eq!(anonymous[1].variation_id, logged_in[1].variation_id);
    }

    #[test]
    fn history_is_preferred() {
        let file = file();
        let current = file.eval(&request("visitor-7", 20))[1].variation_id.clone();
        let other = if current == "a" { "b" } else { "a" };

        let mut req = request("visitor-7", 20);
        req.assignments_history
            .insert("vgroup-2".to_owned(), other.to_owned());
        assert_eq!(file.eval(&req)[1].variation_id, other);

        // Unknown history entries are ignored.
        req.assignments_history
            .insert("vgroup-2".to_owned(), "deleted".to_owned());
        assert_eq!(file.eval(&req)[1].variation_id, current);
    }

    #[test]
    fn partial_allocation_can_exclude() {
        let file: BucketingFile = serde_json::from_value(json!({
            "campaigns": [{
                "id": "c",
                "type": "ab",
                "variationGroups": [{
                    "id": "vgroup-1",
                    "targeting": {"targetingGroups": [{"targetings": [
                        {"key": "fs_all_users", "operator": "EQUALS", "value": ""}
                    ]}]},
                    "variations": [
                        {"id": "only", "allocation": 5, "modifications": {"value": {"k": 1}}}
                    ]
                }]
            }]
        }))
        .unwrap();

        // allocate("vgroup-1visitor-30") == 9, beyond the 5% allocated.
        assert!(file.eval(&request("visitor-30", 1)).is_empty());
    }

    #[test]
    fn campaign_traffic_gates_visitors() {
        let file: BucketingFile = serde_json::from_value(json!({
            "campaigns": [{
                "id": "campaign-1",
                "type": "ab",
                "traffic": 20,
                "variationGroups": [{
                    "id": "vgroup-1",
                    "targeting": {"targetingGroups": [{"targetings": [
                        {"key": "fs_all_users", "operator": "EQUALS", "value": ""}
                    ]}]},
                    "variations": [
                        {"id": "only", "allocation": 100, "modifications": {"value": {"k": 1}}}
                    ]
                }]
            }]
        }))
        .unwrap();

        // allocate("campaign-1visitor-30") == 29, outside the 20% of traffic.
        assert!(file.eval(&request("visitor-30", 1)).is_empty());
    }
}
