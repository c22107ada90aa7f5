use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    campaign::{index_flags, CampaignAssignment, FlagEntry},
    Context, ContextValue, Error,
};

/// Freshness of a visitor's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FlagStatus {
    #[display("NOT_FOUND")]
    NotFound,
    #[display("FETCH_REQUIRED({_0})")]
    FetchRequired(FetchFlagsRequiredStatusReason),
    #[display("FETCHING")]
    Fetching,
    #[display("FETCHED")]
    Fetched,
}

/// Why flags need a new fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FetchFlagsRequiredStatusReason {
    #[display("NEVER_FETCHED")]
    NeverFetched,
    #[display("CONTEXT_UPDATED")]
    ContextUpdated,
    #[display("AUTHENTICATED")]
    Authenticated,
    #[display("UNAUTHENTICATED")]
    Unauthenticated,
}

/// Notification sent to the listener registered with
/// [`VisitorBuilder::status_listener`](crate::VisitorBuilder::status_listener).
#[derive(Debug, Clone)]
pub enum VisitorEvent {
    StatusChanged {
        visitor_id: String,
        status: FlagStatus,
    },
    FetchRequired {
        visitor_id: String,
        reason: FetchFlagsRequiredStatusReason,
    },
    Fetched {
        visitor_id: String,
    },
    FetchFailed {
        visitor_id: String,
        error: Error,
    },
}

/// Mutable state of one visitor. Only touched under the visitor's state lock; transitions push
/// the events to send once the lock is released.
#[derive(Debug)]
pub(crate) struct VisitorState {
    pub visitor_id: String,
    pub anonymous_id: Option<String>,
    pub context: Context,
    pub consent: bool,
    pub status: FlagStatus,
    pub campaigns: Vec<CampaignAssignment>,
    pub flags: HashMap<String, FlagEntry>,
    pub assignments_history: HashMap<String, String>,
    /// Visitor context the current assignments were fetched with.
    pub fetched_context: Option<Context>,
    /// Flag keys already exposed since the last fetch.
    pub exposed: HashSet<String>,
    /// Whether the stale-read warning was logged since the last fetch.
    pub stale_warned: bool,
    /// Context last sent in a segment hit.
    pub segment_context: Option<Context>,
}

impl VisitorState {
    pub fn new(
        visitor_id: String,
        anonymous_id: Option<String>,
        context: Context,
        consent: bool,
    ) -> VisitorState {
        VisitorState {
            visitor_id,
            anonymous_id,
            context,
            consent,
            status: FlagStatus::NotFound,
            campaigns: Vec::new(),
            flags: HashMap::new(),
            assignments_history: HashMap::new(),
            fetched_context: None,
            exposed: HashSet::new(),
            stale_warned: false,
            segment_context: None,
        }
    }

    pub fn hash_key(&self) -> &str {
        self.anonymous_id.as_deref().unwrap_or(&self.visitor_id)
    }

    pub fn set_status(&mut self, status: FlagStatus, events: &mut Vec<VisitorEvent>) {
        if self.status == status {
            return;
        }
        self.status = status;
        events.push(VisitorEvent::StatusChanged {
            visitor_id: self.visitor_id.clone(),
            status,
        });
        match status {
            FlagStatus::FetchRequired(reason) => events.push(VisitorEvent::FetchRequired {
                visitor_id: self.visitor_id.clone(),
                reason,
            }),
            FlagStatus::Fetched => events.push(VisitorEvent::Fetched {
                visitor_id: self.visitor_id.clone(),
            }),
            FlagStatus::NotFound | FlagStatus::Fetching => {}
        }
    }

    /// Mark fetched flags stale if the context no longer matches the one they were fetched with.
    pub fn check_context(&mut self, events: &mut Vec<VisitorEvent>) {
        if self.status == FlagStatus::Fetched
            && self.fetched_context.as_ref() != Some(&self.context)
        {
            self.set_status(
                FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::ContextUpdated),
                events,
            );
        }
    }

    pub fn update_context(
        &mut self,
        values: impl IntoIterator<Item = (String, ContextValue)>,
        events: &mut Vec<VisitorEvent>,
    ) {
        self.context.extend(values);
        self.check_context(events);
    }

    pub fn clear_context(&mut self, events: &mut Vec<VisitorEvent>) {
        self.context.clear();
        self.check_context(events);
    }

    /// Returns `false` when `visitor_id` is already the custom id.
    pub fn authenticate(&mut self, visitor_id: String, events: &mut Vec<VisitorEvent>) -> bool {
        if self.anonymous_id.is_some() && self.visitor_id == visitor_id {
            return false;
        }
        if self.anonymous_id.is_none() {
            self.anonymous_id = Some(std::mem::replace(&mut self.visitor_id, visitor_id));
        } else {
            self.visitor_id = visitor_id;
        }
        self.set_status(
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::Authenticated),
            events,
        );
        true
    }

    /// Returns `false` when the visitor is not authenticated.
    pub fn unauthenticate(&mut self, events: &mut Vec<VisitorEvent>) -> bool {
        let Some(anonymous_id) = self.anonymous_id.take() else {
            return false;
        };
        self.visitor_id = anonymous_id;
        self.set_status(
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::Unauthenticated),
            events,
        );
        true
    }

    /// Replace the assignments with a decision result. `context` is the visitor context the
    /// decision was requested with.
    pub fn apply_campaigns(
        &mut self,
        campaigns: Vec<CampaignAssignment>,
        context: Context,
        events: &mut Vec<VisitorEvent>,
    ) {
        for campaign in &campaigns {
            self.assignments_history.insert(
                campaign.variation_group_id.clone(),
                campaign.variation_id.clone(),
            );
        }
        self.flags = index_flags(&campaigns);
        self.campaigns = campaigns;
        self.exposed.clear();
        self.stale_warned = false;
        self.fetched_context = Some(context);

        if self.fetched_context.as_ref() == Some(&self.context) {
            self.set_status(FlagStatus::Fetched, events);
        } else {
            self.set_status(
                FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::ContextUpdated),
                events,
            );
        }
    }

    /// Restore assignments from the visitor cache as best-available values.
    pub fn restore(&mut self, cached: CachedVisitor) {
        self.assignments_history = cached.assignments_history;
        self.flags = index_flags(&cached.campaigns);
        self.campaigns = cached.campaigns;
    }

    pub fn to_cached(&self) -> CachedVisitor {
        CachedVisitor {
            visitor_id: self.visitor_id.clone(),
            anonymous_id: self.anonymous_id.clone(),
            consent: self.consent,
            context: self.context.clone(),
            assignments_history: self.assignments_history.clone(),
            campaigns: self.campaigns.clone(),
        }
    }
}

pub(crate) const VISITOR_CACHE_VERSION: u32 = 1;

/// Versioned envelope stored through the [`VisitorCache`](crate::VisitorCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CachedVisitorEnvelope {
    pub version: u32,
    pub data: CachedVisitor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CachedVisitor {
    pub visitor_id: String,
    #[serde(default)]
    pub anonymous_id: Option<String>,
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub assignments_history: HashMap<String, String>,
    #[serde(default)]
    pub campaigns: Vec<CampaignAssignment>,
}

impl CachedVisitor {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(CachedVisitorEnvelope {
            version: VISITOR_CACHE_VERSION,
            data: self.clone(),
        })
    }

    /// Parse a cached entry. Entries of another version are ignored.
    pub fn from_json(value: serde_json::Value) -> serde_json::Result<Option<CachedVisitor>> {
        let envelope: CachedVisitorEnvelope = serde_json::from_value(value)?;
        Ok((envelope.version == VISITOR_CACHE_VERSION).then_some(envelope.data))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        CachedVisitor, FetchFlagsRequiredStatusReason, FlagStatus, VisitorEvent, VisitorState,
    };
    use crate::{campaign::CampaignAssignment, Context};

    fn fetched(context: Context) -> VisitorState {
        let mut state = VisitorState::new("visitor".to_owned(), None, context.clone(), true);
        state.apply_campaigns(Vec::new(), context, &mut Vec::new());
        assert_eq!(state.status, FlagStatus::Fetched);
        state
    }

    fn age(value: i32) -> Context {
        [("age".to_owned(), value.into())].into_iter().collect()
    }

    #[test]
    fn unchanged_context_keeps_fetched() {
        let mut state = fetched(age(30));
        let mut events = Vec::new();

        state.update_context([("age".to_owned(), 30.into())], &mut events);

        assert_eq!(state.status, FlagStatus::Fetched);
        assert!(events.is_empty());
    }

    #[test]
    fn changed_context_requires_fetch() {
        let mut state = fetched(age(30));
        let mut events = Vec::new();

        state.update_context([("age".to_owned(), 31.into())], &mut events);

        assert_eq!(
            state.status,
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::ContextUpdated)
        );
        assert!(matches!(
            events.as_slice(),
            [
                VisitorEvent::StatusChanged { .. },
                VisitorEvent::FetchRequired {
                    reason: FetchFlagsRequiredStatusReason::ContextUpdated,
                    ..
                }
            ]
        ));
    }

    #[test]
    fn authentication_always_requires_fetch() {
        let mut state = fetched(age(30));
        let mut events = Vec::new();

        assert!(state.authenticate("user-42".to_owned(), &mut events));
        assert_eq!(state.visitor_id, "user-42");
        assert_eq!(state.anonymous_id.as_deref(), Some("visitor"));
        assert_eq!(state.hash_key(), "visitor");
        assert_eq!(
            state.status,
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::Authenticated)
        );

        state.apply_campaigns(Vec::new(), age(30), &mut events);
        assert!(state.unauthenticate(&mut events));
        assert_eq!(state.visitor_id, "visitor");
        assert_eq!(state.anonymous_id, None);
        assert_eq!(
            state.status,
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::Unauthenticated)
        );
        assert!(!state.unauthenticate(&mut events));
    }

    #[test]
    fn fetch_with_outdated_context_stays_stale() {
        let mut state = VisitorState::new("visitor".to_owned(), None, age(31), true);
        let mut events = Vec::new();

        state.apply_campaigns(Vec::new(), age(30), &mut events);

        assert_eq!(
            state.status,
            FlagStatus::FetchRequired(FetchFlagsRequiredStatusReason::ContextUpdated)
        );
    }

    #[test]
    fn records_assignments_history() {
        let mut state = VisitorState::new("visitor".to_owned(), None, Context::new(), true);
        let campaign: CampaignAssignment = serde_json::from_value(json!({
            "campaignId": "c",
            "variationGroupId": "vg",
            "variationId": "v",
            "flags": {"title": "hello"}
        }))
        .unwrap();

        state.exposed.insert("title".to_owned());
        state.apply_campaigns(vec![campaign], Context::new(), &mut Vec::new());

        assert_eq!(state.assignments_history["vg"], "v");
        assert!(state.flags.contains_key("title"));
        assert!(state.exposed.is_empty());
    }

    #[test]
    fn cache_envelope_is_versioned() {
        let state = fetched(age(30));
        let json = state.to_cached().to_json().unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["data"]["visitorId"], "visitor");
        assert_eq!(json["data"]["context"]["age"], 30.0);

        let restored = CachedVisitor::from_json(json).unwrap().unwrap();
        assert_eq!(restored, state.to_cached());

        let other_version = json!({"version": 2, "data": {"visitorId": "visitor"}});
        assert_eq!(CachedVisitor::from_json(other_version).unwrap(), None);
    }
}
