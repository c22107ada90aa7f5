//! Analytics and telemetry records.
//!
//! A [`Hit`] is created once, with a fresh id and timestamp, and never changes afterwards. Its
//! serde form is what the [`HitCache`](crate::HitCache) stores; the wire form sent to the
//! collection endpoints is built by the `*_payload` methods.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Data source sent with every hit.
pub(crate) const DATA_SOURCE: &str = "APP";

/// Event action of the hit sent when consent toggles.
pub(crate) const CONSENT_ACTION: &str = "fs_consent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hit {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub visitor_id: String,
    pub anonymous_id: Option<String>,
    pub kind: HitKind,
}

/// What a hit records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitKind {
    Screen { location: String },
    Page { location: String },
    Event(Event),
    Transaction(Transaction),
    Item(Item),
    /// Exposure of a visitor to a variation.
    Activation(Activation),
    Consent { consent: bool },
    /// Visitor context snapshot.
    Segment { context: BTreeMap<String, String> },
    Troubleshooting(Diagnostic),
    Usage(Diagnostic),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    #[serde(rename = "Action Tracking")]
    ActionTracking,
    #[serde(rename = "User Engagement")]
    UserEngagement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub category: EventCategory,
    pub action: String,
    pub label: Option<String>,
    /// Must be a non-negative integer for the collection endpoint to accept it.
    pub value: Option<f64>,
}

impl Event {
    pub fn new(category: EventCategory, action: impl Into<String>) -> Event {
        Event {
            category,
            action: action.into(),
            label: None,
            value: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Event {
        self.label = Some(label.into());
        self
    }

    pub fn value(mut self, value: f64) -> Event {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub affiliation: String,
    pub revenue: Option<f64>,
    pub shipping: Option<f64>,
    pub taxes: Option<f64>,
    pub currency: Option<String>,
    pub coupon_code: Option<String>,
    pub payment_method: Option<String>,
    pub shipping_method: Option<String>,
    pub item_count: Option<u32>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, affiliation: impl Into<String>) -> Transaction {
        Transaction {
            id: id.into(),
            affiliation: affiliation.into(),
            ..Transaction::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    pub transaction_id: String,
    pub name: String,
    pub code: String,
    pub price: Option<f64>,
    pub quantity: Option<u32>,
    pub category: Option<String>,
}

impl Item {
    pub fn new(
        transaction_id: impl Into<String>,
        name: impl Into<String>,
        code: impl Into<String>,
    ) -> Item {
        Item {
            transaction_id: transaction_id.into(),
            name: name.into(),
            code: code.into(),
            ..Item::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub variation_group_id: String,
    pub variation_id: String,
    /// Flag whose read triggered the activation, if any.
    pub flag_key: Option<String>,
}

/// Troubleshooting or usage record: a label plus namespaced custom values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub label: String,
    pub values: BTreeMap<String, String>,
}

impl Hit {
    pub fn new(visitor_id: impl Into<String>, anonymous_id: Option<String>, kind: HitKind) -> Hit {
        Hit {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            visitor_id: visitor_id.into(),
            anonymous_id,
            kind,
        }
    }

    pub fn is_activation(&self) -> bool {
        matches!(self.kind, HitKind::Activation(_))
    }

    pub fn is_consent(&self) -> bool {
        matches!(self.kind, HitKind::Consent { .. })
    }

    /// Id of the stable (anonymous) journey. Equal to the visitor id until the visitor
    /// authenticates.
    pub fn stable_id(&self) -> &str {
        self.anonymous_id.as_deref().unwrap_or(&self.visitor_id)
    }

    /// Milliseconds elapsed between creation and `now`.
    pub(crate) fn queue_time(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds().max(0)
    }

    /// Entry of a `BATCH` request. Returns `None` for activations and diagnostics, which have
    /// their own endpoints.
    pub(crate) fn batch_entry(&self, now: DateTime<Utc>) -> Option<Value> {
        let mut entry = Map::new();
        entry.insert("vid".to_owned(), json!(self.stable_id()));
        if self.anonymous_id.is_some() {
            entry.insert("cuid".to_owned(), json!(self.visitor_id));
        }

        let (hit_type, fields) = match &self.kind {
            HitKind::Screen { location } => ("SCREENVIEW", json!({ "dl": location })),
            HitKind::Page { location } => ("PAGEVIEW", json!({ "dl": location })),
            HitKind::Event(event) => ("EVENT", event.fields()),
            HitKind::Transaction(transaction) => ("TRANSACTION", transaction.fields()),
            HitKind::Item(item) => ("ITEM", item.fields()),
            HitKind::Consent { consent } => (
                "EVENT",
                json!({
                    "ec": EventCategory::UserEngagement,
                    "ea": CONSENT_ACTION,
                    "el": format!("{}:{}", crate::http::SDK_NAME, consent),
                }),
            ),
            HitKind::Segment { context } => ("SEGMENT", json!({ "s": context })),
            HitKind::Activation(_) | HitKind::Troubleshooting(_) | HitKind::Usage(_) => {
                return None
            }
        };

        entry.insert("t".to_owned(), json!(hit_type));
        entry.insert("qt".to_owned(), json!(self.queue_time(now)));
        if let Value::Object(fields) = fields {
            entry.extend(fields.into_iter().filter(|(_, v)| !v.is_null()));
        }
        Some(Value::Object(entry))
    }

    /// Body of a single-hit request: a batch entry with the environment and data source.
    pub(crate) fn single_payload(&self, env_id: &str, now: DateTime<Utc>) -> Option<Value> {
        let mut entry = self.batch_entry(now)?;
        if let Value::Object(entry) = &mut entry {
            entry.insert("cid".to_owned(), json!(env_id));
            entry.insert("ds".to_owned(), json!(DATA_SOURCE));
        }
        Some(entry)
    }

    /// Entry of an activation batch.
    pub(crate) fn activation_entry(&self, now: DateTime<Utc>) -> Option<Value> {
        let HitKind::Activation(activation) = &self.kind else {
            return None;
        };
        let mut entry = Map::new();
        entry.insert("vid".to_owned(), json!(self.visitor_id));
        if let Some(anonymous_id) = &self.anonymous_id {
            entry.insert("aid".to_owned(), json!(anonymous_id));
        }
        entry.insert("caid".to_owned(), json!(activation.variation_group_id));
        entry.insert("vaid".to_owned(), json!(activation.variation_id));
        entry.insert("qt".to_owned(), json!(self.queue_time(now)));
        Some(Value::Object(entry))
    }

    /// Body of a troubleshooting or usage request.
    pub(crate) fn diagnostic_payload(&self, env_id: &str) -> Option<Value> {
        let (hit_type, diagnostic) = match &self.kind {
            HitKind::Troubleshooting(diagnostic) => ("TROUBLESHOOTING", diagnostic),
            HitKind::Usage(diagnostic) => ("USAGE", diagnostic),
            _ => return None,
        };

        let mut cv = Map::new();
        cv.insert("version".to_owned(), json!("1"));
        cv.insert("timestamp".to_owned(), json!(self.created_at.to_rfc3339()));
        cv.insert("label".to_owned(), json!(diagnostic.label));
        cv.insert("stack.type".to_owned(), json!("SDK"));
        cv.insert("stack.name".to_owned(), json!(crate::http::SDK_NAME));
        cv.insert("stack.version".to_owned(), json!(crate::http::SDK_VERSION));
        for (key, value) in &diagnostic.values {
            cv.insert(key.clone(), json!(value));
        }

        let mut payload = Map::new();
        payload.insert("visitorId".to_owned(), json!(self.visitor_id));
        if let Some(anonymous_id) = &self.anonymous_id {
            payload.insert("anonymousId".to_owned(), json!(anonymous_id));
        }
        payload.insert("cid".to_owned(), json!(env_id));
        payload.insert("ds".to_owned(), json!(DATA_SOURCE));
        payload.insert("t".to_owned(), json!(hit_type));
        payload.insert("cv".to_owned(), Value::Object(cv));
        Some(Value::Object(payload))
    }
}

impl Event {
    fn fields(&self) -> Value {
        json!({
            "ec": self.category,
            "ea": self.action,
            "el": self.label,
            "ev": self.value,
        })
    }
}

impl Transaction {
    fn fields(&self) -> Value {
        json!({
            "tid": self.id,
            "ta": self.affiliation,
            "tr": self.revenue,
            "ts": self.shipping,
            "tt": self.taxes,
            "tc": self.currency,
            "tcc": self.coupon_code,
            "pm": self.payment_method,
            "sm": self.shipping_method,
            "icn": self.item_count,
        })
    }
}

impl Item {
    fn fields(&self) -> Value {
        json!({
            "tid": self.transaction_id,
            "in": self.name,
            "ic": self.code,
            "ip": self.price,
            "iq": self.quantity,
            "iv": self.category,
        })
    }
}
