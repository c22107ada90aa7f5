use serde::{Deserialize, Serialize};

use crate::visitor::{FlagStatus, Visitor};

/// Campaign information of the variation a flag value comes from. Every field is empty for a
/// flag the visitor has no value for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagMetadata {
    pub campaign_id: String,
    pub campaign_name: Option<String>,
    pub variation_group_id: String,
    pub variation_id: String,
    pub is_reference: bool,
    pub campaign_type: String,
    pub slug: Option<String>,
}

impl FlagMetadata {
    pub fn exists(&self) -> bool {
        !self.campaign_id.is_empty() && !self.variation_group_id.is_empty()
    }
}

/// Types a flag value can be read as.
pub trait FlagValue: Clone + Send + Sync + 'static {
    /// Convert a JSON variation value. `None` when the value has another type.
    fn from_json(value: &serde_json::Value) -> Option<Self>;
}

impl FlagValue for String {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl FlagValue for bool {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FlagValue for f64 {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FlagValue for i64 {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        value.as_i64().or_else(|| {
            // JSON producers often serialize integers as `3.0`.
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        })
    }
}

impl FlagValue for serde_json::Value {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        Some(value.clone())
    }
}

/// A lazy view over one flag key of a visitor.
///
/// The value is looked up on every read, so a flag obtained before a fetch reflects the fetched
/// assignments afterwards. Reads never fail: they fall back to the default value.
///
/// ```no_run
/// # async fn run(visitor: flagship::Visitor) {
/// let title = visitor.get_flag("title", "Welcome".to_owned());
/// if title.exists() {
///     println!("{} ({:?})", title.value(true), title.metadata().variation_id);
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Flag<T> {
    visitor: Visitor,
    key: String,
    default: T,
}

impl<T: FlagValue> Flag<T> {
    pub(crate) fn new(visitor: Visitor, key: String, default: T) -> Flag<T> {
        Flag {
            visitor,
            key,
            default,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn default_value(&self) -> &T {
        &self.default
    }

    /// Whether the visitor's assignments hold this key.
    pub fn exists(&self) -> bool {
        self.visitor.flag_entry(&self.key).is_some()
    }

    /// Current value, or the default when the flag does not exist or has another type.
    ///
    /// With `expose` set, the first read after each fetch sends an activation for the variation
    /// the value comes from.
    pub fn value(&self, expose: bool) -> T {
        self.visitor.flag_value(&self.key, &self.default, expose)
    }

    /// Send the activation of this flag without reading it.
    pub fn visitor_exposed(&self) {
        self.visitor.expose_flag::<T>(&self.key);
    }

    pub fn metadata(&self) -> FlagMetadata {
        self.visitor
            .flag_entry(&self.key)
            .map(|entry| entry.metadata)
            .unwrap_or_default()
    }

    /// Visitor status, or [`FlagStatus::NotFound`] for a fetched visitor lacking this flag.
    pub fn status(&self) -> FlagStatus {
        match self.visitor.flag_status() {
            FlagStatus::Fetched if !self.exists() => FlagStatus::NotFound,
            status => status,
        }
    }
}
