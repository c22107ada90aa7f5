use std::{collections::BTreeMap, fmt};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::http::{SDK_NAME, SDK_VERSION};

/// Visitor context used for targeting: ordered key-value pairs with case-sensitive keys.
///
/// # Examples
/// ```
/// # use flagship::{Context, ContextValue};
/// let context = [
///     ("age".to_owned(), 30.into()),
///     ("is_vip".to_owned(), true.into()),
///     ("plan".to_owned(), "premium".into()),
/// ].into_iter().collect::<Context>();
/// ```
pub type Context = BTreeMap<String, ContextValue>;

/// A single context value. Integers are widened to `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum ContextValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl ContextValue {
    /// Convert a JSON scalar to a context value. Arrays, objects and nulls have no counterpart.
    pub fn from_json(value: &serde_json::Value) -> Option<ContextValue> {
        match value {
            serde_json::Value::Bool(b) => Some(ContextValue::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(ContextValue::Number),
            serde_json::Value::String(s) => Some(ContextValue::String(s.clone())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ContextValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn same_type(&self, other: &ContextValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Boolean(b) => write!(f, "{b}"),
            ContextValue::Number(n) => write!(f, "{n}"),
            ContextValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for ContextValue {
    fn from(value: u32) -> Self {
        Self::Number(value.into())
    }
}

/// Keys populated by the SDK itself.
pub mod preset {
    /// SDK name.
    pub const FS_CLIENT: &str = "fs_client";
    /// SDK version.
    pub const FS_VERSION: &str = "fs_version";
    /// Current visitor id.
    pub const FS_USERS: &str = "fs_users";
}

/// Supplies device/app facts (locale, OS, app version, ...) merged read-only into every visitor
/// context. Keys it returns are reserved: the SDK overwrites them on each evaluation unless the
/// visitor context holds a value of the same type for that key.
pub trait ContextProvider: Send + Sync {
    fn context(&self) -> Context;
}

impl<T: Fn() -> Context + Send + Sync> ContextProvider for T {
    fn context(&self) -> Context {
        self()
    }
}

/// Merge the visitor context over the reserved facts and return the context used for decisions.
pub(crate) fn effective_context(
    visitor_id: &str,
    user_context: &Context,
    provider: Option<&dyn ContextProvider>,
) -> Context {
    let mut reserved = provider.map(|p| p.context()).unwrap_or_default();
    reserved.insert(preset::FS_CLIENT.to_owned(), SDK_NAME.into());
    reserved.insert(preset::FS_VERSION.to_owned(), SDK_VERSION.into());
    reserved.insert(preset::FS_USERS.to_owned(), visitor_id.into());

    let mut context = reserved.clone();
    for (key, value) in user_context {
        match reserved.get(key) {
            Some(sdk_value) if !sdk_value.same_type(value) => {
                log::warn!(target: "flagship",
                           context_key:display = key;
                           "ignoring override of a reserved context key with a different type");
            }
            _ => {
                context.insert(key.clone(), value.clone());
            }
        }
    }
    context
}
