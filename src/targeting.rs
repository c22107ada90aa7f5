//! Targeting rules: comparison operators and the OR-of-AND targeting tree found in bucketing files.
use serde::{Deserialize, Serialize};

use crate::{context::ContextValue, Context};

/// Targeting key matching every visitor.
const FS_ALL_USERS: &str = "fs_all_users";

/// Targeting groups are combined with OR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingGroups {
    #[serde(default)]
    pub targeting_groups: Vec<TargetingGroup>,
}

impl TargetingGroups {
    /// Returns `true` if at least one group matches. An empty tree matches nobody.
    pub fn eval(&self, context: &Context) -> bool {
        self.targeting_groups.iter().any(|group| group.eval(context))
    }
}

/// Targetings within a group are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetingGroup {
    #[serde(default)]
    pub targetings: Vec<Targeting>,
}

impl TargetingGroup {
    pub fn eval(&self, context: &Context) -> bool {
        !self.targetings.is_empty() && self.targetings.iter().all(|t| t.eval(context))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Targeting {
    pub fn eval(&self, context: &Context) -> bool {
        if self.key == FS_ALL_USERS {
            return true;
        }
        let Some(context_value) = context.get(&self.key) else {
            return false;
        };

        match &self.value {
            serde_json::Value::Array(values) => {
                let mut matches = values.iter().filter_map(ContextValue::from_json).peekable();
                if self.operator.is_negative() {
                    // Negative operators must hold for every listed value, and there must be one.
                    matches.peek().is_some()
                        && matches.all(|v| compare(self.operator, context_value, &v))
                } else {
                    matches.any(|v| compare(self.operator, context_value, &v))
                }
            }
            value => ContextValue::from_json(value)
                .is_some_and(|v| compare(self.operator, context_value, &v)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LowerThan,
    GreaterThanOrEquals,
    LowerThanOrEquals,
    StartsWith,
    EndsWith,
    /// Operator not supported by this version of the SDK. Never matches.
    #[serde(other)]
    Unknown,
}

impl Operator {
    fn is_negative(self) -> bool {
        matches!(self, Operator::NotEquals | Operator::NotContains)
    }
}

/// Apply `operator` to the visitor's `context_value` and the rule's `rule_value`. Returns `false`
/// if the operator cannot be applied to these operand types.
pub fn compare(operator: Operator, context_value: &ContextValue, rule_value: &ContextValue) -> bool {
    try_compare(operator, context_value, rule_value).unwrap_or(false)
}

/// Try applying `operator`, returning `None` if operands cannot be compared.
fn try_compare(
    operator: Operator,
    context_value: &ContextValue,
    rule_value: &ContextValue,
) -> Option<bool> {
    use ContextValue::{Number, String};

    match operator {
        Operator::Equals => Some(equals(context_value, rule_value)),
        Operator::NotEquals => Some(!equals(context_value, rule_value)),

        Operator::GreaterThan
        | Operator::LowerThan
        | Operator::GreaterThanOrEquals
        | Operator::LowerThanOrEquals => {
            let ordering = match (context_value, rule_value) {
                (Number(a), Number(b)) => a.partial_cmp(b)?,
                (String(a), String(b)) => a.cmp(b),
                _ => return None,
            };
            Some(match operator {
                Operator::GreaterThan => ordering.is_gt(),
                Operator::LowerThan => ordering.is_lt(),
                Operator::GreaterThanOrEquals => ordering.is_ge(),
                Operator::LowerThanOrEquals => ordering.is_le(),
                _ => return None,
            })
        }

        Operator::Contains
        | Operator::NotContains
        | Operator::StartsWith
        | Operator::EndsWith => {
            let haystack = context_value.to_string();
            let needle = rule_value.to_string();
            Some(match operator {
                Operator::Contains => haystack.contains(&needle),
                Operator::NotContains => !haystack.contains(&needle),
                Operator::StartsWith => haystack.starts_with(&needle),
                Operator::EndsWith => haystack.ends_with(&needle),
                _ => return None,
            })
        }

        Operator::Unknown => None,
    }
}

fn equals(a: &ContextValue, b: &ContextValue) -> bool {
    match (a, b) {
        (ContextValue::Number(a), ContextValue::Number(b)) => a == b,
        (ContextValue::String(a), ContextValue::String(b)) => a == b,
        (ContextValue::Boolean(a), ContextValue::Boolean(b)) => a == b,
        _ => false,
    }
}
