use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sharder::allocate;

/// Account-wide settings delivered with decisions and bucketing files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    #[serde(default, rename = "enabledXPC")]
    pub enabled_xpc: bool,
    #[serde(default, rename = "enabled1V1T")]
    pub enabled_1v1t: bool,
    /// Emotion AI collection toggle. Only parsed, collection is handled elsewhere.
    #[serde(default)]
    pub eai_collect_enabled: bool,
    #[serde(default)]
    pub eai_activation_enabled: bool,
    #[serde(default)]
    pub troubleshooting: Option<TroubleshootingSettings>,
}

/// Window and traffic share during which visitors report troubleshooting telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TroubleshootingSettings {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Percentage of visitors, `0..=100`.
    pub traffic: f64,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl TroubleshootingSettings {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now <= self.end_date
    }

    /// Whether the visitor identified by `hash_key` is part of the troubleshooting traffic.
    pub fn includes(&self, hash_key: &str, now: DateTime<Utc>) -> bool {
        self.is_active(now) && (allocate(hash_key) as f64) < self.traffic
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{AccountSettings, TroubleshootingSettings};

    #[test]
    fn parses_account_settings() {
        let settings: AccountSettings = serde_json::from_value(json!({
            "enabledXPC": true,
            "eaiCollectEnabled": true,
            "troubleshooting": {
                "startDate": "2024-01-01T00:00:00Z",
                "endDate": "2024-01-02T00:00:00Z",
                "traffic": 40,
                "timezone": "Europe/Paris"
            }
        }))
        .unwrap();

        assert!(settings.enabled_xpc);
        assert!(settings.eai_collect_enabled);
        assert!(!settings.eai_activation_enabled);
        let troubleshooting = settings.troubleshooting.unwrap();
        assert_eq!(troubleshooting.traffic, 40.0);
        assert_eq!(troubleshooting.timezone.as_deref(), Some("Europe/Paris"));
    }

    #[test]
    fn includes_only_within_window_and_traffic() {
        let now = Utc::now();
        let settings = TroubleshootingSettings {
            start_date: now - Duration::hours(1),
            end_date: now + Duration::hours(1),
            traffic: 100.0,
            timezone: None,
        };
        assert!(settings.includes("visitor", now));
        assert!(!settings.includes("visitor", now + Duration::hours(2)));

        let nobody = TroubleshootingSettings {
            traffic: 0.0,
            ..settings
        };
        assert!(!nobody.includes("visitor", now));
    }
}
