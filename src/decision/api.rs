use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::{
    account_settings::AccountSettings,
    bucketing::TryParse,
    campaign::{CampaignAssignment, Modifications},
    decision::{DecisionRequest, DecisionResponse, DecisionSource},
    http::{endpoint, HttpClient, HttpRequest},
    Context, Result,
};

/// Remote decisions: the decision API performs targeting and allocation for each fetch.
pub struct ApiDecision {
    http: Arc<dyn HttpClient>,
    url: Url,
    api_key: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestBody<'a> {
    visitor_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    anonymous_id: Option<&'a str>,
    /// Context hits are emitted by the tracking manager, never by the decision API.
    #[serde(rename = "trigger_hit")]
    trigger_hit: bool,
    context: &'a Context,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody {
    #[serde(default)]
    panic: bool,
    #[serde(default)]
    campaigns: Vec<TryParse<ApiCampaign>>,
    #[serde(default)]
    extras: Option<Extras>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCampaign {
    id: String,
    #[serde(default)]
    name: Option<String>,
    variation_group_id: String,
    #[serde(rename = "type", default)]
    campaign_type: String,
    #[serde(default)]
    slug: Option<String>,
    variation: ApiVariation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVariation {
    id: String,
    #[serde(default)]
    reference: bool,
    #[serde(default)]
    modifications: Modifications,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Extras {
    #[serde(default)]
    account_settings: Option<TryParse<AccountSettings>>,
}

impl From<ApiCampaign> for CampaignAssignment {
    fn from(campaign: ApiCampaign) -> CampaignAssignment {
        CampaignAssignment {
            campaign_id: campaign.id,
            campaign_name: campaign.name,
            variation_group_id: campaign.variation_group_id,
            variation_id: campaign.variation.id,
            is_reference: campaign.variation.reference,
            campaign_type: campaign.campaign_type,
            slug: campaign.slug,
            flags: campaign.variation.modifications.value,
        }
    }
}

impl ApiDecision {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: &str,
        env_id: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<ApiDecision> {
        let mut url = endpoint(base_url, &[env_id, "campaigns"])?;
        url.query_pairs_mut()
            .append_pair("exposeAllKeys", "true")
            .append_pair("extras[]", "accountSettings");

        Ok(ApiDecision {
            http,
            url,
            api_key: api_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl DecisionSource for ApiDecision {
    async fn get_campaigns(&self, request: &DecisionRequest) -> Result<DecisionResponse> {
        let body = serde_json::to_value(RequestBody {
            visitor_id: &request.visitor_id,
            anonymous_id: request.anonymous_id.as_deref(),
            trigger_hit: false,
            context: &request.context,
        })?;

        log::debug!(target: "flagship",
                    visitor_id:display = request.visitor_id;
                    "fetching campaigns from the decision api");

        let response = self
            .http
            .send(HttpRequest::post(self.url.clone(), body, self.timeout).sdk_headers(&self.api_key))
            .await?
            .error_for_status()
            .inspect_err(|err| {
                log::warn!(target: "flagship",
                           visitor_id:display = request.visitor_id;
                           "decision api request failed: {:?}", err);
            })?;

        let body: ResponseBody = response.json()?;

        let campaigns = body
            .campaigns
            .into_iter()
            .filter_map(|campaign| match campaign {
                TryParse::Parsed(campaign) => Some(campaign.into()),
                TryParse::ParseFailed(value) => {
                    log::warn!(target: "flagship",
                               visitor_id:display = request.visitor_id;
                               "skipping malformed campaign: {}", value);
                    None
                }
            })
            .collect();

        Ok(DecisionResponse {
            campaigns,
            panic: body.panic,
            account_settings: match body.extras.and_then(|extras| extras.account_settings) {
                Some(TryParse::Parsed(settings)) => Some(settings),
                Some(TryParse::ParseFailed(value)) => {
                    log::warn!(target: "flagship", "ignoring malformed account settings: {}", value);
                    None
                }
                None => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    use reqwest::{Method, StatusCode};
    use serde_json::json;

    use super::ApiDecision;
    use crate::{
        decision::{DecisionRequest, DecisionSource},
        http::HttpResponse,
        test_utils::MockHttpClient,
        Context, Error,
    };

    fn request() -> DecisionRequest {
        DecisionRequest {
            visitor_id: "user@example.com".to_owned(),
            anonymous_id: Some("anon-1".to_owned()),
            context: [("age".to_owned(), 30.into())].into_iter().collect::<Context>(),
            assignments_history: HashMap::new(),
        }
    }

    fn decision(http: std::sync::Arc<MockHttpClient>) -> ApiDecision {
        ApiDecision::new(
            http,
            "https://decision.flagship.io/v2",
            "env",
            "key",
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn sends_wire_request_and_parses_campaigns() {
        let http = MockHttpClient::new(|_| {
            Ok(HttpResponse::new(
                StatusCode::OK,
                json!({
                    "visitorId": "user@example.com",
                    "campaigns": [{
                        "id": "c1",
                        "variationGroupId": "vg1",
                        "type": "ab",
                        "slug": "home",
                        "variation": {
                            "id": "v1",
                            "reference": false,
                            "modifications": {"type": "JSON", "value": {"title": "Hello"}}
                        }
                    }, {"id": "broken"}],
                    "extras": {"accountSettings": {"enabledXPC": true}}
                })
                .to_string(),
            ))
        });

        let response = decision(http.clone())
            .get_campaigns(&request())
            .await
            .unwrap();

        assert!(!response.panic);
        assert_eq!(response.campaigns.len(), 1);
        assert_eq!(response.campaigns[0].variation_group_id, "vg1");
        assert_eq!(response.campaigns[0].flags["title"], json!("Hello"));
        assert!(response.account_settings.unwrap().enabled_xpc);

        let sent = http.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].url.path(), "/v2/env/campaigns");
        assert_eq!(
            sent[0].body,
            Some(json!({
                "visitorId": "user@example.com",
                "anonymousId": "anon-1",
                "trigger_hit": false,
                "context": {"age": 30.0}
            }))
        );
        assert!(sent[0]
            .headers
            .iter()
            .any(|(name, value)| *name == "x-api-key" && value == "key"));
    }

    #[tokio::test]
    async fn malformed_account_settings_keep_campaigns() {
        let http = MockHttpClient::new(|_| {
            Ok(HttpResponse::new(
                StatusCode::OK,
                json!({
                    "campaigns": [{
                        "id": "c1",
                        "variationGroupId": "vg1",
                        "variation": {
                            "id": "v1",
                            "modifications": {"type": "FLAG", "value": {"enabled": true}}
                        }
                    }],
                    "extras": {"accountSettings": {"troubleshooting": {"startDate": 12, "traffic": "x"}}}
                })
                .to_string(),
            ))
        });

        let response = decision(http).get_campaigns(&request()).await.unwrap();

        assert_eq!(response.campaigns.len(), 1);
        assert_eq!(response.campaigns[0].flags["enabled"], json!(true));
        assert!(response.account_settings.is_none());
    }

    #[tokio::test]
    async fn omits_missing_anonymous_id() {
        let http = MockHttpClient::new(|_| Ok(HttpResponse::new(StatusCode::OK, "{}")));
        let mut req = request();
        req.anonymous_id = None;

        decision(http.clone()).get_campaigns(&req).await.unwrap();

        let body = http.requests()[0].body.clone().unwrap();
        assert!(body.get("anonymousId").is_none());
    }

    #[tokio::test]
    async fn parses_panic_response() {
        let http = MockHttpClient::new(|_| {
            Ok(HttpResponse::new(
                StatusCode::OK,
                r#"{"visitorId": "v", "panic": true}"#,
            ))
        });

        let response = decision(http).get_campaigns(&request()).await.unwrap();

        assert!(response.panic);
        assert!(response.campaigns.is_empty());
    }

    #[tokio::test]
    async fn surfaces_transport_and_parse_errors() {
        let failing = MockHttpClient::new(|_| {
            Ok(HttpResponse::new(StatusCode::INTERNAL_SERVER_ERROR, ""))
        });
        assert!(matches!(
            decision(failing).get_campaigns(&request()).await,
            Err(Error::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));

        let timeout = MockHttpClient::new(|_| Err(Error::Timeout));
        assert!(matches!(
            decision(timeout).get_campaigns(&request()).await,
            Err(Error::Timeout)
        ));

        let malformed = MockHttpClient::new(|_| Ok(HttpResponse::new(StatusCode::OK, "{")));
        assert!(matches!(
            decision(malformed).get_campaigns(&request()).await,
            Err(Error::Parse(_))
        ));
    }
}
