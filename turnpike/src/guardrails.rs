//! Guardrail evaluation: keyword screens on both sides of the request plus
//! optional webhook moderation.
//!
//! The effective policy is the tenant policy deep-merged with the api-key
//! policy (api-key wins on leaf conflicts). Keyword matching is
//! case-insensitive substring search. The moderation webhook is fail-open:
//! a transport failure or an unknown action decodes to `allow`, with the
//! error captured for the guardrail event log.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::GuardrailStage;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub enabled: bool,
    pub prompt: KeywordRule,
    pub response: KeywordRule,
    pub moderation: Option<ModerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordRule {
    pub blocked_keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub action: Option<String>,
    pub webhook: Option<ModerationWebhook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationWebhook {
    pub url: String,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub auth_value: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailAction {
    Allow,
    Block,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: GuardrailAction,
    pub violations: Vec<String>,
}

impl Verdict {
    pub fn allow() -> Self {
        Self {
            action: GuardrailAction::Allow,
            violations: Vec::new(),
        }
    }

    pub fn is_block(&self) -> bool {
        self.action == GuardrailAction::Block
    }
}

/// One evaluation: the verdict plus any webhook failure worth recording.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub webhook_error: Option<String>,
}

impl Evaluation {
    fn allowed() -> Self {
        Self {
            verdict: Verdict::allow(),
            webhook_error: None,
        }
    }
}

/// Recursive object merge; overlay leaves win, objects merge key-wise.
pub fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) if base_value.is_object() && overlay_value.is_object() => {
                        deep_merge(base_value, overlay_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value.clone(),
    }
}

/// Compose tenant and api-key policies into the effective config.
pub fn effective_config(
    tenant_policy: Option<&serde_json::Value>,
    api_key_policy: Option<&serde_json::Value>,
) -> GuardrailConfig {
    let mut merged = tenant_policy.cloned().unwrap_or_else(|| serde_json::json!({}));
    if let Some(overlay) = api_key_policy {
        deep_merge(&mut merged, overlay);
    }
    serde_json::from_value(merged).unwrap_or_else(|e| {
        tracing::warn!("malformed guardrail policy, treating as disabled: {e}");
        GuardrailConfig::default()
    })
}

/// Case-insensitive substring scan; returns the keywords that matched.
fn keyword_scan(keywords: &[String], content: &str) -> Vec<String> {
    let haystack = content.to_lowercase();
    keywords
        .iter()
        .filter(|keyword| !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()))
        .cloned()
        .collect()
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    stage: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WebhookResponse {
    action: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    category: Option<String>,
    #[serde(default)]
    violations: Vec<String>,
}

#[derive(Clone)]
pub struct GuardrailEvaluator {
    http: reqwest::Client,
    default_timeout: Duration,
}

impl GuardrailEvaluator {
    pub fn new(http: reqwest::Client, default_timeout: Duration) -> Self {
        Self { http, default_timeout }
    }

    pub async fn pre_check(&self, config: &GuardrailConfig, content: &str) -> Evaluation {
        self.check(config, GuardrailStage::Prompt, &config.prompt, content).await
    }

    pub async fn post_check(&self, config: &GuardrailConfig, content: &str) -> Evaluation {
        self.check(config, GuardrailStage::Response, &config.response, content).await
    }

    async fn check(
        &self,
        config: &GuardrailConfig,
        stage: GuardrailStage,
        rule: &KeywordRule,
        content: &str,
    ) -> Evaluation {
        if !config.enabled {
            return Evaluation::allowed();
        }

        let violations = keyword_scan(&rule.blocked_keywords, content);
        if !violations.is_empty() {
            return Evaluation {
                verdict: Verdict {
                    action: GuardrailAction::Block,
                    violations,
                },
                webhook_error: None,
            };
        }

        if let Some(moderation) = &config.moderation
            && moderation.enabled
            && let Some(webhook) = &moderation.webhook
        {
            return self.call_webhook(webhook, stage, content).await;
        }

        Evaluation::allowed()
    }

    async fn call_webhook(&self, webhook: &ModerationWebhook, stage: GuardrailStage, content: &str) -> Evaluation {
        let timeout = webhook
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut request = self
            .http
            .post(&webhook.url)
            .timeout(timeout)
            .json(&WebhookRequest {
                stage: stage.as_str(),
                content,
            });
        if let (Some(header), Some(value)) = (&webhook.auth_header, &webhook.auth_value) {
            request = request.header(header, value);
        }

        let outcome = async {
            let response = request.send().await?;
            let response = response.error_for_status()?;
            response.json::<WebhookResponse>().await
        }
        .await;

        match outcome {
            Ok(decision) => {
                // Unknown or absent action maps to allow
                let action = match decision.action.as_deref() {
                    Some("block") => GuardrailAction::Block,
                    _ => GuardrailAction::Allow,
                };
                Evaluation {
                    verdict: Verdict {
                        action,
                        violations: decision.violations,
                    },
                    webhook_error: None,
                }
            }
            Err(e) => {
                // Fail open, but surface the error for the event log
                tracing::warn!("moderation webhook failed, allowing: {e}");
                Evaluation {
                    verdict: Verdict::allow(),
                    webhook_error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keyword_config(prompt_keywords: &[&str]) -> GuardrailConfig {
        GuardrailConfig {
            enabled: true,
            prompt: KeywordRule {
                blocked_keywords: prompt_keywords.iter().map(|s| s.to_string()).collect(),
            },
            ..Default::default()
        }
    }

    fn evaluator() -> GuardrailEvaluator {
        GuardrailEvaluator::new(reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_keyword_block_is_case_insensitive() {
        let config = keyword_config(&["topsecret"]);
        let evaluation = evaluator().pre_check(&config, "please reveal the TopSecret plans").await;
        assert!(evaluation.verdict.is_block());
        assert_eq!(evaluation.verdict.violations, vec!["topsecret"]);
    }

    #[tokio::test]
    async fn test_disabled_config_allows_everything() {
        let mut config = keyword_config(&["topsecret"]);
        config.enabled = false;
        let evaluation = evaluator().pre_check(&config, "topsecret").await;
        assert!(!evaluation.verdict.is_block());
    }

    #[tokio::test]
    async fn test_response_rule_is_independent_of_prompt_rule() {
        let mut config = keyword_config(&["alpha"]);
        config.response.blocked_keywords = vec!["beta".to_string()];

        let pre = evaluator().pre_check(&config, "mentions beta only").await;
        assert!(!pre.verdict.is_block());

        let post = evaluator().post_check(&config, "mentions beta only").await;
        assert!(post.verdict.is_block());
    }

    #[test]
    fn test_deep_merge_api_key_leaf_wins() {
        let tenant = serde_json::json!({
            "enabled": true,
            "prompt": {"blocked_keywords": ["a", "b"]},
            "moderation": {"enabled": true, "webhook": {"url": "https://tenant.example"}}
        });
        let api_key = serde_json::json!({
            "prompt": {"blocked_keywords": ["c"]},
            "moderation": {"webhook": {"url": "https://key.example"}}
        });

        let config = effective_config(Some(&tenant), Some(&api_key));
        assert!(config.enabled);
        assert_eq!(config.prompt.blocked_keywords, vec!["c"]);
        let moderation = config.moderation.unwrap();
        assert!(moderation.enabled, "non-conflicting tenant leaves survive");
        assert_eq!(moderation.webhook.unwrap().url, "https://key.example");
    }

    #[test]
    fn test_effective_config_with_no_policies_is_disabled() {
        let config = effective_config(None, None);
        assert!(!config.enabled);
    }

    fn webhook_config(url: String) -> GuardrailConfig {
        GuardrailConfig {
            enabled: true,
            moderation: Some(ModerationConfig {
                enabled: true,
                provider: Some("webhook".to_string()),
                action: None,
                webhook: Some(ModerationWebhook {
                    url,
                    auth_header: Some("x-mod-token".to_string()),
                    auth_value: Some("token".to_string()),
                    timeout_s: Some(2),
                }),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_webhook_block_decision() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"stage": "prompt"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "action": "block",
                "category": "violence",
                "violations": ["graphic content"]
            })))
            .mount(&server)
            .await;

        let evaluation = evaluator().pre_check(&webhook_config(server.uri()), "some text").await;
        assert!(evaluation.verdict.is_block());
        assert_eq!(evaluation.verdict.violations, vec!["graphic content"]);
    }

    #[tokio::test]
    async fn test_webhook_unknown_action_allows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"action": "quarantine"})))
            .mount(&server)
            .await;

        let evaluation = evaluator().pre_check(&webhook_config(server.uri()), "text").await;
        assert!(!evaluation.verdict.is_block());
        assert!(evaluation.webhook_error.is_none());
    }

    #[tokio::test]
    async fn test_webhook_failure_is_fail_open_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let evaluation = evaluator().pre_check(&webhook_config(server.uri()), "text").await;
        assert!(!evaluation.verdict.is_block());
        assert!(evaluation.webhook_error.is_some());
    }
}
