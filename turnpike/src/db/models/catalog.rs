use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::CatalogEntryId;

/// Upstream provider family a catalog entry routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    OpenaiCompatible,
    Azure,
    Anthropic,
    Bedrock,
    Vertex,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::OpenaiCompatible => "openai_compatible",
            ProviderKind::Azure => "azure",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Vertex => "vertex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(ProviderKind::Openai),
            "openai_compatible" => Some(ProviderKind::OpenaiCompatible),
            "azure" => Some(ProviderKind::Azure),
            "anthropic" => Some(ProviderKind::Anthropic),
            "bedrock" => Some(ProviderKind::Bedrock),
            "vertex" => Some(ProviderKind::Vertex),
            _ => None,
        }
    }
}

/// One alias→deployment binding in the model catalog. An alias may appear in
/// several rows, each backed by a different deployment; the router fans a
/// request out across the enabled ones.
#[derive(Debug, Clone, FromRow)]
pub struct CatalogEntry {
    pub id: CatalogEntryId,
    pub alias: String,
    pub provider: String,
    pub provider_model: String,
    pub deployment: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_ciphertext: Option<String>,
    pub api_version: Option<String>,
    pub region: Option<String>,
    pub modalities: serde_json::Value,
    pub supports_tools: bool,
    pub price_input: Decimal,
    pub price_output: Decimal,
    pub currency: String,
    pub weight: f64,
    pub enabled: bool,
    pub metadata_json: serde_json::Value,
    pub provider_config_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn provider_kind(&self) -> Option<ProviderKind> {
        ProviderKind::parse(&self.provider)
    }

    /// Stable key identifying this binding inside an alias, used for breaker
    /// state. Prefers the deployment name, falls back to the endpoint, then
    /// the row id.
    pub fn deployment_key(&self) -> String {
        self.deployment
            .clone()
            .or_else(|| self.endpoint.clone())
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Fixed per-call price override from metadata, in cents (e.g.
    /// `price_image_cents`, `price_audio_cents`).
    pub fn metadata_price_cents(&self, field: &str) -> Option<i64> {
        self.metadata_json.get(field).and_then(|v| v.as_i64())
    }

    /// Capabilities explicitly disabled for this entry via metadata, e.g.
    /// `{"disabled_capabilities": ["image_edit"]}`.
    pub fn disabled_capabilities(&self) -> Vec<String> {
        self.metadata_json
            .get("disabled_capabilities")
            .and_then(|v| v.as_array())
            .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in [
            ProviderKind::Openai,
            ProviderKind::OpenaiCompatible,
            ProviderKind::Azure,
            ProviderKind::Anthropic,
            ProviderKind::Bedrock,
            ProviderKind::Vertex,
        ] {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("mystery"), None);
    }
}
