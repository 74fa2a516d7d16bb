use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::TenantId;

/// Tenant lifecycle status. A suspended tenant fails authentication on every
/// key it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantKind {
    Standard,
    Personal,
}

#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: String,
    pub kind: String,
    /// NULL means every enabled catalog alias is visible.
    pub allowed_aliases: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        TenantStatus::parse(&self.status) == Some(TenantStatus::Active)
    }

    /// Whether the alias is inside the tenant's allowed-model set.
    /// An absent set means "all models".
    pub fn allows_alias(&self, alias: &str) -> bool {
        match &self.allowed_aliases {
            None => true,
            Some(value) => value
                .as_array()
                .map(|list| list.iter().any(|v| v.as_str() == Some(alias)))
                .unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(allowed: Option<serde_json::Value>) -> Tenant {
        Tenant {
            id: uuid::Uuid::new_v4(),
            name: "acme".into(),
            status: "active".into(),
            kind: "standard".into(),
            allowed_aliases: allowed,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_absent_allowlist_permits_everything() {
        assert!(tenant(None).allows_alias("gpt-test"));
    }

    #[test]
    fn test_allowlist_is_enforced() {
        let t = tenant(Some(serde_json::json!(["gpt-test"])));
        assert!(t.allows_alias("gpt-test"));
        assert!(!t.allows_alias("claude-3"));
    }
}
