//! Bearer authentication for the OpenAI-compatible surface.
//!
//! Clients present `Authorization: Bearer sk-<prefix>.<secret>`. The prefix
//! is a public lookup handle; the secret is verified against its Argon2id
//! hash. Successful authentication attaches an [`AuthContext`] request
//! extension carrying the tenant, the key, and the effective limit config.

pub mod keys;
pub mod middleware;

use crate::db::models::{api_keys::ApiKey, tenants::Tenant};
use crate::ratelimit::LimitConfig;

/// Everything downstream handlers need to know about the caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant: Tenant,
    pub api_key: ApiKey,
    pub limits: LimitConfig,
}

impl AuthContext {
    /// Rate-limit scope string; counters are keyed per API key.
    pub fn scope(&self) -> String {
        self.api_key.id.to_string()
    }
}
