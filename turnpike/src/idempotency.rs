//! Advisory idempotency cache: (tenant, client key) → serialized response.
//!
//! Entries live for a short TTL and are evicted by capacity; a miss never
//! blocks progress. Only successful, non-streaming responses are cached.

use bytes::Bytes;
use moka::future::Cache;
use std::time::Duration;

use crate::types::TenantId;

/// Header clients use to supply their idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct IdempotencyCache {
    cache: Cache<(TenantId, String), Bytes>,
}

impl IdempotencyCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
        }
    }

    pub async fn get(&self, tenant: TenantId, key: &str) -> Option<Bytes> {
        self.cache.get(&(tenant, key.to_string())).await
    }

    pub async fn put(&self, tenant: TenantId, key: &str, body: Bytes) {
        self.cache.insert((tenant, key.to_string()), body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hit_returns_cached_bytes_verbatim() {
        let cache = IdempotencyCache::new(16, Duration::from_secs(60));
        let tenant = uuid::Uuid::new_v4();
        let body = Bytes::from_static(b"{\"id\":\"chatcmpl-1\"}");

        assert!(cache.get(tenant, "req-1").await.is_none());
        cache.put(tenant, "req-1", body.clone()).await;
        assert_eq!(cache.get(tenant, "req-1").await, Some(body));
    }

    #[tokio::test]
    async fn test_keys_are_tenant_scoped() {
        let cache = IdempotencyCache::new(16, Duration::from_secs(60));
        let tenant_a = uuid::Uuid::new_v4();
        let tenant_b = uuid::Uuid::new_v4();

        cache.put(tenant_a, "req-1", Bytes::from_static(b"a")).await;
        assert!(cache.get(tenant_b, "req-1").await.is_none());
    }
}
