//! Redis-backed rate limiting: RPM and TPM sliding windows plus a
//! parallel-request semaphore.
//!
//! Three key families, all scoped per API key:
//!
//! | mechanism | key | behavior |
//! |---|---|---|
//! | RPM | `rpm:<scope>:<minute>` | INCR, EXPIRE 60s on first hit, reject when over |
//! | TPM | `tpm:<scope>:<minute>` | INCRBY after token counts are known, rolled back on reject |
//! | parallel | `sem:<scope>` | INCR with a 5-minute crash backstop, DECR on release |
//!
//! The windows are bucketed per natural minute, so a caller can see up to a
//! 2x burst across a bucket boundary. Redis is the single source of truth;
//! nothing is cached in-process.
//!
//! [`LimitLease`] guarantees the semaphore decrement runs on every exit
//! path: explicit release, error return, or drop (client disconnect).

use redis::{AsyncCommands, aio::ConnectionManager};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};

/// Crash backstop for semaphore entries whose holder never released.
/// Release-on-completion is the primary mechanism; streams do not extend
/// this while running.
const SEMAPHORE_TTL_SECS: i64 = 300;

const RPM_WINDOW_SECS: i64 = 60;

/// Effective limits for one request. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitConfig {
    pub rpm: i64,
    pub tpm: i64,
    pub max_parallel: i64,
}

impl LimitConfig {
    /// Compose tenant-level defaults with per-key overrides; an override
    /// wins only when it is set and positive.
    pub fn effective(defaults: &LimitConfig, rpm: Option<i64>, tpm: Option<i64>, max_parallel: Option<i64>) -> Self {
        fn pick(default: i64, over: Option<i64>) -> i64 {
            match over {
                Some(v) if v > 0 => v,
                _ => default,
            }
        }
        Self {
            rpm: pick(defaults.rpm, rpm),
            tpm: pick(defaults.tpm, tpm),
            max_parallel: pick(defaults.max_parallel, max_parallel),
        }
    }
}

/// Current natural-minute bucket for a unix timestamp.
pub fn minute_bucket(unix_secs: i64) -> i64 {
    unix_secs / 60
}

pub fn rpm_key(scope: &str, bucket: i64) -> String {
    format!("rpm:{scope}:{bucket}")
}

pub fn tpm_key(scope: &str, bucket: i64) -> String {
    format!("tpm:{scope}:{bucket}")
}

pub fn semaphore_key(scope: &str) -> String {
    format!("sem:{scope}")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn redis_err(context: &str, err: redis::RedisError) -> Error {
    tracing::error!("redis {context} failed: {err}");
    Error::Internal {
        operation: format!("redis {context}"),
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }

    /// Admit one request: RPM first, then the parallel semaphore. On
    /// success the returned lease must eventually be released; on failure
    /// nothing is held.
    pub async fn allow(&self, scope: &str, cfg: &LimitConfig) -> Result<LimitLease> {
        let mut conn = self.conn.clone();

        if cfg.rpm > 0 {
            let key = rpm_key(scope, minute_bucket(now_unix()));
            let count: i64 = conn.incr(&key, 1).await.map_err(|e| redis_err("rpm incr", e))?;
            if count == 1 {
                let _: bool = conn
                    .expire(&key, RPM_WINDOW_SECS)
                    .await
                    .map_err(|e| redis_err("rpm expire", e))?;
            }
            if count > cfg.rpm {
                return Err(Error::RateLimited {
                    message: format!("Rate limit reached: {} requests per minute", cfg.rpm),
                });
            }
        }

        let mut parallel_held = false;
        if cfg.max_parallel > 0 {
            let key = semaphore_key(scope);
            let count: i64 = conn.incr(&key, 1).await.map_err(|e| redis_err("semaphore incr", e))?;
            let _: bool = conn
                .expire(&key, SEMAPHORE_TTL_SECS)
                .await
                .map_err(|e| redis_err("semaphore expire", e))?;
            if count > cfg.max_parallel {
                let _: i64 = conn.decr(&key, 1).await.map_err(|e| redis_err("semaphore rollback", e))?;
                return Err(Error::RateLimited {
                    message: format!("Too many parallel requests: limit is {}", cfg.max_parallel),
                });
            }
            parallel_held = true;
        }

        Ok(LimitLease {
            limiter: self.clone(),
            scope: scope.to_string(),
            parallel_held,
            released: false,
        })
    }

    /// Charge tokens against the TPM window once the adapter has reported
    /// counts. Exceeding the limit rolls the counter back to its pre-call
    /// value and rejects.
    pub async fn token_allowance(&self, scope: &str, tokens: i64, cfg: &LimitConfig) -> Result<()> {
        if cfg.tpm <= 0 || tokens <= 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let key = tpm_key(scope, minute_bucket(now_unix()));
        let used: i64 = conn.incr(&key, tokens).await.map_err(|e| redis_err("tpm incrby", e))?;
        if used == tokens {
            let _: bool = conn
                .expire(&key, RPM_WINDOW_SECS)
                .await
                .map_err(|e| redis_err("tpm expire", e))?;
        }
        if used > cfg.tpm {
            let _: i64 = conn.decr(&key, tokens).await.map_err(|e| redis_err("tpm rollback", e))?;
            return Err(Error::RateLimited {
                message: format!("Rate limit reached: {} tokens per minute", cfg.tpm),
            });
        }
        Ok(())
    }

    async fn release_parallel(&self, scope: &str) {
        let mut conn = self.conn.clone();
        let key = semaphore_key(scope);
        if let Err(e) = conn.decr::<_, _, i64>(&key, 1).await {
            tracing::warn!("failed to release parallel slot for {scope}: {e}");
        }
    }

    /// Round-trip latency probe for the health endpoint.
    pub async fn ping(&self) -> Result<Duration> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let _: bool = conn
            .exists("turnpike:health")
            .await
            .map_err(|e| redis_err("ping", e))?;
        Ok(start.elapsed())
    }
}

/// Admission handle returned by [`RateLimiter::allow`].
///
/// Releasing is idempotent: the first of explicit [`LimitLease::release`] or
/// drop wins, so it is safe to call on any exit path.
#[must_use]
pub struct LimitLease {
    limiter: RateLimiter,
    scope: String,
    parallel_held: bool,
    released: bool,
}

impl LimitLease {
    pub async fn release(mut self) {
        if !self.released && self.parallel_held {
            self.limiter.release_parallel(&self.scope).await;
        }
        self.released = true;
    }
}

impl Drop for LimitLease {
    fn drop(&mut self) {
        if self.released || !self.parallel_held {
            return;
        }
        // Dropped without an explicit release (error path or disconnect):
        // hand the decrement to the runtime.
        let limiter = self.limiter.clone();
        let scope = std::mem::take(&mut self.scope);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                limiter.release_parallel(&scope).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_bucket_boundaries() {
        assert_eq!(minute_bucket(0), 0);
        assert_eq!(minute_bucket(59), 0);
        assert_eq!(minute_bucket(60), 1);
        assert_eq!(minute_bucket(61), 1);
        assert_eq!(minute_bucket(3600), 60);
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(rpm_key("key-1", 42), "rpm:key-1:42");
        assert_eq!(tpm_key("key-1", 42), "tpm:key-1:42");
        assert_eq!(semaphore_key("key-1"), "sem:key-1");
    }

    #[test]
    fn test_effective_limits_override_wins_when_positive() {
        let defaults = LimitConfig {
            rpm: 60,
            tpm: 10_000,
            max_parallel: 4,
        };
        let effective = LimitConfig::effective(&defaults, Some(120), None, Some(0));
        assert_eq!(effective.rpm, 120);
        assert_eq!(effective.tpm, 10_000);
        // zero override falls back to the default rather than disabling
        assert_eq!(effective.max_parallel, 4);
    }
}
