//! Fixed-window request/token rate limiting backed by a shared Redis-compatible store.
//!
//! The window is a plain 60-second bucket keyed by identifier, not a true
//! sliding log: the enforcement tier does not need more precision than that,
//! and a fixed window is cheap to reason about under concurrent writers.

use deadpool_redis::{Config, Pool, Runtime, redis::AsyncCommands};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis pool configuration error: {0}")]
    Pool(#[from] deadpool_redis::CreatePoolError),
}

/// Which identifier namespace a check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Ip,
    Key,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::Key => "key",
        }
    }
}

/// Outcome of a `check` call, always returned even on fail-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining_requests: u32,
    pub remaining_tokens: u32,
    pub current_requests: u32,
    pub current_tokens: u32,
    pub limit_rpm: u32,
    pub limit_tpm: u32,
    pub reset_in_seconds: u32,
    /// Set when the KV store was unreachable and the check fell back to
    /// fail-open; callers should still admit the request.
    pub error: Option<String>,
}

const WINDOW_SECONDS: u64 = 60;

#[derive(Clone)]
pub struct RateLimiter {
    pool: Pool,
}

impl RateLimiter {
    pub fn new(redis_url: &str) -> Result<Self, RateLimitError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
        Ok(Self { pool })
    }

    fn key(scope: Scope, identifier: &str, window: &str) -> String {
        format!("rate_limit:{}:{}:{}", scope.as_str(), identifier, window)
    }

    /// Atomically bumps the request and (optionally) token counters for
    /// `identifier` and reports whether the post-increment values are
    /// within `limit_rpm`/`limit_tpm`.
    ///
    /// On any Redis error the call fails open: `allowed` is `true` and
    /// `info.error` carries the reason. Callers must log this themselves
    /// (each failing call, not once per process) since silent fail-open is
    /// indistinguishable from a healthy limiter otherwise.
    pub async fn check(
        &self,
        scope: Scope,
        identifier: &str,
        limit_rpm: u32,
        limit_tpm: u32,
        est_tokens: u32,
    ) -> RateLimitInfo {
        match self
            .check_inner(scope, identifier, limit_rpm, limit_tpm, est_tokens)
            .await
        {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(
                    event = "rate_limiter_fail_open",
                    scope = scope.as_str(),
                    identifier,
                    error = %err,
                    "rate limiter backend unreachable, admitting request"
                );
                RateLimitInfo {
                    remaining_requests: limit_rpm,
                    remaining_tokens: limit_tpm,
                    current_requests: 0,
                    current_tokens: 0,
                    limit_rpm,
                    limit_tpm,
                    reset_in_seconds: WINDOW_SECONDS as u32,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn check_inner(
        &self,
        scope: Scope,
        identifier: &str,
        limit_rpm: u32,
        limit_tpm: u32,
        est_tokens: u32,
    ) -> Result<RateLimitInfo, deadpool_redis::PoolError> {
        let mut conn = self.pool.get().await?;
        let key_rpm = Self::key(scope, identifier, "rpm");
        let key_tpm = Self::key(scope, identifier, "tpm");

        let current_rpm: u32 = conn.incr(&key_rpm, 1u32).await.unwrap_or(1);
        if current_rpm == 1 {
            let _: Result<(), _> = conn.expire(&key_rpm, WINDOW_SECONDS as i64).await;
        }

        let current_tpm: u32 = if est_tokens > 0 {
            let v: u32 = conn.incr(&key_tpm, est_tokens).await.unwrap_or(est_tokens);
            if v == est_tokens {
                let _: Result<(), _> = conn.expire(&key_tpm, WINDOW_SECONDS as i64).await;
            }
            v
        } else {
            conn.get::<_, Option<u32>>(&key_tpm).await?.unwrap_or(0)
        };

        Ok(RateLimitInfo {
            remaining_requests: limit_rpm.saturating_sub(current_rpm),
            remaining_tokens: limit_tpm.saturating_sub(current_tpm),
            current_requests: current_rpm,
            current_tokens: current_tpm,
            limit_rpm,
            limit_tpm,
            reset_in_seconds: WINDOW_SECONDS as u32,
            error: None,
        })
    }

    /// Clears both counters for `identifier`. Used by admin tooling and tests.
    pub async fn reset(&self, scope: Scope, identifier: &str) -> Result<(), deadpool_redis::PoolError> {
        let mut conn = self.pool.get().await?;
        let key_rpm = Self::key(scope, identifier, "rpm");
        let key_tpm = Self::key(scope, identifier, "tpm");
        let _: () = conn.del(&[key_rpm, key_tpm]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespacing_matches_contract() {
        assert_eq!(
            RateLimiter::key(Scope::Key, "sk-proxy-abc", "rpm"),
            "rate_limit:key:sk-proxy-abc:rpm"
        );
        assert_eq!(
            RateLimiter::key(Scope::Ip, "10.0.0.1", "tpm"),
            "rate_limit:ip:10.0.0.1:tpm"
        );
    }
}
