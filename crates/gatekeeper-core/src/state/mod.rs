use std::sync::Arc;
use std::time::Duration;

use gatekeeper_cipher::KeyCipher;
use gatekeeper_common::AppConfig;
use gatekeeper_ratelimit::RateLimiter;
use gatekeeper_storage::{KeyPool, UsageTracker};
use sea_orm::DatabaseConnection;

/// Everything a request handler needs, built once at bootstrap and shared
/// behind an `Arc`. Nothing here is mutated in place; the pool and tracker
/// own their own internal state via the database.
pub struct AppState {
    pub config: AppConfig,
    pub db: DatabaseConnection,
    pub pool: KeyPool,
    pub tracker: UsageTracker,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(config: AppConfig, db: DatabaseConnection, limiter: RateLimiter) -> Self {
        let cipher = KeyCipher::new(&config.encryption_key).expect("encryption key validated at bootstrap");
        let pool = KeyPool::new(
            db.clone(),
            cipher,
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_cooldown_seconds,
        );
        let tracker = UsageTracker::new(db.clone());
        Self { config, db, pool, tracker, limiter }
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.upstream_connect_timeout_secs)
    }

    pub fn upstream_request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.upstream_timeout_secs)
    }
}

pub type SharedState = Arc<AppState>;
