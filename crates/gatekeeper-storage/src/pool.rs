use std::str::FromStr;

use gatekeeper_cipher::KeyCipher;
use gatekeeper_common::UpstreamDialect;
use rand::Rng;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait};
use time::OffsetDateTime;

use crate::entities::upstream_credentials::{ActiveModel, Column, Entity, Model};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Healthy,
    Cooldown,
    Disabled,
}

impl CredentialStatus {
    fn as_str(self) -> &'static str {
        match self {
            CredentialStatus::Healthy => "healthy",
            CredentialStatus::Cooldown => "cooldown",
            CredentialStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(CredentialStatus::Healthy),
            "cooldown" => Ok(CredentialStatus::Cooldown),
            "disabled" => Ok(CredentialStatus::Disabled),
            _ => Err(StorageError::NotFound),
        }
    }
}

/// A credential chosen by [`KeyPool::select`], still sealed; the caller
/// unseals it just before dispatch.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub id: i64,
    pub kind: UpstreamDialect,
    pub sealed_key: String,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
}

/// Draws an index in `[0, weights.len())` weighted by `weights`, walking
/// cumulative weight and returning the first entry whose cumulative sum is
/// at least the random draw. Entries with weight 0 are never chosen unless
/// every weight is 0 (in which case the draw degenerates to index 0).
pub fn pick_weighted_index(weights: &[u32]) -> usize {
    let total: u64 = weights.iter().map(|&w| w as u64).sum();
    if total == 0 {
        return 0;
    }
    let draw = rand::rng().random_range(0..total);
    let mut cumulative: u64 = 0;
    for (idx, &w) in weights.iter().enumerate() {
        cumulative += w as u64;
        if cumulative >= draw.saturating_add(1) {
            return idx;
        }
    }
    weights.len() - 1
}

pub struct KeyPool {
    db: DatabaseConnection,
    cipher: KeyCipher,
    pub failure_threshold: u32,
    pub cooldown_seconds: i64,
}

impl KeyPool {
    pub fn new(db: DatabaseConnection, cipher: KeyCipher, failure_threshold: u32, cooldown_seconds: i64) -> Self {
        Self {
            db,
            cipher,
            failure_threshold,
            cooldown_seconds,
        }
    }

    /// Selects a healthy credential of `kind` by weighted random draw.
    /// Credentials in `COOLDOWN` whose `cooldown_until` has passed are
    /// lazily promoted back to `HEALTHY` as part of this call.
    pub async fn select(&self, kind: UpstreamDialect) -> StorageResult<Option<SelectedCredential>> {
        let rows = Entity::find()
            .filter(Column::Kind.eq(kind.to_string()))
            .filter(
                Column::Status
                    .eq(CredentialStatus::Healthy.as_str())
                    .or(Column::Status.eq(CredentialStatus::Cooldown.as_str())),
            )
            .all(&self.db)
            .await?;

        let now = OffsetDateTime::now_utc();
        let mut healthy = Vec::with_capacity(rows.len());
        for row in rows {
            if row.status == CredentialStatus::Cooldown.as_str() {
                let expired = row.cooldown_until.is_none_or(|until| now >= until);
                if !expired {
                    continue;
                }
                healthy.push(self.recover(row).await?);
            } else {
                healthy.push(row);
            }
        }

        if healthy.is_empty() {
            return Ok(None);
        }

        let weights: Vec<u32> = healthy.iter().map(|m| m.weight.max(0) as u32).collect();
        let idx = pick_weighted_index(&weights);
        let chosen = &healthy[idx];
        Ok(Some(SelectedCredential {
            id: chosen.id,
            kind,
            sealed_key: chosen.sealed_key.clone(),
            endpoint: chosen.endpoint.clone(),
            deployment: chosen.deployment.clone(),
            api_version: chosen.api_version.clone(),
        }))
    }

    async fn recover(&self, row: Model) -> StorageResult<Model> {
        let id = row.id;
        let mut active: ActiveModel = row.into();
        active.status = Set(CredentialStatus::Healthy.as_str().to_string());
        active.failure_count = Set(0);
        active.cooldown_until = Set(None);
        active.updated_at = Set(OffsetDateTime::now_utc());
        let updated = active.update(&self.db).await?;
        tracing::info!(event = "credential_recovered", credential_id = id, "cooldown expired, promoted to healthy");
        Ok(updated)
    }

    pub fn unseal(&self, sealed_key: &str) -> StorageResult<String> {
        Ok(self.cipher.unseal(sealed_key)?)
    }

    /// Resets the breaker and credits `tokens` to the lifetime counters.
    pub async fn record_success(&self, credential_id: i64, tokens: i64) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        if let Some(row) = Entity::find_by_id(credential_id).one(&txn).await? {
            let mut active: ActiveModel = row.into();
            active.total_requests = Set(active.total_requests.unwrap() + 1);
            active.total_tokens = Set(active.total_tokens.unwrap() + tokens);
            active.failure_count = Set(0);
            active.updated_at = Set(OffsetDateTime::now_utc());
            active.update(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Increments the failure counter and, once it reaches the threshold
    /// while the credential is still `HEALTHY`, trips the breaker into
    /// `COOLDOWN`. Never transitions into or out of `DISABLED`.
    pub async fn record_failure(&self, credential_id: i64, error_type: &str) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        if let Some(row) = Entity::find_by_id(credential_id).one(&txn).await? {
            let was_healthy = row.status == CredentialStatus::Healthy.as_str();
            let next_failures = row.failure_count + 1;
            let mut active: ActiveModel = row.into();
            active.total_errors = Set(active.total_errors.unwrap() + 1);
            active.failure_count = Set(next_failures);
            active.last_failure_at = Set(Some(OffsetDateTime::now_utc()));
            if was_healthy && next_failures as u32 >= self.failure_threshold {
                let cooldown_until = OffsetDateTime::now_utc() + time::Duration::seconds(self.cooldown_seconds);
                active.status = Set(CredentialStatus::Cooldown.as_str().to_string());
                active.cooldown_until = Set(Some(cooldown_until));
                tracing::warn!(
                    event = "credential_tripped",
                    credential_id,
                    error_type,
                    cooldown_seconds = self.cooldown_seconds,
                    "breaker tripped to cooldown"
                );
            }
            active.updated_at = Set(OffsetDateTime::now_utc());
            active.update(&txn).await?;
        }
        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_selection_never_picks_zero_weight_when_alternative_exists() {
        let weights = vec![0, 5];
        for _ in 0..200 {
            assert_eq!(pick_weighted_index(&weights), 1);
        }
    }

    #[test]
    fn weighted_selection_degenerates_to_first_index_when_all_zero() {
        assert_eq!(pick_weighted_index(&[0, 0, 0]), 0);
    }

    #[test]
    fn weighted_selection_converges_to_proportional_frequency() {
        let weights = vec![1u32, 3u32];
        let mut counts = [0u32; 2];
        for _ in 0..20_000 {
            counts[pick_weighted_index(&weights)] += 1;
        }
        let ratio = counts[1] as f64 / counts[0] as f64;
        assert!((ratio - 3.0).abs() < 0.3, "ratio was {ratio}");
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [CredentialStatus::Healthy, CredentialStatus::Cooldown, CredentialStatus::Disabled] {
            assert_eq!(s.as_str().parse::<CredentialStatus>().unwrap(), s);
        }
    }

    async fn memory_pool(failure_threshold: u32, cooldown_seconds: i64) -> KeyPool {
        use sea_orm::{ConnectionTrait, Database, Schema};

        let db = Database::connect("sqlite::memory:").await.unwrap();
        let backend = db.get_database_backend();
        let schema = Schema::new(backend);
        db.execute(backend.build(&schema.create_table_from_entity(Entity)))
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        ActiveModel {
            id: Set(1),
            kind: Set("native".to_string()),
            sealed_key: Set("sealed".to_string()),
            endpoint: Set(None),
            deployment: Set(None),
            api_version: Set(None),
            weight: Set(1),
            status: Set(CredentialStatus::Healthy.as_str().to_string()),
            failure_count: Set(0),
            last_failure_at: Set(None),
            cooldown_until: Set(None),
            total_requests: Set(0),
            total_tokens: Set(0),
            total_errors: Set(0),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&db)
        .await
        .unwrap();

        let cipher = KeyCipher::new(&"a".repeat(32)).unwrap();
        KeyPool::new(db, cipher, failure_threshold, cooldown_seconds)
    }

    #[tokio::test]
    async fn repeated_failures_trip_the_breaker_into_cooldown() {
        let pool = memory_pool(3, 300).await;

        for _ in 0..2 {
            pool.record_failure(1, "upstream_error").await.unwrap();
        }
        let still_healthy = Entity::find_by_id(1).one(&pool.db).await.unwrap().unwrap();
        assert_eq!(still_healthy.status, CredentialStatus::Healthy.as_str());

        pool.record_failure(1, "upstream_error").await.unwrap();
        let tripped = Entity::find_by_id(1).one(&pool.db).await.unwrap().unwrap();
        assert_eq!(tripped.status, CredentialStatus::Cooldown.as_str());
        assert!(tripped.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn select_lazily_recovers_an_expired_cooldown() {
        let pool = memory_pool(1, 300).await;

        pool.record_failure(1, "upstream_error").await.unwrap();
        let tripped = Entity::find_by_id(1).one(&pool.db).await.unwrap().unwrap();
        assert_eq!(tripped.status, CredentialStatus::Cooldown.as_str());

        let mut active: ActiveModel = tripped.into();
        active.cooldown_until = Set(Some(OffsetDateTime::now_utc() - time::Duration::seconds(1)));
        active.update(&pool.db).await.unwrap();

        let selected = pool.select(UpstreamDialect::Native).await.unwrap();
        assert!(selected.is_some());
        let recovered = Entity::find_by_id(1).one(&pool.db).await.unwrap().unwrap();
        assert_eq!(recovered.status, CredentialStatus::Healthy.as_str());
        assert_eq!(recovered.failure_count, 0);
    }

    #[tokio::test]
    async fn record_success_resets_failure_count() {
        let pool = memory_pool(5, 300).await;
        pool.record_failure(1, "upstream_error").await.unwrap();
        pool.record_success(1, 100).await.unwrap();
        let row = Entity::find_by_id(1).one(&pool.db).await.unwrap().unwrap();
        assert_eq!(row.failure_count, 0);
        assert_eq!(row.total_tokens, 100);
    }
}
