use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

use crate::entities::usage_daily::{ActiveModel as DailyActiveModel, Column as DailyColumn, Entity as DailyEntity};
use crate::entities::usage_monthly::{ActiveModel as MonthlyActiveModel, Column as MonthlyColumn, Entity as MonthlyEntity};
use crate::entities::usage_records::ActiveModel as RecordActiveModel;
use crate::entities::users::{Column as UserColumn, Entity as UserEntity};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDenyReason {
    UserMissing,
    UserInactive,
    MonthlyQuotaExceeded,
}

/// Everything needed to write one terminal-outcome audit row and bump its
/// rollups. Constructed by the pipeline after the upstream call returns
/// (or fails), never persisted directly.
#[derive(Debug, Clone)]
pub struct UsageContext {
    pub user_id: i64,
    pub credential_id: i64,
    pub upstream_id: Option<i64>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub status_code: i32,
    pub latency_ms: i64,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_body: Option<JsonValue>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl UsageContext {
    fn total_tokens(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

pub struct UsageTracker {
    db: DatabaseConnection,
}

impl UsageTracker {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Loads the user and the current-month rollup and decides whether
    /// `est_tokens` more would push them over `quota_tokens`. `quota_amount`
    /// is read from the row but never compared here; cost accounting is out
    /// of scope.
    pub async fn check_quota(&self, user_id: i64, est_tokens: i64) -> StorageResult<Result<(), QuotaDenyReason>> {
        let Some(user) = UserEntity::find()
            .filter(UserColumn::Id.eq(user_id))
            .one(&self.db)
            .await?
        else {
            return Ok(Err(QuotaDenyReason::UserMissing));
        };
        if !user.is_active {
            return Ok(Err(QuotaDenyReason::UserInactive));
        }

        let now = OffsetDateTime::now_utc();
        let current = MonthlyEntity::find()
            .filter(MonthlyColumn::UserId.eq(user_id))
            .filter(MonthlyColumn::Year.eq(now.year()))
            .filter(MonthlyColumn::Month.eq(now.month() as i32))
            .one(&self.db)
            .await?
            .map(|row| row.total_tokens)
            .unwrap_or(0);

        if current + est_tokens > user.quota_tokens {
            return Ok(Err(QuotaDenyReason::MonthlyQuotaExceeded));
        }
        Ok(Ok(()))
    }

    /// Appends the audit row and upserts both rollups in one transaction.
    /// Retries the whole transaction once on a unique-constraint race
    /// (concurrent first-insert of the same rollup key); on persistent
    /// failure the audit row is rolled back too, per the invariant that a
    /// record never exists without its rollup increment.
    pub async fn record(&self, ctx: &UsageContext) -> StorageResult<()> {
        match self.record_once(ctx).await {
            Ok(()) => Ok(()),
            Err(StorageError::Db(DbErr::RecordNotInserted)) | Err(StorageError::Db(DbErr::Exec(_))) => {
                tracing::warn!(event = "usage_rollup_retry", user_id = ctx.user_id, "retrying usage record after conflict");
                self.record_once(ctx).await
            }
            Err(other) => Err(other),
        }
    }

    async fn record_once(&self, ctx: &UsageContext) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        let now = OffsetDateTime::now_utc();

        let record = RecordActiveModel {
            user_id: Set(ctx.user_id),
            credential_id: Set(ctx.credential_id),
            upstream_id: Set(ctx.upstream_id),
            model: Set(ctx.model.clone()),
            prompt_tokens: Set(ctx.prompt_tokens),
            completion_tokens: Set(ctx.completion_tokens),
            total_tokens: Set(ctx.total_tokens()),
            status_code: Set(ctx.status_code),
            latency_ms: Set(ctx.latency_ms),
            client_ip: Set(ctx.client_ip.clone()),
            user_agent: Set(ctx.user_agent.clone()),
            request_body: Set(ctx.request_body.clone()),
            error_type: Set(ctx.error_type.clone()),
            error_message: Set(ctx.error_message.clone()),
            created_at: Set(now),
            ..Default::default()
        };
        record.insert(&txn).await?;

        let day = format!("{:04}-{:02}-{:02}", now.year(), now.month() as u8, now.day());
        let daily = DailyEntity::find()
            .filter(DailyColumn::UserId.eq(ctx.user_id))
            .filter(DailyColumn::Day.eq(day.clone()))
            .one(&txn)
            .await?;
        match daily {
            Some(row) => {
                let mut active: DailyActiveModel = row.into();
                active.total_requests = Set(active.total_requests.unwrap() + 1);
                active.total_prompt_tokens = Set(active.total_prompt_tokens.unwrap() + ctx.prompt_tokens);
                active.total_completion_tokens = Set(active.total_completion_tokens.unwrap() + ctx.completion_tokens);
                active.total_tokens = Set(active.total_tokens.unwrap() + ctx.total_tokens());
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
            None => {
                DailyActiveModel {
                    user_id: Set(ctx.user_id),
                    day: Set(day),
                    total_requests: Set(1),
                    total_prompt_tokens: Set(ctx.prompt_tokens),
                    total_completion_tokens: Set(ctx.completion_tokens),
                    total_tokens: Set(ctx.total_tokens()),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        let monthly = MonthlyEntity::find()
            .filter(MonthlyColumn::UserId.eq(ctx.user_id))
            .filter(MonthlyColumn::Year.eq(now.year()))
            .filter(MonthlyColumn::Month.eq(now.month() as i32))
            .one(&txn)
            .await?;
        match monthly {
            Some(row) => {
                let mut active: MonthlyActiveModel = row.into();
                active.total_requests = Set(active.total_requests.unwrap() + 1);
                active.total_prompt_tokens = Set(active.total_prompt_tokens.unwrap() + ctx.prompt_tokens);
                active.total_completion_tokens = Set(active.total_completion_tokens.unwrap() + ctx.completion_tokens);
                active.total_tokens = Set(active.total_tokens.unwrap() + ctx.total_tokens());
                active.updated_at = Set(now);
                active.update(&txn).await?;
            }
            None => {
                MonthlyActiveModel {
                    user_id: Set(ctx.user_id),
                    year: Set(now.year()),
                    month: Set(now.month() as i32),
                    total_requests: Set(1),
                    total_prompt_tokens: Set(ctx.prompt_tokens),
                    total_completion_tokens: Set(ctx.completion_tokens),
                    total_tokens: Set(ctx.total_tokens()),
                    updated_at: Set(now),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> UsageContext {
        UsageContext {
            user_id: 1,
            credential_id: 1,
            upstream_id: Some(1),
            model: "gpt-4o-mini".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            status_code: 200,
            latency_ms: 42,
            client_ip: None,
            user_agent: None,
            request_body: None,
            error_type: None,
            error_message: None,
        }
    }

    #[test]
    fn total_tokens_sums_prompt_and_completion() {
        assert_eq!(ctx().total_tokens(), 15);
    }
}
