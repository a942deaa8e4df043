use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Rollup keyed by `(user_id, year, month)`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_monthly")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_monthly_user_period")]
    pub user_id: i64,
    #[sea_orm(unique_key = "usage_monthly_user_period")]
    pub year: i32,
    #[sea_orm(unique_key = "usage_monthly_user_period")]
    pub month: i32,
    pub total_requests: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
