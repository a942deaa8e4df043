use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Rollup keyed by `(user_id, day)`. `day` is stored as `YYYY-MM-DD`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_daily")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_daily_user_day")]
    pub user_id: i64,
    #[sea_orm(unique_key = "usage_daily_user_day")]
    pub day: String,
    pub total_requests: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
