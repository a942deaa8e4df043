use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One entry in the upstream key pool. `kind`/`status` are stored as plain
/// text (`native`/`deployment-scoped`, `healthy`/`cooldown`/`disabled`) and
/// converted at the application boundary; see [`crate::pool`].
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "upstream_credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub kind: String,
    pub sealed_key: String,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub weight: i32,
    pub status: String,
    pub failure_count: i32,
    pub last_failure_at: Option<OffsetDateTime>,
    pub cooldown_until: Option<OffsetDateTime>,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_errors: i64,
    pub notes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
