use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Append-only audit row, written on every terminal pipeline outcome.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub credential_id: i64,
    pub upstream_id: Option<i64>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub status_code: i32,
    pub latency_ms: i64,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_body: Option<Json>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
