use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// The caller-facing secret (`sk-proxy-...`). `allowed_models` is a
/// JSON-encoded array of model ids; absent means no restriction.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_credentials")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(unique_key = "proxy_credential_key")]
    pub key: String,
    pub name: Option<String>,
    pub is_active: bool,
    pub allowed_models: Option<Json>,
    pub rpm_override: Option<i32>,
    pub tpm_override: Option<i32>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
