//! Integration tests driving the full router against an in-memory sqlite
//! store and a local mock upstream, covering the scenarios an in-process
//! `tower::Service` call can exercise without a real Redis/provider.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use gatekeeper_common::{AppConfig, UpstreamDialect};
use gatekeeper_core::{AppState, SharedState};
use gatekeeper_ratelimit::RateLimiter;
use gatekeeper_storage::entities::{ProxyCredentials, UpstreamCredentials, Users};
use sea_orm::{ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, Schema, Set};
use tower::ServiceExt;

async fn setup_schema(db: &DatabaseConnection) {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    for stmt in [
        schema.create_table_from_entity(Users),
        schema.create_table_from_entity(ProxyCredentials),
        schema.create_table_from_entity(UpstreamCredentials),
    ] {
        db.execute(backend.build(&stmt)).await.unwrap();
    }
    for stmt in [
        schema.create_table_from_entity(gatekeeper_storage::entities::UsageRecords),
        schema.create_table_from_entity(gatekeeper_storage::entities::UsageDaily),
        schema.create_table_from_entity(gatekeeper_storage::entities::UsageMonthly),
    ] {
        db.execute(backend.build(&stmt)).await.unwrap();
    }
}

fn now() -> time::OffsetDateTime {
    time::OffsetDateTime::UNIX_EPOCH + Duration::from_secs(1_800_000_000)
}

async fn seed_user(db: &DatabaseConnection, id: i64, quota_tokens: i64) {
    use gatekeeper_storage::entities::users::ActiveModel;
    ActiveModel {
        id: Set(id),
        username: Set(format!("user-{id}")),
        email: Set(None),
        is_active: Set(true),
        is_admin: Set(false),
        quota_tokens: Set(quota_tokens),
        quota_amount: Set(0),
        notes: Set(None),
        created_at: Set(now()),
        updated_at: Set(now()),
    }
    .insert(db)
    .await
    .unwrap();
}

async fn seed_proxy_credential(db: &DatabaseConnection, user_id: i64, key: &str, allowed_models: Option<serde_json::Value>) {
    use gatekeeper_storage::entities::proxy_credentials::ActiveModel;
    ActiveModel {
        id: Set(user_id),
        user_id: Set(user_id),
        key: Set(key.to_string()),
        name: Set(None),
        is_active: Set(true),
        allowed_models: Set(allowed_models),
        rpm_override: Set(None),
        tpm_override: Set(None),
        created_at: Set(now()),
        updated_at: Set(now()),
    }
    .insert(db)
    .await
    .unwrap();
}

async fn seed_upstream_credential(db: &DatabaseConnection, cipher: &gatekeeper_cipher::KeyCipher) {
    use gatekeeper_storage::entities::upstream_credentials::ActiveModel;
    ActiveModel {
        id: Set(1),
        kind: Set("native".to_string()),
        sealed_key: Set(cipher.seal("sk-upstream-test")),
        endpoint: Set(None),
        deployment: Set(None),
        api_version: Set(None),
        weight: Set(1),
        status: Set("healthy".to_string()),
        failure_count: Set(0),
        last_failure_at: Set(None),
        cooldown_until: Set(None),
        total_requests: Set(0),
        total_tokens: Set(0),
        total_errors: Set(0),
        notes: Set(None),
        created_at: Set(now()),
        updated_at: Set(now()),
    }
    .insert(db)
    .await
    .unwrap();
}

/// A local axum server that answers every `POST /chat/completions` with a
/// canned non-streaming completion, standing in for a real upstream.
async fn spawn_mock_upstream() -> String {
    async fn complete() -> axum::Json<serde_json::Value> {
        axum::Json(serde_json::json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8},
        }))
    }
    let app = Router::new().route("/chat/completions", axum::routing::post(complete));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    state: SharedState,
}

impl Harness {
    async fn new(upstream_base_url: String, quota_tokens: i64) -> Self {
        Self::with_allow_list(upstream_base_url, quota_tokens, None).await
    }

    async fn with_allow_list(upstream_base_url: String, quota_tokens: i64, allowed_models: Option<serde_json::Value>) -> Self {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        setup_schema(&db).await;

        let config = AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            redis_url: "redis://127.0.0.1:1".into(),
            upstream_type: UpstreamDialect::Native,
            upstream_base_url: Some(upstream_base_url),
            endpoint: None,
            api_version: None,
            rate_limit_rpm: 1000,
            rate_limit_tpm: 1_000_000,
            rate_limit_ip_rpm: 1000,
            rate_limit_ip_tpm: 1_000_000,
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_cooldown_seconds: 300,
            default_monthly_quota_tokens: quota_tokens,
            upstream_timeout_secs: 30,
            upstream_connect_timeout_secs: 5,
            encryption_key: "0".repeat(32),
            log_prompt_body: false,
        };

        seed_user(&db, 1, quota_tokens).await;
        seed_proxy_credential(&db, 1, "sk-proxy-test", allowed_models).await;
        let cipher = gatekeeper_cipher::KeyCipher::new(&config.encryption_key).unwrap();
        seed_upstream_credential(&db, &cipher).await;

        let limiter = RateLimiter::new(&config.redis_url).unwrap();
        let state = Arc::new(AppState::new(config, db, limiter));
        Self { state }
    }

    fn router(&self) -> Router {
        gatekeeper_core::router(self.state.clone())
    }
}

fn chat_request(bearer: &str, model: &str) -> Request<Body> {
    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "hello"}],
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn happy_path_non_streaming_returns_completion() {
    let upstream = spawn_mock_upstream().await;
    let harness = Harness::new(upstream, 1_000_000).await;

    let response = harness.router().oneshot(chat_request("sk-proxy-test", "gpt-4o-mini")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(value["usage"]["prompt_tokens"], 5);
}

#[tokio::test]
async fn unknown_bearer_credential_is_rejected() {
    let upstream = spawn_mock_upstream().await;
    let harness = Harness::new(upstream, 1_000_000).await;

    let response = harness.router().oneshot(chat_request("sk-proxy-does-not-exist", "gpt-4o-mini")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn model_outside_allow_list_is_rejected() {
    let upstream = spawn_mock_upstream().await;
    let harness = Harness::with_allow_list(upstream, 1_000_000, Some(serde_json::json!(["gpt-4o"]))).await;

    let response = harness.router().oneshot(chat_request("sk-proxy-test", "gpt-4o-mini")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exhausted_monthly_quota_is_rejected() {
    let upstream = spawn_mock_upstream().await;
    let harness = Harness::new(upstream, 0).await;

    let response = harness.router().oneshot(chat_request("sk-proxy-test", "gpt-4o-mini")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
