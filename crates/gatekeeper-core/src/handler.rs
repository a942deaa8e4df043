use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use gatekeeper_protocol::openai::create_chat_completions::request::CreateChatCompletionRequestBody;
use gatekeeper_upstream::{UpstreamEvent, UpstreamTarget, dispatch};
use serde_json::json;
use uuid::Uuid;

use crate::auth::{client_ip, extract_bearer_credential};
use crate::error::PipelineError;
use crate::pipeline::{PipelineRequest, prepare};
use crate::relay::{RelayContext, SseRelay};
use crate::state::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn chat_completions(State(state): State<SharedState>, headers: HeaderMap, raw_body: Bytes) -> Response {
    let trace_id = Uuid::new_v4().to_string();
    let ip = client_ip(&headers);

    if let Err(err) = crate::pipeline::admit_ip(&state, &ip).await {
        return error_response(&trace_id, &err);
    }

    let Some(bearer) = extract_bearer_credential(&headers) else {
        return error_response(&trace_id, &PipelineError::Authentication);
    };

    let body: CreateChatCompletionRequestBody = match serde_json::from_slice(&raw_body) {
        Ok(body) => body,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, axum::Json(json!({ "detail": format!("invalid request body: {err}") }))).into_response();
        }
    };
    let is_stream = body.stream.unwrap_or(false);
    let model = body.model.clone();

    let captured_body = if state.config.log_prompt_body { serde_json::from_slice(&raw_body).ok() } else { None };
    let user_agent = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);

    tracing::info!(event = "pipeline_admitted", trace_id = %trace_id, model = %model, is_stream, "request admitted");

    let prepared: PipelineRequest = match prepare(&state, &bearer, body).await {
        Ok(prepared) => prepared,
        Err(err) => {
            tracing::warn!(event = "pipeline_rejected", trace_id = %trace_id, error = %err, "request rejected before dispatch");
            return error_response(&trace_id, &err);
        }
    };

    let target = UpstreamTarget {
        dialect: prepared.upstream_dialect,
        base_url: prepared.upstream_base_url.clone(),
        endpoint: prepared.upstream_endpoint.clone(),
        deployment: prepared.upstream_deployment.clone(),
        api_version: prepared.upstream_api_version.clone(),
        api_key: prepared.upstream_api_key.clone(),
        connect_timeout: state.upstream_connect_timeout(),
        request_timeout: state.upstream_request_timeout(),
    };

    let event_stream = match dispatch(&trace_id, &target, &prepared.body).await {
        Ok(stream) => stream,
        Err(err) => {
            let failure = PipelineError::Internal(err.to_string());
            record_dispatch_failure(&state, &prepared, &ip, user_agent.clone(), captured_body.clone(), prepared.started_at).await;
            return error_response(&trace_id, &failure);
        }
    };

    let relay_ctx = RelayContext {
        state: state.clone(),
        user_id: prepared.user_id,
        credential_id: prepared.credential_id,
        upstream_id: prepared.upstream_id,
        model: prepared.model.clone(),
        client_ip: ip,
        user_agent,
        request_body: captured_body,
        started_at: prepared.started_at,
    };

    if is_stream {
        let body = Body::from_stream(SseRelay::new(event_stream, relay_ctx));
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(body)
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    } else {
        non_streaming_response(event_stream, relay_ctx).await
    }
}

async fn non_streaming_response(
    mut event_stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = UpstreamEvent> + Send>>,
    ctx: RelayContext,
) -> Response {
    use futures_util::StreamExt;

    let event = event_stream.next().await;
    let latency_ms = ctx.started_at.elapsed().as_millis() as i64;
    match event {
        Some(UpstreamEvent::Complete(payload)) => {
            let (prompt, completion) = extract_usage(&payload);
            record_success(&ctx, prompt, completion, 200, latency_ms).await;
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Some(UpstreamEvent::Error { status, body }) => {
            record_failure(&ctx, status as i32, latency_ms, "upstream_error", &body.to_string()).await;
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (code, axum::Json(body)).into_response()
        }
        _ => {
            record_failure(&ctx, 500, latency_ms, "internal", "upstream produced no response").await;
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(json!({ "detail": "upstream produced no response" }))).into_response()
        }
    }
}

fn extract_usage(payload: &serde_json::Value) -> (i64, i64) {
    let Some(usage) = payload.get("usage") else { return (0, 0) };
    (
        usage.get("prompt_tokens").and_then(serde_json::Value::as_i64).unwrap_or(0),
        usage.get("completion_tokens").and_then(serde_json::Value::as_i64).unwrap_or(0),
    )
}

async fn record_success(ctx: &RelayContext, prompt_tokens: i64, completion_tokens: i64, status_code: i32, latency_ms: i64) {
    let usage_ctx = gatekeeper_storage::UsageContext {
        user_id: ctx.user_id,
        credential_id: ctx.credential_id,
        upstream_id: Some(ctx.upstream_id),
        model: ctx.model.clone(),
        prompt_tokens,
        completion_tokens,
        status_code,
        latency_ms,
        client_ip: Some(ctx.client_ip.clone()),
        user_agent: ctx.user_agent.clone(),
        request_body: ctx.request_body.clone(),
        error_type: None,
        error_message: None,
    };
    if let Err(err) = ctx.state.tracker.record(&usage_ctx).await {
        tracing::warn!(event = "usage_record_failed", error = %err);
    }
    if let Err(err) = ctx.state.pool.record_success(ctx.upstream_id, prompt_tokens + completion_tokens).await {
        tracing::warn!(event = "pool_feedback_failed", error = %err);
    }
}

async fn record_failure(ctx: &RelayContext, status_code: i32, latency_ms: i64, error_type: &str, error_message: &str) {
    let usage_ctx = gatekeeper_storage::UsageContext {
        user_id: ctx.user_id,
        credential_id: ctx.credential_id,
        upstream_id: Some(ctx.upstream_id),
        model: ctx.model.clone(),
        prompt_tokens: 0,
        completion_tokens: 0,
        status_code,
        latency_ms,
        client_ip: Some(ctx.client_ip.clone()),
        user_agent: ctx.user_agent.clone(),
        request_body: ctx.request_body.clone(),
        error_type: Some(error_type.to_string()),
        error_message: Some(error_message.to_string()),
    };
    if let Err(err) = ctx.state.tracker.record(&usage_ctx).await {
        tracing::warn!(event = "usage_record_failed", error = %err);
    }
    if let Err(err) = ctx.state.pool.record_failure(ctx.upstream_id, error_type).await {
        tracing::warn!(event = "pool_feedback_failed", error = %err);
    }
}

async fn record_dispatch_failure(
    state: &SharedState,
    prepared: &PipelineRequest,
    ip: &str,
    user_agent: Option<String>,
    request_body: Option<serde_json::Value>,
    started_at: Instant,
) {
    let ctx = RelayContext {
        state: state.clone(),
        user_id: prepared.user_id,
        credential_id: prepared.credential_id,
        upstream_id: prepared.upstream_id,
        model: prepared.model.clone(),
        client_ip: ip.to_string(),
        user_agent,
        request_body,
        started_at,
    };
    record_failure(&ctx, 502, started_at.elapsed().as_millis() as i64, "transport_error", "failed to dispatch upstream request").await;
}

fn error_response(trace_id: &str, err: &PipelineError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(err.body())).into_response();
    if let Ok(value) = header::HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("x-trace-id", value);
    }
    response
}
