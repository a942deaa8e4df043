use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use gatekeeper_storage::UsageContext;
use serde_json::{Value as JsonValue, json};

use crate::state::SharedState;

/// Everything the relay step (§4.6 step 9) needs to build an accounting
/// record (§4.6 step 10) once the response has been fully committed to the
/// client, whichever path it took.
pub struct RelayContext {
    pub state: SharedState,
    pub user_id: i64,
    pub credential_id: i64,
    pub upstream_id: i64,
    pub model: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub request_body: Option<JsonValue>,
    pub started_at: std::time::Instant,
}

fn extract_usage(payload: &JsonValue) -> Option<(i64, i64)> {
    let usage = payload.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(JsonValue::as_i64).unwrap_or(0);
    let completion = usage.get("completion_tokens").and_then(JsonValue::as_i64).unwrap_or(0);
    Some((prompt, completion))
}

async fn finish(ctx: RelayContext, prompt_tokens: i64, completion_tokens: i64, status_code: i32, error: Option<(String, String)>) {
    let latency_ms = ctx.started_at.elapsed().as_millis() as i64;
    let (error_type, error_message) = error.map(|(t, m)| (Some(t), Some(m))).unwrap_or((None, None));

    let usage_ctx = UsageContext {
        user_id: ctx.user_id,
        credential_id: ctx.credential_id,
        upstream_id: Some(ctx.upstream_id),
        model: ctx.model,
        prompt_tokens,
        completion_tokens,
        status_code,
        latency_ms,
        client_ip: Some(ctx.client_ip),
        user_agent: ctx.user_agent,
        request_body: ctx.request_body,
        error_type,
        error_message,
    };

    if let Err(err) = ctx.state.tracker.record(&usage_ctx).await {
        tracing::warn!(event = "usage_record_failed", error = %err, "failed to persist usage record");
    }

    if status_code < 400 {
        if let Err(err) = ctx.state.pool.record_success(ctx.upstream_id, prompt_tokens + completion_tokens).await {
            tracing::warn!(event = "pool_feedback_failed", error = %err, "failed to record upstream success");
        }
    } else {
        let error_type = usage_ctx.error_type.clone().unwrap_or_else(|| "upstream_error".to_string());
        if let Err(err) = ctx.state.pool.record_failure(ctx.upstream_id, &error_type).await {
            tracing::warn!(event = "pool_feedback_failed", error = %err, "failed to record upstream failure");
        }
    }
}

/// Wraps the uniform upstream event stream into SSE byte frames, capturing
/// token usage as it passes through and spawning the accounting write
/// (§4.6 step 10) exactly once, whether the stream ends in `Done`, `Error`,
/// or is simply dropped by the caller (client disconnect).
pub struct SseRelay {
    inner: Pin<Box<dyn Stream<Item = gatekeeper_upstream::UpstreamEvent> + Send>>,
    ctx: Option<RelayContext>,
    prompt_tokens: i64,
    completion_tokens: i64,
    finalized: bool,
}

impl SseRelay {
    pub fn new(inner: Pin<Box<dyn Stream<Item = gatekeeper_upstream::UpstreamEvent> + Send>>, ctx: RelayContext) -> Self {
        Self { inner, ctx: Some(ctx), prompt_tokens: 0, completion_tokens: 0, finalized: false }
    }

    fn finalize(&mut self, status_code: i32, error: Option<(String, String)>) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if let Some(ctx) = self.ctx.take() {
            let (prompt, completion) = (self.prompt_tokens, self.completion_tokens);
            tokio::spawn(finish(ctx, prompt, completion, status_code, error));
        }
    }
}

impl Drop for SseRelay {
    /// Catches the case `poll_next` never does: the caller drops the body
    /// stream (client disconnect) before it reaches a terminal event. Still
    /// accounts for whatever usage was observed up to the drop. Recorded as
    /// a 200 for pool-feedback purposes since the disconnect isn't the
    /// upstream credential's fault; the audit row still carries the error.
    fn drop(&mut self) {
        self.finalize(200, Some(("client_disconnected".to_string(), "stream dropped before completion".to_string())));
    }
}

impl Stream for SseRelay {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finalized {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.finalize(200, None);
                Poll::Ready(None)
            }
            Poll::Ready(Some(gatekeeper_upstream::UpstreamEvent::Data(payload))) => {
                if let Some((prompt, completion)) = extract_usage(&payload) {
                    self.prompt_tokens = prompt;
                    self.completion_tokens = completion;
                }
                Poll::Ready(Some(Ok(Bytes::from(format!("data: {payload}\n\n")))))
            }
            Poll::Ready(Some(gatekeeper_upstream::UpstreamEvent::Done)) => {
                self.finalize(200, None);
                Poll::Ready(Some(Ok(Bytes::from_static(b"data: [DONE]\n\n"))))
            }
            Poll::Ready(Some(gatekeeper_upstream::UpstreamEvent::Complete(payload))) => {
                if let Some((prompt, completion)) = extract_usage(&payload) {
                    self.prompt_tokens = prompt;
                    self.completion_tokens = completion;
                }
                self.finalize(200, None);
                Poll::Ready(Some(Ok(Bytes::from(format!("data: {payload}\n\n")))))
            }
            Poll::Ready(Some(gatekeeper_upstream::UpstreamEvent::Error { status, body })) => {
                let envelope = json!({ "error": { "message": body, "status": status } });
                self.finalize(status as i32, Some(("upstream_error".to_string(), body.to_string())));
                Poll::Ready(Some(Ok(Bytes::from(format!("data: {envelope}\n\n")))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_payload() {
        let payload = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}});
        assert_eq!(extract_usage(&payload), Some((10, 5)));
    }

    #[test]
    fn missing_usage_field_yields_none() {
        assert_eq!(extract_usage(&json!({"choices": []})), None);
    }
}
