use std::time::{Duration, Instant};

use futures_util::StreamExt;
use gatekeeper_common::UpstreamDialect;
use gatekeeper_protocol::openai::create_chat_completions::request::CreateChatCompletionRequestBody;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::client::{UpstreamClientError, shared_client};
use crate::event::UpstreamEvent;
use crate::stream::SseEventStream;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamDispatchError {
    #[error(transparent)]
    Client(#[from] UpstreamClientError),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

/// Everything the dispatch path needs to know about one upstream call,
/// resolved from the selected `UpstreamCredential` and process config.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub dialect: UpstreamDialect,
    pub base_url: Option<String>,
    pub endpoint: Option<String>,
    pub deployment: Option<String>,
    pub api_version: Option<String>,
    pub api_key: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl UpstreamTarget {
    fn url(&self) -> String {
        match self.dialect {
            UpstreamDialect::Native => format!(
                "{}/chat/completions",
                self.base_url.as_deref().unwrap_or_default().trim_end_matches('/')
            ),
            UpstreamDialect::DeploymentScoped => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.endpoint.as_deref().unwrap_or_default().trim_end_matches('/'),
                self.deployment.as_deref().unwrap_or_default(),
                self.api_version.as_deref().unwrap_or_default(),
            ),
        }
    }
}

/// Builds the outbound JSON body for `target`'s dialect. The deployment-scoped
/// dialect drops `model` since the deployment name already selects the model.
fn build_body(body: &CreateChatCompletionRequestBody, dialect: UpstreamDialect) -> JsonValue {
    let mut value = serde_json::to_value(body).expect("chat completion body is always serializable");
    if dialect == UpstreamDialect::DeploymentScoped {
        if let Some(obj) = value.as_object_mut() {
            obj.remove("model");
        }
    }
    value
}

fn log_request(trace_id: &str, dialect: UpstreamDialect, model: &str, is_stream: bool) -> Instant {
    info!(
        event = "upstream_request",
        trace_id,
        provider = %dialect,
        model,
        is_stream,
        "dispatching upstream request"
    );
    Instant::now()
}

fn log_response_ok(trace_id: &str, dialect: UpstreamDialect, status: u16, elapsed_ms: u128, is_stream: bool) {
    info!(
        event = "upstream_response",
        trace_id,
        provider = %dialect,
        status,
        elapsed_ms,
        is_stream,
    );
}

fn log_response_err(trace_id: &str, dialect: UpstreamDialect, elapsed_ms: u128, error: &str) {
    warn!(
        event = "upstream_response",
        trace_id,
        provider = %dialect,
        status = "error",
        elapsed_ms,
        error,
    );
}

/// Issues one request against `target` and returns a boxed stream of
/// [`UpstreamEvent`]. For `stream=false` bodies the stream yields exactly
/// one `Complete` or `Error` event; for `stream=true` bodies it relays
/// `Data`/`Done` as they arrive.
pub async fn dispatch(
    trace_id: &str,
    target: &UpstreamTarget,
    body: &CreateChatCompletionRequestBody,
) -> Result<std::pin::Pin<Box<dyn futures_util::Stream<Item = UpstreamEvent> + Send>>, UpstreamDispatchError> {
    let client = shared_client(target.connect_timeout, target.request_timeout)?;
    let is_stream = body.stream.unwrap_or(false);
    let payload = build_body(body, target.dialect);

    let mut builder = client.post(target.url());
    builder = match target.dialect {
        UpstreamDialect::Native => builder.bearer_auth(&target.api_key),
        UpstreamDialect::DeploymentScoped => builder.header("api-key", &target.api_key),
    };
    builder = builder.json(&payload);

    let started_at = log_request(trace_id, target.dialect, &body.model, is_stream);
    let response = match builder.send().await {
        Ok(resp) => resp,
        Err(err) => {
            log_response_err(trace_id, target.dialect, started_at.elapsed().as_millis(), &err.to_string());
            return Err(UpstreamDispatchError::Transport(err.to_string()));
        }
    };

    let status = response.status();
    log_response_ok(
        trace_id,
        target.dialect,
        status.as_u16(),
        started_at.elapsed().as_millis(),
        is_stream,
    );

    if !status.is_success() {
        let status_code = status.as_u16();
        let body = response
            .bytes()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<JsonValue>(&b).ok())
            .unwrap_or_else(|| serde_json::json!({"error": {"message": "upstream error"}}));
        return Ok(Box::pin(futures_util::stream::once(async move {
            UpstreamEvent::Error { status: status_code, body }
        })));
    }

    if is_stream {
        let byte_stream = response
            .bytes_stream()
            .map(|item| item.map_err(|err| std::io::Error::other(err.to_string())));
        Ok(Box::pin(SseEventStream::new(byte_stream)))
    } else {
        let value = match response.bytes().await {
            Ok(bytes) => serde_json::from_slice::<JsonValue>(&bytes).unwrap_or(JsonValue::Null),
            Err(err) => {
                return Ok(Box::pin(futures_util::stream::once(async move {
                    UpstreamEvent::Error {
                        status: 0,
                        body: serde_json::json!({"error": {"message": err.to_string()}}),
                    }
                })));
            }
        };
        Ok(Box::pin(futures_util::stream::once(async move {
            UpstreamEvent::Complete(value)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(dialect: UpstreamDialect) -> UpstreamTarget {
        UpstreamTarget {
            dialect,
            base_url: Some("https://api.openai.com/v1".to_string()),
            endpoint: Some("https://my-resource.openai.azure.com".to_string()),
            deployment: Some("gpt-4o-mini".to_string()),
            api_version: Some("2024-08-01".to_string()),
            api_key: "sk-test".to_string(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn native_url_hits_chat_completions() {
        let t = target(UpstreamDialect::Native);
        assert_eq!(t.url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn deployment_scoped_url_includes_deployment_and_version() {
        let t = target(UpstreamDialect::DeploymentScoped);
        assert_eq!(
            t.url(),
            "https://my-resource.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-08-01"
        );
    }

    #[test]
    fn deployment_scoped_body_drops_model() {
        let body = CreateChatCompletionRequestBody {
            messages: vec![],
            model: "gpt-4o-mini".to_string(),
            stream: None,
            temperature: None,
            top_p: None,
            n: None,
            stop: None,
            max_tokens: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
        };
        let native = build_body(&body, UpstreamDialect::Native);
        let scoped = build_body(&body, UpstreamDialect::DeploymentScoped);
        assert_eq!(native["model"], "gpt-4o-mini");
        assert!(scoped.get("model").is_none());
    }
}
