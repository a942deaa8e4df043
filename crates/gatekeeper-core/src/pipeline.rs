use std::time::Instant;

use gatekeeper_common::UpstreamDialect;
use gatekeeper_protocol::openai::create_chat_completions::request::CreateChatCompletionRequestBody;
use gatekeeper_ratelimit::Scope;
use gatekeeper_storage::entities::proxy_credentials::Column as ProxyCredentialColumn;
use gatekeeper_storage::entities::proxy_credentials::Entity as ProxyCredentials;
use gatekeeper_storage::entities::users::Entity as Users;
use gatekeeper_storage::{QuotaDenyReason, SelectedCredential};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::Value as JsonValue;

use crate::error::{PipelineError, RateLimitedDetail};
use crate::state::AppState;

/// Everything steps 1-8 resolve, handed to the dispatch/relay step. `model`
/// is the string the caller asked for, kept even when the deployment-scoped
/// dialect elides it from the outbound body, since accounting still needs it.
pub struct PipelineRequest {
    pub user_id: i64,
    pub credential_id: i64,
    pub upstream_id: i64,
    pub upstream_dialect: UpstreamDialect,
    pub upstream_base_url: Option<String>,
    pub upstream_endpoint: Option<String>,
    pub upstream_deployment: Option<String>,
    pub upstream_api_version: Option<String>,
    pub upstream_api_key: String,
    pub model: String,
    pub est_tokens: i64,
    pub body: CreateChatCompletionRequestBody,
    pub started_at: Instant,
}

/// `Σ(len(message.content) × 0.25) + (max_tokens or 1000)`, truncated to
/// an integer, as the cheapest available stand-in for a real tokenizer.
pub fn estimate_tokens(body: &CreateChatCompletionRequestBody) -> i64 {
    let chars: usize = body.messages.iter().filter_map(|m| m.content.as_ref()).map(|c| c.text_len()).sum();
    let text_component = (chars as f64) * 0.25;
    let tail = body.max_tokens.unwrap_or(1000);
    text_component as i64 + tail
}

/// Step 1: IP admission. `est_tokens=0` per the design (the IP bucket only
/// meters request count at this point in the pipeline).
pub async fn admit_ip(state: &AppState, client_ip: &str) -> Result<(), PipelineError> {
    let info = state
        .limiter
        .check(Scope::Ip, client_ip, state.config.rate_limit_ip_rpm, state.config.rate_limit_ip_tpm, 0)
        .await;
    if info.current_requests > info.limit_rpm {
        return Err(PipelineError::RateLimited(RateLimitedDetail {
            remaining_requests: info.remaining_requests,
            remaining_tokens: info.remaining_tokens,
            reset_in_seconds: info.reset_in_seconds,
        }));
    }
    Ok(())
}

struct AuthenticatedCredential {
    credential_id: i64,
    user_id: i64,
    allowed_models: Option<JsonValue>,
    rpm_override: Option<i32>,
    tpm_override: Option<i32>,
}

/// Step 2: look up the proxy credential by exact match, require it active,
/// require the owning user active.
async fn authenticate(state: &AppState, bearer: &str) -> Result<AuthenticatedCredential, PipelineError> {
    let credential = ProxyCredentials::find()
        .filter(ProxyCredentialColumn::Key.eq(bearer))
        .filter(ProxyCredentialColumn::IsActive.eq(true))
        .one(&state.db)
        .await
        .map_err(|err| PipelineError::Internal(err.to_string()))?
        .ok_or(PipelineError::Authentication)?;

    let user = Users::find_by_id(credential.user_id)
        .one(&state.db)
        .await
        .map_err(|err| PipelineError::Internal(err.to_string()))?
        .ok_or(PipelineError::Authentication)?;
    if !user.is_active {
        return Err(PipelineError::InactiveUser);
    }

    Ok(AuthenticatedCredential {
        credential_id: credential.id,
        user_id: user.id,
        allowed_models: credential.allowed_models,
        rpm_override: credential.rpm_override,
        tpm_override: credential.tpm_override,
    })
}

/// Steps 2-7: authenticate, rate-limit the credential, check the model
/// allow-list, check quota, select and unseal an upstream credential.
/// Returns everything the dispatch step needs.
pub async fn prepare(
    state: &AppState,
    bearer: &str,
    body: CreateChatCompletionRequestBody,
) -> Result<PipelineRequest, PipelineError> {
    let auth = authenticate(state, bearer).await?;

    let est_tokens = estimate_tokens(&body);
    let limit_rpm = auth.rpm_override.map(|v| v.max(0) as u32).unwrap_or(state.config.rate_limit_rpm);
    let limit_tpm = auth.tpm_override.map(|v| v.max(0) as u32).unwrap_or(state.config.rate_limit_tpm);
    let info = state.limiter.check(Scope::Key, bearer, limit_rpm, limit_tpm, est_tokens.max(0) as u32).await;
    if info.current_requests > info.limit_rpm || info.current_tokens > info.limit_tpm {
        return Err(PipelineError::RateLimited(RateLimitedDetail {
            remaining_requests: info.remaining_requests,
            remaining_tokens: info.remaining_tokens,
            reset_in_seconds: info.reset_in_seconds,
        }));
    }

    if let Some(allowed) = &auth.allowed_models {
        let allowed_list: Vec<String> = serde_json::from_value(allowed.clone()).unwrap_or_default();
        if !allowed_list.is_empty() && !allowed_list.iter().any(|m| m == &body.model) {
            return Err(PipelineError::ModelNotAllowed(body.model.clone()));
        }
    }

    match state.tracker.check_quota(auth.user_id, est_tokens).await.map_err(|err| PipelineError::Internal(err.to_string()))? {
        Ok(()) => {}
        Err(QuotaDenyReason::UserMissing | QuotaDenyReason::UserInactive) => return Err(PipelineError::InactiveUser),
        Err(QuotaDenyReason::MonthlyQuotaExceeded) => return Err(PipelineError::QuotaExceeded),
    }

    let selected: SelectedCredential = state
        .pool
        .select(state.config.upstream_type)
        .await
        .map_err(|err| PipelineError::Internal(err.to_string()))?
        .ok_or(PipelineError::PoolExhausted)?;

    let plaintext_key = match state.pool.unseal(&selected.sealed_key) {
        Ok(key) => key,
        Err(_) => {
            let err = PipelineError::Cipher;
            if err.blames_credential() {
                if let Err(pool_err) = state.pool.record_failure(selected.id, "cipher_error").await {
                    tracing::warn!(event = "pool_feedback_failed", error = %pool_err, "failed to record cipher failure against credential");
                }
            }
            return Err(err);
        }
    };

    Ok(PipelineRequest {
        user_id: auth.user_id,
        credential_id: auth.credential_id,
        upstream_id: selected.id,
        upstream_dialect: selected.kind,
        upstream_base_url: state.config.upstream_base_url.clone(),
        upstream_endpoint: selected.endpoint,
        upstream_deployment: selected.deployment,
        upstream_api_version: selected.api_version,
        upstream_api_key: plaintext_key,
        model: body.model.clone(),
        est_tokens,
        body,
        started_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_protocol::openai::create_chat_completions::types::{ChatCompletionRequestMessage, ChatCompletionRole, MessageContent};

    fn body_with(content: &str, max_tokens: Option<i64>) -> CreateChatCompletionRequestBody {
        CreateChatCompletionRequestBody {
            messages: vec![ChatCompletionRequestMessage {
                role: ChatCompletionRole::User,
                content: Some(MessageContent::Text(content.to_string())),
                name: None,
                tool_call_id: None,
            }],
            model: "gpt-4o-mini".to_string(),
            stream: None,
            temperature: None,
            top_p: None,
            n: None,
            stop: None,
            max_tokens,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
        }
    }

    #[test]
    fn estimate_tokens_uses_quarter_char_plus_default_tail() {
        let body = body_with("a".repeat(40).as_str(), None);
        assert_eq!(estimate_tokens(&body), 10 + 1000);
    }

    #[test]
    fn estimate_tokens_uses_max_tokens_as_tail_when_present() {
        let body = body_with("a".repeat(40).as_str(), Some(50));
        assert_eq!(estimate_tokens(&body), 10 + 50);
    }
}
