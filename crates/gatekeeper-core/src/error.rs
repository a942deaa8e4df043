use serde_json::{Value as JsonValue, json};

/// One variant per taxonomy member from the pipeline design. Every variant
/// maps to a fixed HTTP status and JSON body; this is the only place that
/// mapping happens, so pipeline logic never builds an HTTP response itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("missing or invalid bearer credential")]
    Authentication,
    #[error("user inactive")]
    InactiveUser,
    #[error("model {0:?} not in credential allow-list")]
    ModelNotAllowed(String),
    #[error("rate limit exceeded")]
    RateLimited(RateLimitedDetail),
    #[error("monthly quota exceeded")]
    QuotaExceeded,
    #[error("no healthy upstream credential")]
    PoolExhausted,
    #[error("key cipher failure")]
    Cipher,
    #[error("upstream error: {status}")]
    Upstream { status: u16, body: JsonValue },
    #[error("upstream stream error")]
    Stream,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct RateLimitedDetail {
    pub remaining_requests: u32,
    pub remaining_tokens: u32,
    pub reset_in_seconds: u32,
}

impl PipelineError {
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Authentication => 401,
            PipelineError::InactiveUser => 403,
            PipelineError::ModelNotAllowed(_) => 400,
            PipelineError::RateLimited(_) => 429,
            PipelineError::QuotaExceeded => 403,
            PipelineError::PoolExhausted => 503,
            PipelineError::Cipher => 500,
            PipelineError::Upstream { status, .. } => *status,
            PipelineError::Stream => 500,
            PipelineError::Internal(_) => 500,
        }
    }

    /// JSON body shape from the external contract: a plain `{"detail": ...}`
    /// for most kinds, and the richer rate-limit envelope for 429s.
    pub fn body(&self) -> JsonValue {
        match self {
            PipelineError::RateLimited(detail) => json!({
                "error": {
                    "message": "rate limit exceeded",
                    "type": "rate_limit_error",
                    "code": "rate_limit_exceeded",
                    "remaining_requests": detail.remaining_requests,
                    "remaining_tokens": detail.remaining_tokens,
                    "reset_in_seconds": detail.reset_in_seconds,
                }
            }),
            PipelineError::Upstream { body, .. } => body.clone(),
            PipelineError::QuotaExceeded => json!({ "detail": "Monthly quota exceeded" }),
            other => json!({ "detail": other.to_string() }),
        }
    }

    /// Whether this outcome is attributable to the selected upstream
    /// credential (and should therefore count against its breaker).
    pub fn blames_credential(&self) -> bool {
        matches!(self, PipelineError::Cipher | PipelineError::Upstream { .. } | PipelineError::Stream)
    }
}
