use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum AppConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which vendor dialect the upstream credentials in the pool speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamDialect {
    /// `POST {base_url}/chat/completions`, `Authorization: Bearer {key}`.
    Native,
    /// `POST {endpoint}/openai/deployments/{deployment}/chat/completions`, `api-key: {key}`.
    DeploymentScoped,
}

impl fmt::Display for UpstreamDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamDialect::Native => write!(f, "native"),
            UpstreamDialect::DeploymentScoped => write!(f, "deployment-scoped"),
        }
    }
}

impl std::str::FromStr for UpstreamDialect {
    type Err = AppConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(UpstreamDialect::Native),
            "deployment-scoped" | "deployment_scoped" | "azure" => Ok(UpstreamDialect::DeploymentScoped),
            other => Err(AppConfigError::Invalid {
                field: "UPSTREAM_TYPE",
                reason: format!("unrecognized dialect {other:?}"),
            }),
        }
    }
}

/// Final, merged process configuration. Nothing below the bootstrap layer
/// reads environment variables directly; everything is threaded through
/// this struct once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,

    pub upstream_type: UpstreamDialect,
    pub upstream_base_url: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,

    pub rate_limit_rpm: u32,
    pub rate_limit_tpm: u32,
    pub rate_limit_ip_rpm: u32,
    pub rate_limit_ip_tpm: u32,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_cooldown_seconds: i64,

    pub default_monthly_quota_tokens: i64,

    pub upstream_timeout_secs: u64,
    pub upstream_connect_timeout_secs: u64,

    pub encryption_key: String,
    pub log_prompt_body: bool,
}

impl AppConfig {
    /// Caller-facing validation, run once at bootstrap so a bad value fails
    /// fast instead of surfacing as a mysterious error mid-request.
    pub fn validate(&self) -> Result<(), AppConfigError> {
        if self.encryption_key.len() < 32 {
            return Err(AppConfigError::Invalid {
                field: "ENCRYPTION_KEY",
                reason: "must be at least 32 bytes".to_string(),
            });
        }
        if self.upstream_type == UpstreamDialect::Native && self.upstream_base_url.is_none() {
            return Err(AppConfigError::MissingField("UPSTREAM_BASE_URL"));
        }
        if self.upstream_type == UpstreamDialect::DeploymentScoped {
            if self.endpoint.is_none() {
                return Err(AppConfigError::MissingField("ENDPOINT"));
            }
            if self.api_version.is_none() {
                return Err(AppConfigError::MissingField("API_VERSION"));
            }
        }
        Ok(())
    }
}
