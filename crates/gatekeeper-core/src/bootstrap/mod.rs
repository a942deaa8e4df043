use anyhow::Context;
use clap::Parser;

use gatekeeper_common::{AppConfig, UpstreamDialect};
use gatekeeper_ratelimit::RateLimiter;
use gatekeeper_storage::connect_shared;

use crate::state::AppState;

/// CLI surface mirroring [`AppConfig`]. Every field is a plain `Option<String>`
/// so bootstrap can apply CLI > ENV > default precedence itself with the same
/// sanitize/parse helpers regardless of whether the value came from a flag or
/// from `clap`'s `env` fallback.
#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeeper", version, about = "OpenAI-compatible chat completions reverse proxy")]
pub struct CliArgs {
    #[arg(long, env = "HOST")]
    pub host: Option<String>,
    #[arg(long, env = "PORT")]
    pub port: Option<String>,
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[arg(long, env = "UPSTREAM_TYPE")]
    pub upstream_type: Option<String>,
    #[arg(long, env = "UPSTREAM_BASE_URL")]
    pub upstream_base_url: Option<String>,
    #[arg(long, env = "ENDPOINT")]
    pub endpoint: Option<String>,
    #[arg(long, env = "API_VERSION")]
    pub api_version: Option<String>,

    #[arg(long, env = "RATE_LIMIT_RPM")]
    pub rate_limit_rpm: Option<String>,
    #[arg(long, env = "RATE_LIMIT_TPM")]
    pub rate_limit_tpm: Option<String>,
    #[arg(long, env = "RATE_LIMIT_IP_RPM")]
    pub rate_limit_ip_rpm: Option<String>,
    #[arg(long, env = "RATE_LIMIT_IP_TPM")]
    pub rate_limit_ip_tpm: Option<String>,

    #[arg(long, env = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: Option<String>,
    #[arg(long, env = "CIRCUIT_BREAKER_COOLDOWN_SECONDS")]
    pub circuit_breaker_cooldown_seconds: Option<String>,

    #[arg(long, env = "DEFAULT_MONTHLY_QUOTA_TOKENS")]
    pub default_monthly_quota_tokens: Option<String>,

    #[arg(long, env = "UPSTREAM_TIMEOUT")]
    pub upstream_timeout: Option<String>,
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT")]
    pub upstream_connect_timeout: Option<String>,

    #[arg(long, env = "ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,
    #[arg(long, env = "LOG_PROMPT_BODY")]
    pub log_prompt_body: Option<String>,
}

pub struct Bootstrap {
    pub config: AppConfig,
    pub state: AppState,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    let args = CliArgs::parse();
    bootstrap(args).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let config = build_config(args)?;
    config.validate().context("config validation")?;

    let db = connect_shared(&config.database_url).await.context("connect database")?;
    let limiter = RateLimiter::new(&config.redis_url).context("build rate limiter")?;
    let state = AppState::new(config.clone(), db, limiter);

    Ok(Bootstrap { config, state })
}

fn build_config(args: CliArgs) -> anyhow::Result<AppConfig> {
    let host = sanitize_optional(args.host).unwrap_or_else(|| "0.0.0.0".to_string());
    let port = parse_u16(args.port, "PORT")?.unwrap_or(8080);
    let database_url =
        sanitize_optional(args.database_url).unwrap_or_else(|| "sqlite::memory:".to_string());
    let redis_url = sanitize_optional(args.redis_url).unwrap_or_else(|| "redis://127.0.0.1".to_string());

    let upstream_type = match sanitize_optional(args.upstream_type) {
        Some(raw) => raw.parse::<UpstreamDialect>().map_err(|err| anyhow::anyhow!("{err}"))?,
        None => UpstreamDialect::Native,
    };
    let upstream_base_url = sanitize_optional(args.upstream_base_url);
    let endpoint = sanitize_optional(args.endpoint);
    let api_version = sanitize_optional(args.api_version);

    let rate_limit_rpm = parse_u32(args.rate_limit_rpm, "RATE_LIMIT_RPM")?.unwrap_or(60);
    let rate_limit_tpm = parse_u32(args.rate_limit_tpm, "RATE_LIMIT_TPM")?.unwrap_or(100_000);
    let rate_limit_ip_rpm = parse_u32(args.rate_limit_ip_rpm, "RATE_LIMIT_IP_RPM")?.unwrap_or(120);
    let rate_limit_ip_tpm = parse_u32(args.rate_limit_ip_tpm, "RATE_LIMIT_IP_TPM")?.unwrap_or(200_000);

    let circuit_breaker_failure_threshold =
        parse_u32(args.circuit_breaker_failure_threshold, "CIRCUIT_BREAKER_FAILURE_THRESHOLD")?.unwrap_or(5);
    let circuit_breaker_cooldown_seconds =
        parse_i64(args.circuit_breaker_cooldown_seconds, "CIRCUIT_BREAKER_COOLDOWN_SECONDS")?.unwrap_or(300);

    let default_monthly_quota_tokens =
        parse_i64(args.default_monthly_quota_tokens, "DEFAULT_MONTHLY_QUOTA_TOKENS")?.unwrap_or(1_000_000);

    let upstream_timeout_secs = parse_u64(args.upstream_timeout, "UPSTREAM_TIMEOUT")?.unwrap_or(300);
    let upstream_connect_timeout_secs =
        parse_u64(args.upstream_connect_timeout, "UPSTREAM_CONNECT_TIMEOUT")?.unwrap_or(30);

    let encryption_key = sanitize_optional(args.encryption_key)
        .ok_or_else(|| anyhow::anyhow!("ENCRYPTION_KEY is required"))?;
    let log_prompt_body = parse_bool(args.log_prompt_body, "LOG_PROMPT_BODY")?.unwrap_or(false);

    Ok(AppConfig {
        host,
        port,
        database_url,
        redis_url,
        upstream_type,
        upstream_base_url,
        endpoint,
        api_version,
        rate_limit_rpm,
        rate_limit_tpm,
        rate_limit_ip_rpm,
        rate_limit_ip_tpm,
        circuit_breaker_failure_threshold,
        circuit_breaker_cooldown_seconds,
        default_monthly_quota_tokens,
        upstream_timeout_secs,
        upstream_connect_timeout_secs,
        encryption_key,
        log_prompt_body,
    })
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

fn parse_u16(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u16>> {
    let Some(raw) = sanitize_optional(value) else { return Ok(None) };
    Ok(Some(raw.parse::<u16>().with_context(|| format!("invalid {env_name} value: {raw}"))?))
}

fn parse_u32(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u32>> {
    let Some(raw) = sanitize_optional(value) else { return Ok(None) };
    Ok(Some(raw.parse::<u32>().with_context(|| format!("invalid {env_name} value: {raw}"))?))
}

fn parse_u64(value: Option<String>, env_name: &str) -> anyhow::Result<Option<u64>> {
    let Some(raw) = sanitize_optional(value) else { return Ok(None) };
    Ok(Some(raw.parse::<u64>().with_context(|| format!("invalid {env_name} value: {raw}"))?))
}

fn parse_i64(value: Option<String>, env_name: &str) -> anyhow::Result<Option<i64>> {
    let Some(raw) = sanitize_optional(value) else { return Ok(None) };
    Ok(Some(raw.parse::<i64>().with_context(|| format!("invalid {env_name} value: {raw}"))?))
}

fn parse_bool(value: Option<String>, env_name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = sanitize_optional(value) else { return Ok(None) };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(anyhow::anyhow!("invalid {env_name} value: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            host: None,
            port: None,
            database_url: None,
            redis_url: None,
            upstream_type: None,
            upstream_base_url: Some("https://api.openai.com/v1".to_string()),
            endpoint: None,
            api_version: None,
            rate_limit_rpm: None,
            rate_limit_tpm: None,
            rate_limit_ip_rpm: None,
            rate_limit_ip_tpm: None,
            circuit_breaker_failure_threshold: None,
            circuit_breaker_cooldown_seconds: None,
            default_monthly_quota_tokens: None,
            upstream_timeout: None,
            upstream_connect_timeout: None,
            encryption_key: Some("0".repeat(32)),
            log_prompt_body: None,
        }
    }

    #[test]
    fn fills_defaults_when_unset() {
        let config = build_config(args()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit_rpm, 60);
        assert_eq!(config.circuit_breaker_cooldown_seconds, 300);
    }

    #[test]
    fn missing_encryption_key_fails() {
        let mut a = args();
        a.encryption_key = None;
        assert!(build_config(a).is_err());
    }

    #[test]
    fn placeholder_env_value_treated_as_unset() {
        let mut a = args();
        a.host = Some("${HOST}".to_string());
        let config = build_config(a).unwrap();
        assert_eq!(config.host, "0.0.0.0");
    }
}
