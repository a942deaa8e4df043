use http::HeaderMap;

/// Pulls the bearer token out of `Authorization: Bearer sk-proxy-...`.
/// Case-insensitive on the `Bearer` scheme, matching the teacher's header
/// extraction style.
pub fn extract_bearer_credential(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() { None } else { Some(token.to_string()) }
}

/// Best-effort client IP from `X-Forwarded-For` (first hop) or `X-Real-IP`,
/// falling back to `"unknown"` per the admission step's contract.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            http::header::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn extracts_bearer_token() {
        let headers = headers_with("authorization", "Bearer sk-proxy-abc123");
        assert_eq!(extract_bearer_credential(&headers), Some("sk-proxy-abc123".to_string()));
    }

    #[test]
    fn missing_header_yields_none() {
        assert_eq!(extract_bearer_credential(&HeaderMap::new()), None);
    }

    #[test]
    fn non_bearer_scheme_yields_none() {
        let headers = headers_with("authorization", "Basic dXNlcjpwYXNz");
        assert_eq!(extract_bearer_credential(&headers), None);
    }

    #[test]
    fn forwarded_for_takes_first_hop() {
        let headers = headers_with("x-forwarded-for", "203.0.113.5, 10.0.0.1");
        assert_eq!(client_ip(&headers), "203.0.113.5");
    }

    #[test]
    fn missing_ip_headers_falls_back_to_unknown() {
        assert_eq!(client_ip(&HeaderMap::new()), "unknown");
    }
}
