//! Pure admission-policy checks for the agent WebSocket upgrade. Kept free
//! of axum and tungstenite types so the policy itself is trivially
//! unit-testable; `hub::mod`'s upgrade callback extracts headers/query and
//! calls into here.

/// Checks an `Origin` header against the configured allow-list.
///
/// When the allow-list is empty, only loopback/localhost origins are
/// accepted, and a missing `Origin` (non-browser client) is accepted too —
/// browsers always send `Origin` on a cross-origin upgrade, so its absence
/// is itself evidence of a non-browser caller.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    match origin {
        None => true,
        Some(origin) => {
            if allowed.iter().any(|a| a == "*") {
                return true;
            }
            if !allowed.is_empty() {
                return allowed.iter().any(|a| a == origin);
            }
            is_loopback_origin(origin)
        }
    }
}

fn is_loopback_origin(origin: &str) -> bool {
    let host = origin
        .split("://")
        .nth(1)
        .unwrap_or(origin)
        .split(['/', ':'])
        .next()
        .unwrap_or("");
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

/// Extracts the shared upgrade token from (in order) a dedicated header, an
/// `Authorization: Bearer` header, or a query parameter.
pub fn extract_token<'a>(
    dedicated_header: Option<&'a str>,
    authorization_header: Option<&'a str>,
    query_token: Option<&'a str>,
) -> Option<&'a str> {
    dedicated_header
        .or_else(|| authorization_header.and_then(|h| h.strip_prefix("Bearer ")).map(str::trim))
        .or(query_token)
}

/// Validates a supplied token against the configured shared secret. When no
/// secret is configured, admission does not require one.
pub fn token_valid(configured: &Option<String>, supplied: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => supplied == Some(expected.as_str()),
    }
}

/// Extracts the agent id from a dedicated header or query parameter.
pub fn extract_agent_id<'a>(header: Option<&'a str>, query: Option<&'a str>) -> Option<&'a str> {
    header.filter(|s| !s.is_empty()).or(query.filter(|s| !s.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_accepts_loopback_only() {
        assert!(origin_allowed(Some("http://localhost:3000"), &[]));
        assert!(origin_allowed(Some("http://127.0.0.1:9000"), &[]));
        assert!(!origin_allowed(Some("https://evil.example.com"), &[]));
    }

    #[test]
    fn missing_origin_is_accepted_as_non_browser() {
        assert!(origin_allowed(None, &["https://app.example.com".to_string()]));
    }

    #[test]
    fn wildcard_allows_anything() {
        assert!(origin_allowed(Some("https://anywhere.example"), &["*".to_string()]));
    }

    #[test]
    fn explicit_allowlist_requires_exact_match() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(origin_allowed(Some("https://app.example.com"), &allowed));
        assert!(!origin_allowed(Some("https://other.example.com"), &allowed));
    }

    #[test]
    fn token_extraction_prefers_dedicated_header() {
        let got = extract_token(Some("h-token"), Some("Bearer b-token"), Some("q-token"));
        assert_eq!(got, Some("h-token"));
    }

    #[test]
    fn token_extraction_falls_back_through_bearer_then_query() {
        assert_eq!(extract_token(None, Some("Bearer b-token"), Some("q-token")), Some("b-token"));
        assert_eq!(extract_token(None, None, Some("q-token")), Some("q-token"));
        assert_eq!(extract_token(None, None, None), None);
    }

    #[test]
    fn no_configured_secret_admits_any_token() {
        assert!(token_valid(&None, None));
        assert!(token_valid(&None, Some("anything")));
    }

    #[test]
    fn configured_secret_requires_exact_match() {
        let secret = Some("s3cr3t".to_string());
        assert!(token_valid(&secret, Some("s3cr3t")));
        assert!(!token_valid(&secret, Some("wrong")));
        assert!(!token_valid(&secret, None));
    }

    #[test]
    fn agent_id_prefers_header_over_query() {
        assert_eq!(extract_agent_id(Some("A1"), Some("A2")), Some("A1"));
        assert_eq!(extract_agent_id(None, Some("A2")), Some("A2"));
        assert_eq!(extract_agent_id(Some(""), Some("A2")), Some("A2"));
        assert_eq!(extract_agent_id(None, None), None);
    }
}
