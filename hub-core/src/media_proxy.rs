//! Media Proxy Handler: streams a third-party media URL back to the client,
//! optionally decrypting it in flight, while refusing to let the hub be
//! used as an SSRF pivot into its own network.
//!
//! Grounded on `hub_server/handlers/media_handler.go`'s URL-policy checks
//! and Range/Content-Range plumbing, with the streaming body composed with
//! [`crate::decrypt::DecryptReader`] the way that file wraps its own
//! `NewDecryptReader`.

use std::net::IpAddr;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncRead;
use url::Url;

use crate::decrypt::DecryptReader;
use crate::error::{HubError, HubResult};

const DECRYPT_LIMIT: u64 = 131_072;
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .connect_timeout(DIAL_TIMEOUT)
        .pool_idle_timeout(IDLE_TIMEOUT)
        // No overall request timeout: responses are streamed, and a large
        // video download can legitimately run far longer than any fixed
        // deadline.
        .build()
}

/// Validates the requested URL against the SSRF policy: `http`/`https`
/// only, and the host must not resolve to a loopback, private, or
/// link-local address, nor literally equal `localhost`.
pub async fn check_url_policy(url: &Url) -> HubResult<()> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(HubError::Forbidden(format!("scheme {other} not allowed"))),
    }

    let host = url.host_str().ok_or_else(|| HubError::Forbidden("missing host".into()))?;
    if host.eq_ignore_ascii_case("localhost") {
        return Err(HubError::Forbidden("localhost is not allowed".into()));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed_ip(&ip) {
            return Err(HubError::Forbidden("target address is not allowed".into()));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let lookup = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| HubError::UpstreamFailure(format!("dns lookup failed: {e}")))?;

    let mut resolved_any = false;
    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(&addr.ip()) {
            return Err(HubError::Forbidden("target address is not allowed".into()));
        }
    }
    if !resolved_any {
        return Err(HubError::UpstreamFailure("host did not resolve to any address".into()));
    }

    Ok(())
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.segments()[0] & 0xfe00 == 0xfc00 // fc00::/7 unique local
                || v6.segments()[0] == 0xfe80 // link-local
        }
    }
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub content_range: Option<String>,
}

/// Issues the upstream request, forwarding the client's `Range` header if
/// present. Returns the response split into its head and (for GET) a
/// streaming body reader, optionally wrapped for decryption.
pub async fn fetch(
    client: &Client,
    url: &Url,
    range_header: Option<&str>,
    method_is_head: bool,
    decrypt_key: Option<u64>,
) -> HubResult<(UpstreamResponse, Option<Box<dyn AsyncRead + Send + Unpin>>)> {
    let method = if method_is_head { reqwest::Method::HEAD } else { reqwest::Method::GET };
    let mut req = client.request(method, url.clone());
    if let Some(range) = range_header {
        req = req.header(reqwest::header::RANGE, range);
    }

    let resp = req.send().await.map_err(|e| HubError::UpstreamFailure(e.to_string()))?;
    let status = resp.status();
    let headers = resp.headers().clone();
    let content_range = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let head = UpstreamResponse { status, headers, content_range: content_range.clone() };

    if method_is_head {
        return Ok((head, None));
    }

    let stream = resp
        .bytes_stream()
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let reader = tokio_util::io::StreamReader::new(stream);

    let body: Box<dyn AsyncRead + Send + Unpin> = match decrypt_key {
        Some(seed) => {
            let start_offset = head
                .content_range
                .as_deref()
                .and_then(parse_content_range_start)
                .unwrap_or(0);
            Box::new(DecryptReader::new(reader, seed, start_offset, DECRYPT_LIMIT))
        }
        None => Box::new(reader),
    };

    Ok((head, Some(body)))
}

/// Parses the `start` component out of a `Content-Range: bytes start-end/total` header.
fn parse_content_range_start(header: &str) -> Option<u64> {
    let rest = header.strip_prefix("bytes ")?;
    let dash = rest.find('-')?;
    rest[..dash].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_schemes() {
        // check_url_policy is async only because of the DNS lookup branch;
        // IP-literal and scheme checks are exercised synchronously here via
        // a tiny local runtime.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let url = Url::parse("ftp://example.com/file").unwrap();
        let result = rt.block_on(check_url_policy(&url));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_loopback_ip_literal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let url = Url::parse("http://127.0.0.1:9000/x").unwrap();
        assert!(rt.block_on(check_url_policy(&url)).is_err());
    }

    #[test]
    fn rejects_private_ip_literal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let url = Url::parse("http://10.0.0.5/x").unwrap();
        assert!(rt.block_on(check_url_policy(&url)).is_err());
    }

    #[test]
    fn rejects_localhost_hostname() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let url = Url::parse("http://localhost/x").unwrap();
        assert!(rt.block_on(check_url_policy(&url)).is_err());
    }

    #[test]
    fn accepts_public_ip_literal() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let url = Url::parse("http://93.184.216.34/x").unwrap();
        assert!(rt.block_on(check_url_policy(&url)).is_ok());
    }

    #[test]
    fn content_range_start_is_parsed() {
        assert_eq!(parse_content_range_start("bytes 100-199/1000"), Some(100));
        assert_eq!(parse_content_range_start("bytes */1000"), None);
        assert_eq!(parse_content_range_start("not-a-range"), None);
    }
}
