//! WebSocket endpoint validation.
//!
//! The Murf endpoint is configurable (for regional endpoints and local mock
//! servers), so it is checked before any connection attempt. A valid endpoint:
//! - uses `wss://`, or `ws://` when the host is loopback
//! - has a host and no embedded credentials
//! - carries no query string or fragment (session parameters are appended)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracing::warn;
use url::{Host, Url};

/// Errors that can occur during URL validation
#[derive(Debug, Error)]
pub enum UrlValidationError {
    #[error("Invalid URL format: {0}")]
    InvalidFormat(#[from] url::ParseError),

    #[error("URL scheme must be wss (or ws for loopback hosts), got: {0}")]
    UnsupportedScheme(String),

    #[error("Plain ws:// is only allowed for loopback hosts, got: {0}")]
    InsecureRemoteHost(String),

    #[error("URL must have a host")]
    MissingHost,

    #[error("URL must not embed credentials")]
    CredentialsNotAllowed,

    #[error("URL must not carry a query string or fragment")]
    QueryNotAllowed,
}

/// Checks if an IPv4 address is loopback (127.0.0.0/8)
pub fn is_loopback_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()
}

/// Checks if an IPv6 address is loopback (::1), including IPv4-mapped loopback
pub fn is_loopback_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    ip.to_ipv4_mapped()
        .is_some_and(|ipv4| is_loopback_ipv4(&ipv4))
}

/// Checks if a parsed host refers to the local machine
pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(ip) => is_loopback_ipv4(ip),
        Host::Ipv6(ip) => is_loopback_ipv6(ip),
    }
}

/// Checks if an IP address is loopback
pub fn is_loopback_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_loopback_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_loopback_ipv6(ipv6),
    }
}

/// Validates a WebSocket endpoint URL.
///
/// # Example
/// ```rust,ignore
/// use waav_tts_murf::utils::url_validation::validate_websocket_url;
///
/// assert!(validate_websocket_url("wss://global.api.murf.ai/v1/speech/stream-input").is_ok());
/// assert!(validate_websocket_url("ws://127.0.0.1:9000/stream").is_ok());
/// assert!(validate_websocket_url("ws://murf.example.com/stream").is_err());
/// ```
pub fn validate_websocket_url(url: &str) -> Result<Url, UrlValidationError> {
    let parsed = Url::parse(url)?;

    let host = parsed.host().ok_or(UrlValidationError::MissingHost)?;

    match parsed.scheme() {
        "wss" => {}
        "ws" => {
            if !is_loopback_host(&host) {
                warn!(host = %host, "Rejecting plain ws:// endpoint for non-loopback host");
                return Err(UrlValidationError::InsecureRemoteHost(host.to_string()));
            }
        }
        other => return Err(UrlValidationError::UnsupportedScheme(other.to_string())),
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(UrlValidationError::CredentialsNotAllowed);
    }

    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(UrlValidationError::QueryNotAllowed);
    }

    Ok(parsed)
}
