use http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Maximum identifier length in bytes — long enough for a full IPv6 literal
/// with a zone index, short enough to bound key size in the store.
const MAX_IDENTIFIER_LEN: usize = 45;

/// Client-identification headers in precedence order. The first present
/// header wins; comma-separated lists contribute their first element.
const IDENTIFIER_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "cf-connecting-ip",
];

/// Derive the client identifier for a request.
///
/// Header-derived candidates are trimmed, stripped of control characters
/// (so header-injection attempts cannot smuggle newlines into keys or logs),
/// truncated, and validated as IP literals. A candidate that fails IP
/// validation is still used as-is when non-empty; an empty candidate falls
/// back to `"unknown"`. When no header is present the TCP peer address is
/// used — with the peer port appended, except for loopback peers where the
/// bare literal keeps local clients stable across connections.
pub fn extract_identifier(headers: &HeaderMap, peer_addr: SocketAddr) -> String {
    for name in IDENTIFIER_HEADERS {
        let Some(raw) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        let candidate = raw.split(',').next().unwrap_or("");
        return sanitize_candidate(candidate);
    }

    let ip = peer_addr.ip();
    if is_loopback(&ip) {
        ip.to_string()
    } else {
        format!("{}:{}", ip, peer_addr.port())
    }
}

/// Trim, strip control characters, truncate, and validate a raw candidate.
fn sanitize_candidate(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control() && !('\u{7f}'..='\u{9f}').contains(c))
        .collect();

    let truncated = truncate_to_boundary(&cleaned, MAX_IDENTIFIER_LEN);

    if truncated.parse::<IpAddr>().is_ok() {
        return truncated.to_string();
    }
    if truncated.is_empty() {
        return "unknown".to_string();
    }
    truncated.to_string()
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_to_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn is_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Map an identifier into the character class allowed in counter keys.
/// Everything outside `[A-Za-z0-9._-]` becomes `_`, so IPv6 colons and any
/// residual header junk cannot break key parsing or pattern matching.
pub fn sanitize_key_component(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
