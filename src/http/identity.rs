//! Client identity resolution.
//!
//! The first hop of `X-Forwarded-For` is trusted as-is. Any client that can
//! reach the service directly can choose its own identity by sending that
//! header; deploy behind a proxy that overwrites it.

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Header set by reverse proxies with the client chain, client first.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by some proxies with the single client address.
pub const REAL_IP: &str = "x-real-ip";
/// Identity used when nothing else is available.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Derive a stable identity for the caller.
///
/// Precedence: first `X-Forwarded-For` entry, `X-Real-IP`, peer IP,
/// then [`UNKNOWN_CLIENT`]. Blank values fall through to the next source.
pub fn resolve_client(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = header_str(headers, FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_str(headers, REAL_IP)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return real_ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
