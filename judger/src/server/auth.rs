//! Access control for the internal API.

use std::net::IpAddr;

use hyper::{header::AUTHORIZATION, HeaderMap, StatusCode};

use crate::client::model::{API_TOKEN_HEADER, EXTERNAL_NETWORK, INVALID_TOKEN, MISSING_TOKEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    InvalidToken,
    ExternalNetwork,
}

impl AuthFailure {
    pub fn status(self) -> StatusCode {
        match self {
            AuthFailure::MissingToken | AuthFailure::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthFailure::ExternalNetwork => StatusCode::FORBIDDEN,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            AuthFailure::MissingToken => MISSING_TOKEN,
            AuthFailure::InvalidToken => INVALID_TOKEN,
            AuthFailure::ExternalNetwork => EXTERNAL_NETWORK,
        }
    }
}

/// The presented token: `X-API-Token` first, then `Authorization: Bearer`.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let direct = headers
        .get(API_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty());
    direct.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|t| !t.is_empty())
    })
}

fn tokens_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Loopback, RFC 1918 private ranges and IPv6 unique local addresses.
pub fn is_trusted_peer(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_trusted_peer(IpAddr::V4(v4));
            }
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

pub fn check(
    headers: &HeaderMap,
    peer: IpAddr,
    expected_token: &str,
    allow_any_network: bool,
) -> Result<(), AuthFailure> {
    let token = presented_token(headers).ok_or(AuthFailure::MissingToken)?;
    if !tokens_match(token, expected_token) {
        return Err(AuthFailure::InvalidToken);
    }
    if !allow_any_network && !is_trusted_peer(peer) {
        return Err(AuthFailure::ExternalNetwork);
    }
    Ok(())
}
