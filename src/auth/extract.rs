use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};

use crate::auth::cookie::SessionCookie;

/// Username or password value that marks the other Basic-auth field as the
/// token.
const OAUTH_BASIC_MARKER: &str = "x-oauth-basic";

/// Where the presented token came from, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Bearer,
    BasicUsername,
    BasicPassword,
    Cookie,
}

impl TokenSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenSource::Bearer => "bearer",
            TokenSource::BasicUsername => "basic-username",
            TokenSource::BasicPassword => "basic-password",
            TokenSource::Cookie => "cookie",
        }
    }
}

/// Locate a candidate token in the documented sources, in order: bearer
/// header, Basic auth with the `x-oauth-basic` convention, session cookie.
///
/// Returns the raw candidate; grammar validation and resolution happen in
/// the caller. Basic credentials where neither or both fields are the
/// `x-oauth-basic` literal yield no token and therefore a 401.
pub fn find_token(headers: &HeaderMap, cookie: &SessionCookie) -> Option<(String, TokenSource)> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(found) = token_from_authorization(header) {
            return Some(found);
        }
    }
    cookie
        .token
        .clone()
        .map(|token| (token, TokenSource::Cookie))
}

fn token_from_authorization(header: &str) -> Option<(String, TokenSource)> {
    let (scheme, rest) = header.split_once(' ')?;
    let rest = rest.trim();
    if scheme.eq_ignore_ascii_case("bearer") {
        return Some((rest.to_string(), TokenSource::Bearer));
    }
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(rest).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    let user_is_marker = user == OAUTH_BASIC_MARKER;
    let password_is_marker = password == OAUTH_BASIC_MARKER;
    match (user_is_marker, password_is_marker) {
        (false, true) => Some((user.to_string(), TokenSource::BasicUsername)),
        (true, false) => Some((password.to_string(), TokenSource::BasicPassword)),
        // Both or neither: no way to tell which field is the token.
        _ => None,
    }
}
