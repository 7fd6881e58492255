use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};

use crate::auth::crypto::SessionCipher;
use crate::auth::token::random_component;

/// Name of the state cookie.
pub const COOKIE_NAME: &str = "gafaelfawr";

/// The browser session state, sealed into a single encrypted cookie.
///
/// Holds the session token in printable form, the CSRF secret paired with
/// it, and the transient login-flow fields (`rd` return destination and the
/// OAuth state value).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCookie {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csrf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl SessionCookie {
    /// Decode the cookie from the request jar. A missing, undecryptable, or
    /// unparsable cookie yields empty state; the user just logs in again.
    pub fn from_jar(jar: &CookieJar, cipher: &SessionCipher) -> Self {
        jar.get(COOKIE_NAME)
            .and_then(|cookie| cipher.open(cookie.value()))
            .and_then(|plain| serde_json::from_slice(&plain).ok())
            .unwrap_or_default()
    }

    /// Seal this state into a response cookie.
    pub fn to_cookie(&self, cipher: &SessionCipher) -> Cookie<'static> {
        // Serialization of a plain struct cannot fail.
        let plain = serde_json::to_vec(self).unwrap_or_default();
        build_cookie(cipher.seal(&plain))
    }

    /// A removal cookie that clears the session state.
    pub fn removal() -> Cookie<'static> {
        let mut cookie = build_cookie(String::new());
        cookie.make_removal();
        cookie
    }
}

fn build_cookie(value: String) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, value))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// A fresh 128-bit random value for CSRF secrets and OAuth state.
pub fn random_value() -> String {
    random_component()
}
