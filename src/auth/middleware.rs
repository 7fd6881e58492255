use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use constant_time_eq::constant_time_eq;

use crate::auth::cookie::SessionCookie;
use crate::auth::extract::{find_token, TokenSource};
use crate::auth::token::Token;
use crate::error::{ApiError, AuthType};
use crate::models::admin::BOOTSTRAP_ACTOR;
use crate::models::token::{TokenData, TokenType};
use crate::AppState;

/// Authenticated caller of a token-management route.
///
/// Use as an axum extractor in any handler that requires authentication.
/// Resolves the presented token from the bearer header, Basic auth, or the
/// session cookie, and carries the admin flag plus the CSRF state needed
/// for mutating requests from browsers.
pub struct Authenticated {
    pub data: TokenData,
    pub source: TokenSource,
    csrf_cookie: Option<String>,
    csrf_header: Option<String>,
    pub is_admin: bool,
}

impl Authenticated {
    pub fn username(&self) -> &str {
        &self.data.username
    }

    /// Whether the actor may act on the given user's resources.
    pub fn may_act_for(&self, username: &str) -> bool {
        self.is_admin || self.data.username == username
    }

    /// Cookie-authenticated mutations must present the CSRF secret paired
    /// with the session in the `X-CSRF-Token` header.
    pub fn check_csrf(&self) -> Result<(), ApiError> {
        if self.source != TokenSource::Cookie {
            return Ok(());
        }
        match (&self.csrf_cookie, &self.csrf_header) {
            (Some(expected), Some(given))
                if constant_time_eq(expected.as_bytes(), given.as_bytes()) =>
            {
                Ok(())
            }
            _ => Err(ApiError::invalid_csrf("Invalid or missing CSRF token")),
        }
    }
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let realm = &state.config.realm;
        let jar = CookieJar::from_headers(&parts.headers);
        let cookie = SessionCookie::from_jar(&jar, &state.cipher);
        let csrf_header = parts
            .headers
            .get("X-CSRF-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (raw, source) = find_token(&parts.headers, &cookie).ok_or_else(|| {
            ApiError::unauthorized(realm, AuthType::Bearer, "Authentication required")
        })?;

        // The bootstrap token acts as an admin with the reserved actor name.
        if let Some(ref bootstrap) = state.config.bootstrap_token {
            if constant_time_eq(raw.as_bytes(), bootstrap.as_bytes()) {
                if let Ok(token) = Token::parse(&raw) {
                    return Ok(Self {
                        data: bootstrap_data(token),
                        source,
                        csrf_cookie: cookie.csrf,
                        csrf_header,
                        is_admin: true,
                    });
                }
            }
        }

        let token = Token::parse(&raw)
            .map_err(|e| ApiError::invalid_token(realm, AuthType::Bearer, e.to_string()))?;
        let data = state
            .token_service()
            .resolve(&token)
            .await?
            .ok_or_else(|| {
                ApiError::invalid_token(realm, AuthType::Bearer, "Token is not valid or has expired")
            })?;
        let is_admin = state.admin_service().is_admin(&data.username).await?;

        Ok(Self {
            data,
            source,
            csrf_cookie: cookie.csrf,
            csrf_header,
            is_admin,
        })
    }
}

fn bootstrap_data(token: Token) -> TokenData {
    TokenData {
        token,
        username: BOOTSTRAP_ACTOR.to_string(),
        token_type: TokenType::Service,
        scopes: vec!["admin:token".to_string()],
        created: Utc::now(),
        expires: None,
        name: None,
        email: None,
        uid: None,
        gid: None,
        groups: None,
    }
}
