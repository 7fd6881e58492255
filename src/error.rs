use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Part of the request that triggered a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLocation {
    Body,
    Header,
    Path,
    Query,
}

impl ErrorLocation {
    fn as_str(self) -> &'static str {
        match self {
            ErrorLocation::Body => "body",
            ErrorLocation::Header => "header",
            ErrorLocation::Path => "path",
            ErrorLocation::Query => "query",
        }
    }
}

/// Authentication scheme used in a `WWW-Authenticate` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    Bearer,
    Basic,
}

/// A `WWW-Authenticate` challenge attached to a 401 or 403 response.
///
/// Basic challenges carry only the realm; bearer challenges may carry the
/// RFC 6750 `error`, `error_description`, and `scope` attributes.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub auth_type: AuthType,
    pub realm: String,
    pub error: Option<&'static str>,
    pub description: Option<String>,
    pub scope: Option<String>,
}

impl Challenge {
    pub fn header_value(&self) -> String {
        match self.auth_type {
            AuthType::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthType::Bearer => {
                let mut value = format!("Bearer realm=\"{}\"", self.realm);
                if let Some(error) = self.error {
                    value.push_str(&format!(", error=\"{}\"", error));
                }
                if let Some(ref description) = self.description {
                    // Quoted-string contents must not contain double quotes.
                    let cleaned = description.replace('"', "'");
                    value.push_str(&format!(", error_description=\"{}\"", cleaned));
                }
                if let Some(ref scope) = self.scope {
                    value.push_str(&format!(", scope=\"{}\"", scope));
                }
                value
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    loc: Option<Vec<String>>,
    msg: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: ErrorDetail,
}

/// Application error that converts into an HTTP response.
///
/// The body format matches the error taxonomy: a `detail` object with `loc`,
/// `msg`, and `type` keys. Bearer-protected routes attach a [`Challenge`] so
/// the client also receives a `WWW-Authenticate` header.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    pub location: Option<(ErrorLocation, &'static str)>,
    pub challenge: Option<Challenge>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            location: None,
            challenge: None,
        }
    }

    /// An input validation error (422) with an explicit error subkind.
    pub fn validation(
        kind: &'static str,
        location: ErrorLocation,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(StatusCode::UNPROCESSABLE_ENTITY, kind, message);
        error.location = Some((location, field));
        error
    }

    pub fn duplicate_token_name(message: impl Into<String>) -> Self {
        Self::validation(
            "duplicate_token_name",
            ErrorLocation::Body,
            "token_name",
            message,
        )
    }

    pub fn invalid_cursor(message: impl Into<String>) -> Self {
        Self::validation("invalid_cursor", ErrorLocation::Query, "cursor", message)
    }

    pub fn invalid_expires(message: impl Into<String>) -> Self {
        Self::validation("invalid_expires", ErrorLocation::Body, "expires", message)
    }

    pub fn invalid_ip_address(message: impl Into<String>) -> Self {
        Self::validation(
            "invalid_ip_address",
            ErrorLocation::Query,
            "ip_address",
            message,
        )
    }

    pub fn invalid_scopes(message: impl Into<String>) -> Self {
        Self::validation("invalid_scopes", ErrorLocation::Body, "scopes", message)
    }

    pub fn invalid_delegate_to(message: impl Into<String>) -> Self {
        Self::validation(
            "invalid_delegate_to",
            ErrorLocation::Query,
            "delegate_to",
            message,
        )
    }

    pub fn invalid_return_url(message: impl Into<String>, field: &'static str) -> Self {
        let mut error = Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_return_url",
            message,
        );
        error.location = Some((ErrorLocation::Query, field));
        error
    }

    /// Invalid or missing CSRF token (403).
    pub fn invalid_csrf(message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::FORBIDDEN, "invalid_csrf", message);
        error.location = Some((ErrorLocation::Header, "X-CSRF-Token"));
        error
    }

    /// The named token, user, or history record does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// The requested feature is not configured for this deployment.
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_supported", message)
    }

    /// Acting on another user's resource without admin rights, or removing
    /// the final admin.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "permission_denied", message)
    }

    /// RFC 6749 `invalid_client`: client authentication failed.
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid_client", message)
    }

    /// RFC 6749 `invalid_grant`: the authorization code is not valid.
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_grant", message)
    }

    /// RFC 6749 `unsupported_grant_type`.
    pub fn unsupported_grant_type(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unsupported_grant_type", message)
    }

    /// RFC 6749 `unauthorized_client`: the client may not use this flow.
    pub fn unauthorized_client(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unauthorized_client", message)
    }

    /// RFC 6749 `invalid_request` without a bearer challenge, for OAuth
    /// flow errors outside bearer-protected routes.
    pub fn oauth_invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    /// RFC 6750 `invalid_request` (400) with a bearer challenge.
    pub fn invalid_request(realm: &str, auth_type: AuthType, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut error = Self::new(StatusCode::BAD_REQUEST, "invalid_request", message.clone());
        error.challenge = Some(Challenge {
            auth_type,
            realm: realm.to_string(),
            error: Some("invalid_request"),
            description: Some(message),
            scope: None,
        });
        error
    }

    /// RFC 6750 `invalid_token` (401) with a bearer challenge.
    pub fn invalid_token(realm: &str, auth_type: AuthType, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut error = Self::new(StatusCode::UNAUTHORIZED, "invalid_token", message.clone());
        error.challenge = Some(Challenge {
            auth_type,
            realm: realm.to_string(),
            error: Some("invalid_token"),
            description: Some(message),
            scope: None,
        });
        error
    }

    /// RFC 6750 `insufficient_scope` (403) naming the required scopes.
    pub fn insufficient_scope(
        realm: &str,
        auth_type: AuthType,
        required: &[String],
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let mut error = Self::new(StatusCode::FORBIDDEN, "insufficient_scope", message.clone());
        error.challenge = Some(Challenge {
            auth_type,
            realm: realm.to_string(),
            error: Some("insufficient_scope"),
            description: Some(message),
            scope: Some(required.join(" ")),
        });
        error
    }

    /// Missing credentials: a bare challenge with no error attribute (401).
    pub fn unauthorized(realm: &str, auth_type: AuthType, message: impl Into<String>) -> Self {
        let mut error = Self::new(StatusCode::UNAUTHORIZED, "invalid_token", message);
        error.challenge = Some(Challenge {
            auth_type,
            realm: realm.to_string(),
            error: None,
            description: None,
            scope: None,
        });
        error
    }

    /// An unexpected infrastructure failure. Details go to the log; the
    /// client sees a generic message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message,
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            detail: ErrorDetail {
                loc: self
                    .location
                    .map(|(area, field)| vec![area.as_str().to_string(), field.to_string()]),
                msg: self.message,
                kind: self.kind.to_string(),
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(challenge) = self.challenge {
            if let Ok(value) = challenge.header_value().parse() {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

impl From<diesel::result::Error> for ApiError {
    fn from(err: diesel::result::Error) -> Self {
        tracing::error!(?err, "database error");
        Self::internal("An internal error occurred")
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for ApiError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        tracing::error!(?err, "pool error");
        Self::internal("An internal error occurred")
    }
}

impl From<redis::RedisError> for ApiError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(?err, "redis error");
        Self::internal("An internal error occurred")
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        tracing::error!(?err, "provider request failed");
        Self::internal("An internal error occurred")
    }
}

impl From<ldap3::LdapError> for ApiError {
    fn from(err: ldap3::LdapError) -> Self {
        tracing::error!(?err, "LDAP error");
        Self::internal("An internal error occurred")
    }
}
