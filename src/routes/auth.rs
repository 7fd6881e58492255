use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::CookieJar;

use crate::auth::cookie::SessionCookie;
use crate::auth::extract::find_token;
use crate::auth::token::Token;
use crate::error::{ApiError, AuthType, ErrorLocation};
use crate::models::token::{normalize_scopes, TokenData};
use crate::routes::{auth_uri, client_ip};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/auth", get(authorize))
}

/// How required scopes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfy {
    All,
    Any,
}

impl Satisfy {
    fn as_str(self) -> &'static str {
        match self {
            Satisfy::All => "all",
            Satisfy::Any => "any",
        }
    }
}

/// Parsed `/auth` query parameters.
#[derive(Debug)]
struct AuthRequest {
    scopes: Vec<String>,
    satisfy: Satisfy,
    auth_type: AuthType,
    notebook: bool,
    delegate_to: Option<String>,
    delegate_scopes: Vec<String>,
}

/// Parse the query by hand: `scope` may be repeated, comma-separated, or
/// both, and the two forms are unioned.
fn parse_query(query: &str) -> Result<AuthRequest, ApiError> {
    let mut scopes = Vec::new();
    let mut satisfy = Satisfy::All;
    let mut auth_type = AuthType::Bearer;
    let mut notebook = false;
    let mut delegate_to = None;
    let mut delegate_scopes = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "scope" => scopes.extend(split_scopes(&value)),
            "satisfy" => {
                satisfy = match value.as_ref() {
                    "all" => Satisfy::All,
                    "any" => Satisfy::Any,
                    _ => {
                        return Err(ApiError::validation(
                            "validation_failed",
                            ErrorLocation::Query,
                            "satisfy",
                            "satisfy must be all or any",
                        ))
                    }
                }
            }
            "auth_type" => {
                auth_type = match value.as_ref() {
                    "bearer" => AuthType::Bearer,
                    "basic" => AuthType::Basic,
                    _ => {
                        return Err(ApiError::validation(
                            "validation_failed",
                            ErrorLocation::Query,
                            "auth_type",
                            "auth_type must be bearer or basic",
                        ))
                    }
                }
            }
            "notebook" => {
                notebook = match value.as_ref() {
                    "true" | "1" => true,
                    "false" | "0" | "" => false,
                    _ => {
                        return Err(ApiError::validation(
                            "validation_failed",
                            ErrorLocation::Query,
                            "notebook",
                            "notebook must be a boolean",
                        ))
                    }
                }
            }
            "delegate_to" => {
                if !value.is_empty() {
                    delegate_to = Some(value.to_string());
                }
            }
            "delegate_scope" => delegate_scopes.extend(split_scopes(&value)),
            _ => {}
        }
    }

    if scopes.is_empty() {
        return Err(ApiError::validation(
            "validation_failed",
            ErrorLocation::Query,
            "scope",
            "At least one scope is required",
        ));
    }
    if notebook && delegate_to.is_some() {
        return Err(ApiError::invalid_delegate_to(
            "delegate_to cannot be used with notebook",
        ));
    }

    Ok(AuthRequest {
        scopes: normalize_scopes(scopes),
        satisfy,
        auth_type,
        notebook,
        delegate_to,
        delegate_scopes: normalize_scopes(delegate_scopes),
    })
}

fn split_scopes(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Whether the token's scopes satisfy the requirement.
fn scopes_allow(required: &[String], held: &[String], satisfy: Satisfy) -> bool {
    match satisfy {
        Satisfy::All => required.iter().all(|scope| held.contains(scope)),
        Satisfy::Any => required.iter().any(|scope| held.contains(scope)),
    }
}

/// The subrequest authorization gate.
///
/// The ingress issues a subrequest here for every protected request; the
/// response status decides admission and the `X-Auth-Request-*` headers are
/// copied onto the request delivered to the backend.
async fn authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let request = parse_query(query.as_deref().unwrap_or(""))?;
    let realm = &state.config.realm;
    let auth_uri = auth_uri(&headers);
    let remote_ip = client_ip(&headers, &state.config);
    let required_scope = request.scopes.join(" ");
    let satisfy = request.satisfy.as_str();

    // Extract.
    let cookie = SessionCookie::from_jar(&jar, &state.cipher);
    let Some((raw, source)) = find_token(&headers, &cookie) else {
        tracing::warn!(
            %auth_uri, %remote_ip, %required_scope, satisfy,
            "No token found, returning unauthorized"
        );
        return Err(ApiError::unauthorized(
            realm,
            request.auth_type,
            "Authentication required",
        ));
    };

    // Validate the printable form.
    let token = match Token::parse(&raw) {
        Ok(token) => token,
        Err(error) => {
            tracing::warn!(
                %auth_uri, %remote_ip, %required_scope, satisfy,
                token_source = source.as_str(),
                %error,
                "Invalid token"
            );
            return Err(ApiError::invalid_token(
                realm,
                request.auth_type,
                error.to_string(),
            ));
        }
    };

    // Resolve.
    let Some(data) = state.token_service().resolve(&token).await? else {
        tracing::warn!(
            %auth_uri, %remote_ip, %required_scope, satisfy,
            token = %token.key,
            token_source = source.as_str(),
            "Invalid token"
        );
        return Err(ApiError::invalid_token(
            realm,
            request.auth_type,
            "Token is not valid or has expired",
        ));
    };

    // Authorize.
    if !scopes_allow(&request.scopes, &data.scopes, request.satisfy) {
        tracing::warn!(
            %auth_uri, %remote_ip, %required_scope, satisfy,
            scope = %data.scopes.join(" "),
            token = %token.key,
            token_source = source.as_str(),
            user = %data.username,
            "Permission denied"
        );
        return Err(ApiError::insufficient_scope(
            realm,
            request.auth_type,
            &request.scopes,
            "Token missing required scope",
        ));
    }

    // Delegate.
    let delegated = delegated_token(&state, &request, &data, &remote_ip).await?;

    tracing::info!(
        %auth_uri, %remote_ip, %required_scope, satisfy,
        scope = %data.scopes.join(" "),
        token = %token.key,
        token_source = source.as_str(),
        user = %data.username,
        "Token authorized"
    );

    // Respond.
    let mut response = StatusCode::OK.into_response();
    let response_headers = response.headers_mut();
    set_header(response_headers, "X-Auth-Request-User", Some(&data.username));
    set_header(response_headers, "X-Auth-Request-Email", data.email.as_deref());
    set_header(
        response_headers,
        "X-Auth-Request-Uid",
        data.uid.map(|uid| uid.to_string()).as_deref(),
    );
    let groups = data.groups.as_ref().map(|groups| {
        groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    });
    set_header(
        response_headers,
        "X-Auth-Request-Groups",
        groups.as_deref().filter(|g| !g.is_empty()),
    );
    let (reply_token, reply_scopes) = match delegated {
        Some((token, scopes)) => (token.printable(), scopes),
        None => (data.token.printable(), data.scopes.clone()),
    };
    set_header(response_headers, "X-Auth-Request-Token", Some(&reply_token));
    set_header(
        response_headers,
        "X-Auth-Request-Token-Scopes",
        Some(&reply_scopes.join(" ")),
    );
    Ok(response)
}

async fn delegated_token(
    state: &AppState,
    request: &AuthRequest,
    data: &TokenData,
    remote_ip: &str,
) -> Result<Option<(Token, Vec<String>)>, ApiError> {
    let service = state.token_service();
    if request.notebook {
        let token = service.get_notebook_token(data, Some(remote_ip)).await?;
        return Ok(Some((token, data.scopes.clone())));
    }
    if let Some(ref delegate_to) = request.delegate_to {
        // A scope subset violation is the caller's fault (403); anything
        // else from the service propagates as-is.
        let scopes = request.delegate_scopes.clone();
        for scope in &scopes {
            if !data.scopes.contains(scope) {
                return Err(ApiError::insufficient_scope(
                    &state.config.realm,
                    request.auth_type,
                    &scopes,
                    "Token missing requested delegate scope",
                ));
            }
        }
        let token = service
            .get_internal_token(data, delegate_to, scopes.clone(), Some(remote_ip))
            .await?;
        return Ok(Some((token, scopes)));
    }
    Ok(None)
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: Option<&str>) {
    if let Some(value) = value {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn query_accepts_repeated_and_comma_separated_scopes() {
        let request = parse_query("scope=read:all&scope=exec:admin,exec:test").unwrap();
        assert_eq!(
            request.scopes,
            scopes(&["exec:admin", "exec:test", "read:all"])
        );
        assert_eq!(request.satisfy, Satisfy::All);
        assert_eq!(request.auth_type, AuthType::Bearer);
    }

    #[test]
    fn query_requires_a_scope() {
        let err = parse_query("satisfy=any").unwrap_err();
        assert_eq!(err.kind, "validation_failed");
    }

    #[test]
    fn query_rejects_notebook_with_delegate_to() {
        let err = parse_query("scope=read:all&notebook=true&delegate_to=tap").unwrap_err();
        assert_eq!(err.kind, "invalid_delegate_to");
    }

    #[test]
    fn query_rejects_bad_satisfy() {
        assert!(parse_query("scope=read:all&satisfy=most").is_err());
        assert!(parse_query("scope=read:all&auth_type=digest").is_err());
        assert!(parse_query("scope=read:all&notebook=maybe").is_err());
    }

    #[test]
    fn satisfy_semantics() {
        let held = scopes(&["exec:admin", "read:all"]);
        assert!(scopes_allow(&scopes(&["exec:admin"]), &held, Satisfy::All));
        assert!(!scopes_allow(
            &scopes(&["exec:admin", "exec:test"]),
            &held,
            Satisfy::All
        ));
        assert!(scopes_allow(
            &scopes(&["exec:admin", "exec:test"]),
            &held,
            Satisfy::Any
        ));
        assert!(!scopes_allow(&scopes(&["exec:test"]), &held, Satisfy::Any));
    }
}
