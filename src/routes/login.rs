use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use constant_time_eq::constant_time_eq;
use serde::Deserialize;

use crate::auth::cookie::{random_value, SessionCookie};
use crate::config::Config;
use crate::error::ApiError;
use crate::models::token::{normalize_scopes, Group};
use crate::routes::client_ip;
use crate::AppState;

/// Scope every session token carries so users can manage their own tokens.
const SESSION_BASE_SCOPE: &str = "user:token";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login))
        .route("/login/callback", get(callback))
        .route("/logout", get(logout))
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    rd: Option<String>,
}

/// Begin the upstream login flow.
///
/// Stores the validated return URL and a fresh state value in the session
/// cookie, then redirects to the provider.
async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rd = query
        .rd
        .or_else(|| {
            headers
                .get("X-Auth-Request-Redirect")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ApiError::invalid_return_url("No return URL given", "rd"))?;
    validate_return_url(&rd, &state.config)?;

    let oauth_state = random_value();
    let session = SessionCookie {
        token: None,
        csrf: None,
        rd: Some(rd),
        state: Some(oauth_state.clone()),
    };
    let jar = jar.add(session.to_cookie(&state.cipher));
    let url = state.provider.login_url(&oauth_state);
    Ok((jar, Redirect::to(&url)).into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Complete the upstream login flow: validate state, exchange the code for
/// an identity, create the session token, and set the session cookie.
async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<CallbackQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = SessionCookie::from_jar(&jar, &state.cipher);

    if let Some(error) = query.error {
        let description = query.error_description.as_deref().unwrap_or("");
        tracing::warn!(error, description, "provider reported login error");
        return Err(ApiError::permission_denied("Authentication failed"));
    }

    let presented_state = query
        .state
        .ok_or_else(|| ApiError::oauth_invalid_request("No authentication state"))?;
    let expected_state = session
        .state
        .as_deref()
        .ok_or_else(|| ApiError::permission_denied("No authentication session"))?;
    if !constant_time_eq(expected_state.as_bytes(), presented_state.as_bytes()) {
        return Err(ApiError::permission_denied("Authentication state mismatch"));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::oauth_invalid_request("No authorization code"))?;

    let mut user = state.provider.exchange(&code, &presented_state).await?;
    if let Some(ref ldap) = state.ldap {
        let ldap_groups = ldap.groups(&user.username).await?;
        user.groups = merge_groups(user.groups, ldap_groups);
    }

    let mut scopes = state.config.scopes_for_groups(&user.groups);
    scopes.push(SESSION_BASE_SCOPE.to_string());
    let scopes = normalize_scopes(scopes);

    let remote_ip = client_ip(&headers, &state.config);
    let data = state
        .token_service()
        .create_session_token(&user, scopes.clone(), Some(&remote_ip))
        .await?;

    tracing::info!(
        user = %user.username,
        scope = scopes.join(" "),
        %remote_ip,
        "successfully authenticated user"
    );

    let rd = session
        .rd
        .clone()
        .unwrap_or_else(|| state.config.after_logout_url.clone());
    let session = SessionCookie {
        token: Some(data.token.printable()),
        csrf: Some(random_value()),
        rd: None,
        state: None,
    };
    let jar = jar.add(session.to_cookie(&state.cipher));
    Ok((jar, Redirect::to(&rd)).into_response())
}

/// Clear the session and redirect.
///
/// The session token is not revoked: user tokens created from it must keep
/// working, and the cookie is the only copy of the session secret.
async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<LoginQuery>,
) -> Result<Response, ApiError> {
    let session = SessionCookie::from_jar(&jar, &state.cipher);
    if session.token.is_some() {
        tracing::info!("logged out");
    } else {
        tracing::debug!("logout with no active session");
    }

    let rd = match query.rd {
        Some(rd) => {
            validate_return_url(&rd, &state.config)?;
            rd
        }
        None => state.config.after_logout_url.clone(),
    };
    let jar = jar.add(SessionCookie::removal());
    Ok((jar, Redirect::to(&rd)).into_response())
}

/// Return URLs must be https and point at this deployment's host (or an
/// allowlisted one).
fn validate_return_url(rd: &str, config: &Config) -> Result<(), ApiError> {
    let url = url::Url::parse(rd)
        .map_err(|_| ApiError::invalid_return_url(format!("Invalid return URL {}", rd), "rd"))?;
    if url.scheme() != "https" {
        return Err(ApiError::invalid_return_url(
            "Return URL must use https",
            "rd",
        ));
    }
    let Some(host) = url.host_str() else {
        return Err(ApiError::invalid_return_url("Return URL has no host", "rd"));
    };
    let allowed = host == config.realm
        || config.allowed_return_hosts.iter().any(|h| h == host);
    if !allowed {
        return Err(ApiError::invalid_return_url(
            format!("Return URL host {} is not allowed", host),
            "rd",
        ));
    }
    Ok(())
}

fn merge_groups(mut groups: Vec<Group>, extra: Vec<Group>) -> Vec<Group> {
    for group in extra {
        if !groups.iter().any(|g| g.name == group.name) {
            groups.push(group);
        }
    }
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            realm: "example.com".to_string(),
            loglevel: "info".to_string(),
            session_secret: "secret".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            database_url: "postgresql://localhost/gafaelfawr".to_string(),
            bootstrap_token: None,
            token_lifetime: chrono::Duration::hours(23),
            expiry_sweep_minutes: 60,
            proxies: vec![],
            after_logout_url: "https://example.com/".to_string(),
            allowed_return_hosts: vec!["portal.example.com".to_string()],
            known_scopes: std::collections::HashMap::new(),
            group_mapping: std::collections::HashMap::new(),
            initial_admins: vec![],
            issuer: crate::config::IssuerConfig {
                iss: "https://example.com".to_string(),
                aud: "https://example.com".to_string(),
                key_pem: String::new(),
                kid: None,
                exp_minutes: 5,
                influxdb_secret: None,
                influxdb_username: None,
            },
            github: None,
            oidc: None,
            oidc_server: None,
            ldap: None,
        }
    }

    #[test]
    fn return_url_must_be_https_on_a_known_host() {
        let config = config();
        assert!(validate_return_url("https://example.com/app", &config).is_ok());
        assert!(validate_return_url("https://portal.example.com/x", &config).is_ok());
        assert!(validate_return_url("http://example.com/app", &config).is_err());
        assert!(validate_return_url("https://evil.example.org/", &config).is_err());
        assert!(validate_return_url("not a url", &config).is_err());
    }

    #[test]
    fn groups_merge_without_duplicates() {
        let provider = vec![Group {
            name: "admins".to_string(),
            id: Some(1),
        }];
        let ldap = vec![
            Group {
                name: "admins".to_string(),
                id: Some(1),
            },
            Group {
                name: "science".to_string(),
                id: Some(2),
            },
        ];
        let merged = merge_groups(provider, ldap);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "admins");
        assert_eq!(merged[1].name, "science");
    }
}
