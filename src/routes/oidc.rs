use axum::extract::{Query, RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use axum_extra::extract::cookie::CookieJar;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;

use crate::auth::cookie::SessionCookie;
use crate::auth::token::Token;
use crate::error::ApiError;
use crate::models::oidc::OidcTokenReply;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/openid/login", get(openid_login))
        .route("/auth/openid/token", post(openid_token))
        .route(
            "/.well-known/openid-configuration",
            get(openid_configuration),
        )
        .route("/.well-known/jwks.json", get(jwks))
}

// ---------------------------------------------------------------------------
// GET /auth/openid/login
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: Option<String>,
    redirect_uri: Option<String>,
    response_type: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    nonce: Option<String>,
}

/// The OIDC authorization endpoint.
///
/// Client and redirect URI problems are reported directly (never redirect
/// to an unvalidated URI); other protocol errors redirect back to the
/// client with `error` set, per RFC 6749. Unauthenticated users funnel
/// through the standard login flow and resume here.
async fn openid_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<AuthorizeParams>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ApiError> {
    let oidc = state.oidc_service();
    if !oidc.is_enabled() {
        return Err(ApiError::not_supported("OpenID Connect is not configured"));
    }

    let client_id = params
        .client_id
        .ok_or_else(|| ApiError::oauth_invalid_request("client_id is required"))?;
    let redirect_uri = params
        .redirect_uri
        .ok_or_else(|| ApiError::oauth_invalid_request("redirect_uri is required"))?;
    oidc.validate_authorization(&client_id, &redirect_uri)?;

    // Authentication comes from the session cookie; otherwise bounce
    // through /login with this URL as the return destination.
    let cookie = SessionCookie::from_jar(&jar, &state.cipher);
    let session_token = cookie
        .token
        .as_deref()
        .and_then(|raw| Token::parse(raw).ok());
    let data = match session_token {
        Some(ref token) => state.token_service().resolve(token).await?,
        None => None,
    };
    let Some(data) = data else {
        let rd = format!(
            "https://{}/auth/openid/login?{}",
            state.config.realm,
            raw_query.unwrap_or_default()
        );
        let login_url = format!(
            "/login?rd={}",
            url::form_urlencoded::byte_serialize(rd.as_bytes()).collect::<String>()
        );
        return Ok(Redirect::to(&login_url).into_response());
    };

    if params.response_type.as_deref() != Some("code") {
        return Ok(error_redirect(
            &redirect_uri,
            "invalid_request",
            "Only response_type=code is supported",
            params.state.as_deref(),
        ));
    }
    let scope_ok = params
        .scope
        .as_deref()
        .map(|s| s.split_whitespace().any(|s| s == "openid"))
        .unwrap_or(false);
    if !scope_ok {
        return Ok(error_redirect(
            &redirect_uri,
            "invalid_request",
            "Only scope=openid is supported",
            params.state.as_deref(),
        ));
    }

    let code = oidc
        .issue_code(&client_id, &redirect_uri, &data.token, params.nonce)
        .await?;

    let mut location = format!(
        "{}{}code={}",
        redirect_uri,
        query_separator(&redirect_uri),
        code.printable_code()
    );
    if let Some(ref oauth_state) = params.state {
        location.push_str(&format!(
            "&state={}",
            url::form_urlencoded::byte_serialize(oauth_state.as_bytes()).collect::<String>()
        ));
    }
    tracing::info!(client_id, user = %data.username, "returned authorization code");
    Ok(Redirect::to(&location).into_response())
}

fn query_separator(uri: &str) -> char {
    if uri.contains('?') {
        '&'
    } else {
        '?'
    }
}

fn error_redirect(
    redirect_uri: &str,
    error: &str,
    description: &str,
    state: Option<&str>,
) -> Response {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    serializer.append_pair("error", error);
    serializer.append_pair("error_description", description);
    if let Some(state) = state {
        serializer.append_pair("state", state);
    }
    let location = format!(
        "{}{}{}",
        redirect_uri,
        query_separator(redirect_uri),
        serializer.finish()
    );
    Redirect::to(&location).into_response()
}

// ---------------------------------------------------------------------------
// POST /auth/openid/token
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TokenGrantForm {
    grant_type: Option<String>,
    code: Option<String>,
    redirect_uri: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// The OIDC token endpoint.
///
/// Errors use the RFC 6749 body format (`error`, `error_description`)
/// because OIDC clients parse that, not the native error envelope.
async fn openid_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(form): Form<TokenGrantForm>,
) -> Response {
    match handle_token_grant(&state, &headers, form).await {
        Ok(reply) => Json(reply).into_response(),
        Err(error) if is_oauth_error(error.kind) => oauth_error_response(&state, error),
        Err(error) => error.into_response(),
    }
}

async fn handle_token_grant(
    state: &AppState,
    headers: &HeaderMap,
    form: TokenGrantForm,
) -> Result<OidcTokenReply, ApiError> {
    let oidc = state.oidc_service();
    if !oidc.is_enabled() {
        return Err(ApiError::not_supported("OpenID Connect is not configured"));
    }

    match form.grant_type.as_deref() {
        Some("authorization_code") => {}
        Some(other) => {
            return Err(ApiError::unsupported_grant_type(format!(
                "Grant type {} not supported",
                other
            )))
        }
        None => return Err(ApiError::oauth_invalid_request("grant_type is required")),
    }

    // Client credentials come from HTTP Basic by preference, then the form.
    let (client_id, client_secret) = match basic_credentials(headers) {
        Some(credentials) => credentials,
        None => (
            form.client_id
                .ok_or_else(|| ApiError::invalid_client("No client credentials"))?,
            form.client_secret
                .ok_or_else(|| ApiError::invalid_client("No client credentials"))?,
        ),
    };
    let code = form
        .code
        .ok_or_else(|| ApiError::oauth_invalid_request("code is required"))?;
    let redirect_uri = form
        .redirect_uri
        .ok_or_else(|| ApiError::oauth_invalid_request("redirect_uri is required"))?;

    let authorization = oidc
        .redeem_code(&client_id, &client_secret, &redirect_uri, &code)
        .await?;

    // The underlying token must still be live.
    let data = state
        .token_service()
        .resolve(&authorization.token)
        .await?
        .ok_or_else(|| ApiError::invalid_grant("Invalid authorization code"))?;

    let (id_token, expires_in) = oidc.sign_id_token(
        &data,
        &authorization.client_id,
        authorization.nonce.clone(),
        &authorization.scope,
    )?;
    tracing::info!(client_id = %authorization.client_id, user = %data.username, "redeemed authorization code");

    Ok(OidcTokenReply {
        access_token: authorization.token.printable(),
        id_token,
        token_type: "Bearer",
        expires_in,
        scope: authorization.scope,
    })
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let (scheme, value) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(value.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

fn is_oauth_error(kind: &str) -> bool {
    matches!(
        kind,
        "invalid_request"
            | "invalid_client"
            | "invalid_grant"
            | "unsupported_grant_type"
            | "unauthorized_client"
    )
}

fn oauth_error_response(state: &AppState, error: ApiError) -> Response {
    let body = serde_json::json!({
        "error": error.kind,
        "error_description": error.message,
    });
    let mut response = (error.status, Json(body)).into_response();
    if error.kind == "invalid_client" {
        let challenge = format!("Basic realm=\"{}\"", state.config.realm);
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

async fn openid_configuration(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let oidc = state.oidc_service();
    if !oidc.is_enabled() {
        return Err(ApiError::not_supported("OpenID Connect is not configured"));
    }
    Ok(Json(oidc.openid_configuration()))
}

async fn jwks(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let oidc = state.oidc_service();
    if !oidc.is_enabled() {
        return Err(ApiError::not_supported("OpenID Connect is not configured"));
    }
    Ok(Json(oidc.jwks()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn basic_credentials_parse() {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode("app:app-secret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        assert_eq!(
            basic_credentials(&headers),
            Some(("app".to_string(), "app-secret".to_string()))
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert_eq!(basic_credentials(&headers), None);
    }

    #[test]
    fn error_redirect_preserves_state() {
        let response = error_redirect(
            "https://app.example.com/cb",
            "invalid_request",
            "bad request",
            Some("st123"),
        );
        let location = response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(location.starts_with("https://app.example.com/cb?error=invalid_request"));
        assert!(location.contains("state=st123"));
    }
}
