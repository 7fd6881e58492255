use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::auth::middleware::Authenticated;
use crate::db::tokens::TokenUpdate;
use crate::error::ApiError;
use crate::models::admin::Admin;
use crate::models::history::{HistoryCursor, HistoryQuery, PaginatedHistory};
use crate::models::token::{CreateTokenRequest, ModifyTokenRequest, TokenInfo};
use crate::routes::client_ip;
use crate::AppState;

const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_PAGE_SIZE: usize = 500;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/tokens", get(list_own_tokens))
        .route(
            "/auth/api/v1/users/{username}/tokens",
            get(list_tokens).post(create_token),
        )
        .route(
            "/auth/api/v1/users/{username}/tokens/{key}",
            get(get_token).patch(modify_token).delete(delete_token),
        )
        .route("/auth/api/v1/history/token-changes", get(token_changes))
        .route("/auth/api/v1/admins", get(list_admins).post(add_admin))
        .route("/auth/api/v1/admins/{username}", axum::routing::delete(delete_admin))
}

fn ensure_may_act_for(auth: &Authenticated, username: &str) -> Result<(), ApiError> {
    if auth.may_act_for(username) {
        Ok(())
    } else {
        Err(ApiError::permission_denied(format!(
            "{} may not act on tokens of {}",
            auth.username(),
            username
        )))
    }
}

// ---------------------------------------------------------------------------
// GET /auth/tokens
// ---------------------------------------------------------------------------

/// The authenticated user's own token list. The HTML management UI is an
/// external plug-in; this surface serves it JSON.
async fn list_own_tokens(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<Vec<TokenInfo>>, ApiError> {
    let tokens = state.token_service().list_tokens(auth.username()).await?;
    Ok(Json(tokens))
}

// ---------------------------------------------------------------------------
// /auth/api/v1/users/{username}/tokens
// ---------------------------------------------------------------------------

async fn list_tokens(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(username): Path<String>,
) -> Result<Json<Vec<TokenInfo>>, ApiError> {
    ensure_may_act_for(&auth, &username)?;
    let tokens = state.token_service().list_tokens(&username).await?;
    Ok(Json(tokens))
}

async fn create_token(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(username): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CreateTokenRequest>,
) -> Result<Response, ApiError> {
    auth.check_csrf()?;
    ensure_may_act_for(&auth, &username)?;
    let expires = parse_epoch(request.expires)?;
    let remote_ip = client_ip(&headers, &state.config);
    let token = state
        .token_service()
        .create_user_token(
            &auth.data,
            auth.is_admin,
            &username,
            &request.token_name,
            request.scopes,
            expires,
            Some(&remote_ip),
        )
        .await?;

    let location = format!("/auth/api/v1/users/{}/tokens/{}", username, token.key);
    let body = Json(serde_json::json!({ "token": token.printable() }));
    let mut response = (StatusCode::CREATED, body).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    Ok(response)
}

async fn get_token(
    State(state): State<AppState>,
    auth: Authenticated,
    Path((username, key)): Path<(String, String)>,
) -> Result<Json<TokenInfo>, ApiError> {
    ensure_may_act_for(&auth, &username)?;
    let info = state
        .token_service()
        .get_token_info(&key)
        .await?
        .filter(|info| info.username == username)
        .ok_or_else(|| ApiError::not_found("Token not found"))?;
    Ok(Json(info))
}

async fn modify_token(
    State(state): State<AppState>,
    auth: Authenticated,
    Path((username, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<ModifyTokenRequest>,
) -> Result<Json<TokenInfo>, ApiError> {
    auth.check_csrf()?;
    ensure_may_act_for(&auth, &username)?;
    // 404 before modification if the token is someone else's.
    state
        .token_service()
        .get_token_info(&key)
        .await?
        .filter(|info| info.username == username)
        .ok_or_else(|| ApiError::not_found("Token not found"))?;

    let update = TokenUpdate {
        token_name: request.token_name,
        scopes: request.scopes,
        expires: match request.expires {
            Some(epoch) => Some(parse_epoch(Some(epoch))?),
            None => None,
        },
    };
    let remote_ip = client_ip(&headers, &state.config);
    let info = state
        .token_service()
        .modify_token(&key, update, &auth.data, auth.is_admin, Some(&remote_ip))
        .await?
        .ok_or_else(|| ApiError::not_found("Token not found"))?;
    Ok(Json(info))
}

async fn delete_token(
    State(state): State<AppState>,
    auth: Authenticated,
    Path((username, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    auth.check_csrf()?;
    ensure_may_act_for(&auth, &username)?;
    state
        .token_service()
        .get_token_info(&key)
        .await?
        .filter(|info| info.username == username)
        .ok_or_else(|| ApiError::not_found("Token not found"))?;

    let remote_ip = client_ip(&headers, &state.config);
    let deleted = state
        .token_service()
        .delete_token(&key, auth.username(), Some(&remote_ip))
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Token not found"))
    }
}

fn parse_epoch(expires: Option<i64>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match expires {
        None => Ok(None),
        Some(epoch) => Utc
            .timestamp_opt(epoch, 0)
            .single()
            .map(Some)
            .ok_or_else(|| ApiError::invalid_expires("expires is not a valid timestamp")),
    }
}

// ---------------------------------------------------------------------------
// GET /auth/api/v1/history/token-changes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryParams {
    cursor: Option<String>,
    limit: Option<usize>,
    key: Option<String>,
    username: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
}

/// Paginated audit log with RFC 8288 `Link` headers carrying the cursors.
async fn token_changes(
    State(state): State<AppState>,
    auth: Authenticated,
    Query(params): Query<HistoryParams>,
) -> Result<Response, ApiError> {
    // Non-admins see only their own history.
    let username = match (&params.username, auth.is_admin) {
        (Some(username), true) => Some(username.clone()),
        (Some(username), false) if username == auth.username() => Some(username.clone()),
        (Some(_), false) => {
            return Err(ApiError::permission_denied(
                "only admins may view other users' history",
            ))
        }
        (None, true) => None,
        (None, false) => Some(auth.username().to_string()),
    };

    let cursor = match params.cursor {
        Some(ref raw) => Some(
            HistoryCursor::parse(raw)
                .ok_or_else(|| ApiError::invalid_cursor(format!("Invalid cursor {}", raw)))?,
        ),
        None => None,
    };
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let query = HistoryQuery {
        token: params.key,
        username,
        since: params.since,
        until: params.until,
        cursor,
        limit,
    };
    let page = state.db.history(&query).await?;

    let mut response = Json(&page.entries).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&page.count.to_string()) {
        headers.insert("X-Total-Count", value);
    }
    if let Ok(value) = HeaderValue::from_str(&link_header(&query, &page)) {
        headers.insert(header::LINK, value);
    }
    Ok(response)
}

/// Build the `Link` header for a history page: always `first`, plus `prev`
/// and `next` where the cursors exist.
fn link_header(query: &HistoryQuery, page: &PaginatedHistory) -> String {
    let base = "/auth/api/v1/history/token-changes";
    let static_params: Vec<(&str, String)> = [
        ("key", query.token.clone()),
        ("username", query.username.clone()),
        ("since", query.since.map(|t| t.to_rfc3339())),
        ("until", query.until.map(|t| t.to_rfc3339())),
    ]
    .into_iter()
    .filter_map(|(k, v)| v.map(|v| (k, v)))
    .collect();

    let url_for = |cursor: Option<HistoryCursor>| -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &static_params {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("limit", &query.limit.to_string());
        if let Some(cursor) = cursor {
            serializer.append_pair("cursor", &cursor.to_string());
        }
        format!("{}?{}", base, serializer.finish())
    };

    let mut links = vec![format!("<{}>; rel=\"first\"", url_for(None))];
    if let Some(prev) = page.prev_cursor {
        links.push(format!("<{}>; rel=\"prev\"", url_for(Some(prev))));
    }
    if let Some(next) = page.next_cursor {
        links.push(format!("<{}>; rel=\"next\"", url_for(Some(next))));
    }
    links.join(", ")
}

// ---------------------------------------------------------------------------
// /auth/api/v1/admins
// ---------------------------------------------------------------------------

async fn list_admins(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<Vec<Admin>>, ApiError> {
    if !auth.is_admin {
        return Err(ApiError::permission_denied("admins only"));
    }
    Ok(Json(state.admin_service().get_admins().await?))
}

#[derive(Debug, Deserialize)]
struct AddAdminRequest {
    username: String,
}

async fn add_admin(
    State(state): State<AppState>,
    auth: Authenticated,
    Json(request): Json<AddAdminRequest>,
) -> Result<StatusCode, ApiError> {
    auth.check_csrf()?;
    state
        .admin_service()
        .add_admin(&request.username, auth.username())
        .await?;
    Ok(StatusCode::CREATED)
}

async fn delete_admin(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    auth.check_csrf()?;
    let deleted = state
        .admin_service()
        .delete_admin(&username, auth.username())
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("Admin not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_round_trips_cursors() {
        let query = HistoryQuery {
            token: Some("some-key".to_string()),
            username: None,
            since: None,
            until: None,
            cursor: None,
            limit: 50,
        };
        let page = PaginatedHistory {
            entries: vec![],
            count: 120,
            prev_cursor: HistoryCursor::parse("p1600000000_5"),
            next_cursor: HistoryCursor::parse("1600000000_3"),
        };
        let header = link_header(&query, &page);
        assert!(header.contains("rel=\"first\""));
        assert!(header.contains("cursor=p1600000000_5>; rel=\"prev\""));
        assert!(header.contains("cursor=1600000000_3>; rel=\"next\""));
        assert!(header.contains("key=some-key"));
    }
}
