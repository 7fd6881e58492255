pub mod auth;
pub mod index;
pub mod influxdb;
pub mod login;
pub mod oidc;
pub mod tokens;

use std::net::IpAddr;

use axum::http::HeaderMap;
use axum::Router;

use crate::config::Config;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(index::router())
        .merge(auth::router())
        .merge(login::router())
        .merge(tokens::router())
        .merge(influxdb::router())
        // OIDC and discovery routes live on standards-based paths.
        .merge(oidc::router())
}

/// Client IP for logging and audit entries: the left-most `X-Forwarded-For`
/// entry that is not one of the configured proxies.
pub(crate) fn client_ip(headers: &HeaderMap, config: &Config) -> String {
    if let Some(value) = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
    {
        for entry in value.split(',') {
            let entry = entry.trim();
            if let Ok(addr) = entry.parse::<IpAddr>() {
                if !config.is_proxy(addr) {
                    return entry.to_string();
                }
            }
        }
    }
    "127.0.0.1".to_string()
}

/// URL being authorized, for logging. The ingress passes it in
/// `X-Original-URI`, older ingresses in `X-Original-URL`; URI wins when
/// both are present.
pub(crate) fn auth_uri(headers: &HeaderMap) -> String {
    for header in ["X-Original-URI", "X-Original-URL"] {
        if let Some(value) = headers.get(header).and_then(|v| v.to_str().ok()) {
            return value.to_string();
        }
    }
    "NONE".to_string()
}
