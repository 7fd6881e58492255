use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use crate::auth::middleware::Authenticated;
use crate::error::ApiError;
use crate::models::oidc::InfluxDbClaims;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/auth/tokens/influxdb/new", get(new_influxdb_token))
}

/// Mint an HS256 JWT in the form InfluxDB 1.x expects.
///
/// The claims are exactly `username`, `exp`, and `iat`; the username may be
/// forced to a configured constant for deployments with one shared InfluxDB
/// account. Expiry mirrors the authenticating token's expiry.
async fn new_influxdb_token(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(ref secret) = state.config.issuer.influxdb_secret else {
        tracing::warn!(
            user = %auth.username(),
            "no InfluxDB issuer configuration"
        );
        return Err(ApiError::not_supported("No InfluxDB issuer configuration"));
    };

    let now = Utc::now();
    let username = state
        .config
        .issuer
        .influxdb_username
        .clone()
        .unwrap_or_else(|| auth.username().to_string());
    let exp = auth
        .data
        .expires
        .unwrap_or_else(|| now + Duration::minutes(state.config.issuer.exp_minutes));
    let claims = InfluxDbClaims {
        username: username.clone(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let key = EncodingKey::from_secret(secret.as_bytes());
    let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
        .map_err(|e| {
            tracing::error!(?e, "failed to sign InfluxDB token");
            ApiError::internal("Token signing failed")
        })?;

    tracing::info!(
        user = %auth.username(),
        influxdb_username = %username,
        "issued InfluxDB token"
    );
    Ok(Json(serde_json::json!({ "token": token })))
}
