use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

use crate::config::OidcConfig;
use crate::error::ApiError;
use crate::providers::jwks::JwksClient;
use crate::providers::{AuthProvider, UserInfo};

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Upstream OpenID Connect adapter.
///
/// Redirects to the issuer's authorization endpoint, redeems the returned
/// code at the token endpoint, and verifies the ID token against the
/// issuer's JWKS before extracting the configured claims.
pub struct OidcProvider {
    config: OidcConfig,
    http: reqwest::Client,
    jwks: JwksClient,
}

impl OidcProvider {
    pub fn new(config: OidcConfig, http: reqwest::Client) -> Self {
        let jwks = JwksClient::new(&config.jwks_uri, http.clone());
        Self { config, http, jwks }
    }

    /// For tests: inject a pre-loaded JWKS client.
    pub fn with_jwks(config: OidcConfig, http: reqwest::Client, jwks: JwksClient) -> Self {
        Self { config, http, jwks }
    }

    /// Verify an ID token and extract the configured identity claims.
    ///
    /// Rejects tokens whose algorithm is not allowlisted, whose issuer or
    /// audience do not match configuration, or which are expired. All
    /// verification failures collapse to an authentication failure at the
    /// HTTP boundary.
    pub async fn verify_id_token(&self, id_token: &str) -> Result<UserInfo, ApiError> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|_| ApiError::permission_denied("Malformed ID token"))?;
        let algorithm = algorithm_name(header.alg);
        if !self.config.algorithms.iter().any(|a| a == algorithm) {
            tracing::warn!(alg = algorithm, "ID token algorithm not allowed");
            return Err(ApiError::permission_denied("Unknown token algorithm"));
        }
        let kid = header
            .kid
            .ok_or_else(|| ApiError::permission_denied("ID token has no key ID"))?;
        let key = self.jwks.get_key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(id_token, &key, &validation)
            .map_err(|e| {
                tracing::warn!(?e, "ID token verification failed");
                ApiError::permission_denied("ID token verification failed")
            })?;
        let claims = decoded.claims;

        let username = claims
            .get(&self.config.username_claim)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                tracing::warn!(claim = %self.config.username_claim, "missing username claim");
                ApiError::permission_denied("ID token missing required claims")
            })?
            .to_lowercase();
        // The uid claim may arrive as a number or a numeric string.
        let uid = match claims.get(&self.config.uid_claim) {
            Some(value) => Some(
                value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| {
                        ApiError::permission_denied("ID token uid claim is not a number")
                    })?,
            ),
            None => None,
        };

        Ok(UserInfo {
            username,
            name: claims
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            email: claims
                .get("email")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            uid,
            gid: None,
            groups: Vec::new(),
        })
    }
}

#[async_trait]
impl AuthProvider for OidcProvider {
    fn login_url(&self, state: &str) -> String {
        // Some issuers bake query parameters into the authorization endpoint.
        let sep = if self.config.login_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.login_url,
            sep,
            urlencode(&self.config.client_id),
            urlencode(&self.config.redirect_url),
            urlencode(&self.config.scopes.join(" ")),
            urlencode(state),
        )
    }

    async fn exchange(&self, code: &str, _state: &str) -> Result<UserInfo, ApiError> {
        let response: TokenResponse = self
            .http
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .timeout(HTTP_TIMEOUT)
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let id_token = response.id_token.ok_or_else(|| {
            tracing::error!(
                error = response.error_description.as_deref().unwrap_or("unknown"),
                "issuer returned no ID token"
            );
            ApiError::permission_denied("Authentication failed")
        })?;

        self.verify_id_token(&id_token).await
    }
}

fn algorithm_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::EdDSA => "EdDSA",
    }
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
