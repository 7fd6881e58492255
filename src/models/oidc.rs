use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::token::Token;

/// A statically-configured client of the OpenID Connect server.
///
/// The secret is compared in constant time; `redirect_uri` is a prefix that
/// presented redirect URIs must match.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcClient {
    pub id: String,
    pub secret: String,
    pub redirect_uri: String,
}

/// A one-shot authorization-code record, stored encrypted in the key-value
/// store for the code lifetime.
///
/// The code borrows the underlying token; deleting the code never affects
/// the token, and the token outliving the code is handled at redemption by
/// re-resolving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OidcAuthorization {
    pub code: Token,
    pub client_id: String,
    pub redirect_uri: String,
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub scope: String,
    pub created: DateTime<Utc>,
}

/// Response body of the token endpoint on success.
#[derive(Debug, Serialize)]
pub struct OidcTokenReply {
    pub access_token: String,
    pub id_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
}

/// Claims embedded in a signed ID token.
#[derive(Debug, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid_number: Option<i64>,
}

/// Claims of a minted InfluxDB token: exactly username, exp, and iat.
#[derive(Debug, Serialize, Deserialize)]
pub struct InfluxDbClaims {
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}
