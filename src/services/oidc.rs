use std::sync::Arc;

use chrono::Utc;
use constant_time_eq::constant_time_eq;

use crate::auth::keys::SigningKeys;
use crate::auth::token::Token;
use crate::config::Config;
use crate::db::cache::CodeStore;
use crate::error::ApiError;
use crate::models::oidc::{IdTokenClaims, OidcAuthorization, OidcClient};
use crate::models::token::TokenData;

/// How long (in seconds) an authorization code is good for.
pub const CODE_LIFETIME_SECS: u64 = 3600;

/// The embedded OpenID Connect authorization server.
///
/// Issues authorization codes bound to a registered client and the user's
/// session token, redeems them exactly once, and mints RS256 ID tokens.
/// Clients are static configuration; secrets are compared in constant time.
#[derive(Clone)]
pub struct OidcServerService {
    config: Arc<Config>,
    codes: CodeStore,
    keys: Arc<SigningKeys>,
}

impl OidcServerService {
    pub fn new(config: Arc<Config>, codes: CodeStore, keys: Arc<SigningKeys>) -> Self {
        Self {
            config,
            codes,
            keys,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.oidc_server.is_some()
    }

    fn clients(&self) -> &[OidcClient] {
        self.config
            .oidc_server
            .as_ref()
            .map(|s| s.clients.as_slice())
            .unwrap_or(&[])
    }

    /// Validate the client and redirect URI of an authorization request.
    /// The redirect URI must be prefixed by the client's registered one.
    pub fn validate_authorization(
        &self,
        client_id: &str,
        redirect_uri: &str,
    ) -> Result<(), ApiError> {
        let Some(client) = self.clients().iter().find(|c| c.id == client_id) else {
            return Err(ApiError::unauthorized_client(format!(
                "Unknown client_id {}",
                client_id
            )));
        };
        if !redirect_uri.starts_with(&client.redirect_uri) {
            return Err(ApiError::oauth_invalid_request(
                "Invalid redirect_uri for client",
            ));
        }
        Ok(())
    }

    /// Mint a one-shot authorization code for an authenticated session.
    pub async fn issue_code(
        &self,
        client_id: &str,
        redirect_uri: &str,
        token: &Token,
        nonce: Option<String>,
    ) -> Result<Token, ApiError> {
        let code = Token::generate();
        let authorization = OidcAuthorization {
            code: code.clone(),
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            token: token.clone(),
            nonce,
            scope: "openid".to_string(),
            created: Utc::now(),
        };
        self.codes.store(&authorization, CODE_LIFETIME_SECS).await?;
        tracing::info!(client_id, code = %code.key, "issued authorization code");
        Ok(code)
    }

    /// Redeem an authorization code.
    ///
    /// Client credentials are checked in constant time over the whole
    /// client table. The code is consumed atomically, so a second
    /// redemption fails with `invalid_grant` no matter how close the race.
    pub async fn redeem_code(
        &self,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        code: &str,
    ) -> Result<OidcAuthorization, ApiError> {
        let mut authenticated = false;
        for client in self.clients() {
            let id_ok = constant_time_eq(client.id.as_bytes(), client_id.as_bytes());
            let secret_ok = constant_time_eq(client.secret.as_bytes(), client_secret.as_bytes());
            if id_ok && secret_ok {
                authenticated = true;
            }
        }
        if !authenticated {
            return Err(ApiError::invalid_client("Unauthorized client"));
        }

        let code = Token::parse_code(code)
            .map_err(|_| ApiError::invalid_grant("Invalid authorization code"))?;
        let Some(authorization) = self.codes.consume(&code.key).await? else {
            return Err(ApiError::invalid_grant("Invalid authorization code"));
        };
        if !constant_time_eq(
            authorization.code.secret.as_bytes(),
            code.secret.as_bytes(),
        ) {
            return Err(ApiError::invalid_grant("Invalid authorization code"));
        }
        if authorization.client_id != client_id || authorization.redirect_uri != redirect_uri {
            return Err(ApiError::invalid_grant("Invalid authorization code"));
        }
        Ok(authorization)
    }

    /// Sign an ID token for the user behind a session token. Returns the
    /// JWT and its lifetime in seconds.
    pub fn sign_id_token(
        &self,
        data: &TokenData,
        client_id: &str,
        nonce: Option<String>,
        scope: &str,
    ) -> Result<(String, i64), ApiError> {
        let now = Utc::now();
        let expires_in = self.config.issuer.exp_minutes * 60;
        let claims = IdTokenClaims {
            iss: self.config.issuer.iss.clone(),
            sub: data.username.clone(),
            aud: client_id.to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + expires_in,
            nonce,
            scope: scope.to_string(),
            preferred_username: Some(data.username.clone()),
            name: data.name.clone(),
            uid_number: data.uid,
        };
        let jwt = self.keys.sign(&claims)?;
        Ok((jwt, expires_in))
    }

    /// The issuer metadata document.
    pub fn openid_configuration(&self) -> serde_json::Value {
        let iss = &self.config.issuer.iss;
        serde_json::json!({
            "issuer": iss,
            "authorization_endpoint": format!("{iss}/auth/openid/login"),
            "token_endpoint": format!("{iss}/auth/openid/token"),
            "jwks_uri": format!("{iss}/.well-known/jwks.json"),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
            "scopes_supported": ["openid"],
            "token_endpoint_auth_methods_supported": ["client_secret_basic", "client_secret_post"],
        })
    }

    pub fn jwks(&self) -> serde_json::Value {
        self.keys.jwks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::crypto::SessionCipher;
    use crate::config::OidcServerConfig;
    use crate::db::kv::MemoryStore;

    const TEST_KEY: &str = include_str!("../../tests/data/issuer_key.pem");

    fn service() -> OidcServerService {
        let mut config = crate::config::Config {
            realm: "example.com".to_string(),
            loglevel: "debug".to_string(),
            session_secret: "secret".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            database_url: "postgresql://localhost/gafaelfawr".to_string(),
            bootstrap_token: None,
            token_lifetime: chrono::Duration::hours(23),
            expiry_sweep_minutes: 60,
            proxies: vec![],
            after_logout_url: "https://example.com/".to_string(),
            allowed_return_hosts: vec![],
            known_scopes: std::collections::HashMap::new(),
            group_mapping: std::collections::HashMap::new(),
            initial_admins: vec![],
            issuer: crate::config::IssuerConfig {
                iss: "https://example.com".to_string(),
                aud: "https://example.com".to_string(),
                key_pem: TEST_KEY.to_string(),
                kid: None,
                exp_minutes: 5,
                influxdb_secret: None,
                influxdb_username: None,
            },
            github: None,
            oidc: None,
            oidc_server: None,
            ldap: None,
        };
        config.oidc_server = Some(OidcServerConfig {
            clients: vec![OidcClient {
                id: "app".to_string(),
                secret: "app-secret".to_string(),
                redirect_uri: "https://app.example.com/".to_string(),
            }],
        });
        let cipher = SessionCipher::new("secret");
        let codes = CodeStore::new(Arc::new(MemoryStore::new()), cipher);
        let keys = Arc::new(SigningKeys::from_pem(TEST_KEY, None).unwrap());
        OidcServerService::new(Arc::new(config), codes, keys)
    }

    #[tokio::test]
    async fn code_redemption_is_single_use() {
        let service = service();
        let token = Token::generate();
        let code = service
            .issue_code("app", "https://app.example.com/cb", &token, None)
            .await
            .unwrap();

        let authorization = service
            .redeem_code(
                "app",
                "app-secret",
                "https://app.example.com/cb",
                &code.printable_code(),
            )
            .await
            .unwrap();
        assert_eq!(authorization.token, token);

        let err = service
            .redeem_code(
                "app",
                "app-secret",
                "https://app.example.com/cb",
                &code.printable_code(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_grant");
    }

    #[tokio::test]
    async fn redemption_requires_valid_client_credentials() {
        let service = service();
        let code = service
            .issue_code("app", "https://app.example.com/cb", &Token::generate(), None)
            .await
            .unwrap();

        let err = service
            .redeem_code(
                "app",
                "wrong-secret",
                "https://app.example.com/cb",
                &code.printable_code(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_client");

        // The code was not consumed by the failed attempt.
        service
            .redeem_code(
                "app",
                "app-secret",
                "https://app.example.com/cb",
                &code.printable_code(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn redemption_checks_redirect_uri_binding() {
        let service = service();
        let code = service
            .issue_code("app", "https://app.example.com/cb", &Token::generate(), None)
            .await
            .unwrap();
        let err = service
            .redeem_code(
                "app",
                "app-secret",
                "https://app.example.com/other",
                &code.printable_code(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_grant");
    }

    #[test]
    fn authorization_validates_redirect_prefix() {
        let service = service();
        assert!(service
            .validate_authorization("app", "https://app.example.com/cb")
            .is_ok());
        assert!(service
            .validate_authorization("app", "https://evil.example.com/cb")
            .is_err());
        assert!(service
            .validate_authorization("unknown", "https://app.example.com/cb")
            .is_err());
    }
}
