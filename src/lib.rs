pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod routes;
pub mod services;

use std::sync::Arc;

use auth::crypto::SessionCipher;
use auth::keys::{KeyError, SigningKeys};
use config::Config;
use db::cache::{CodeStore, TokenStore};
use db::kv::KeyValueStore;
use db::tokens::TokenDatabase;
use providers::ldap::LdapGroupResolver;
use providers::AuthProvider;
use services::admin::AdminService;
use services::oidc::OidcServerService;
use services::token::TokenService;

/// Shared application state available to all route handlers.
///
/// Built once at startup by the composition root in `main` and handed to
/// handlers by reference; everything inside is cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn TokenDatabase>,
    pub cipher: SessionCipher,
    pub tokens: TokenStore,
    pub codes: CodeStore,
    pub keys: Arc<SigningKeys>,
    pub provider: Arc<dyn AuthProvider>,
    pub ldap: Option<Arc<LdapGroupResolver>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        db: Arc<dyn TokenDatabase>,
        kv: Arc<dyn KeyValueStore>,
        provider: Arc<dyn AuthProvider>,
    ) -> Result<Self, KeyError> {
        let cipher = SessionCipher::new(&config.session_secret);
        let keys = Arc::new(SigningKeys::from_pem(
            &config.issuer.key_pem,
            config.issuer.kid.as_deref(),
        )?);
        let ldap = config
            .ldap
            .clone()
            .map(|ldap| Arc::new(LdapGroupResolver::new(ldap)));
        Ok(Self {
            tokens: TokenStore::new(kv.clone(), cipher.clone()),
            codes: CodeStore::new(kv, cipher.clone()),
            cipher,
            keys,
            provider,
            ldap,
            config,
            db,
        })
    }

    pub fn token_service(&self) -> TokenService {
        TokenService::new(self.config.clone(), self.db.clone(), self.tokens.clone())
    }

    pub fn admin_service(&self) -> AdminService {
        AdminService::new(self.db.clone())
    }

    pub fn oidc_service(&self) -> OidcServerService {
        OidcServerService::new(self.config.clone(), self.codes.clone(), self.keys.clone())
    }
}
