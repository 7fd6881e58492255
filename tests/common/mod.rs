use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use gafaelfawr::auth::token::Token;
use gafaelfawr::config::{Config, IssuerConfig, OidcServerConfig};
use gafaelfawr::db::kv::MemoryStore;
use gafaelfawr::db::tokens::MemoryDatabase;
use gafaelfawr::error::ApiError;
use gafaelfawr::models::oidc::OidcClient;
use gafaelfawr::models::token::{Group, TokenData};
use gafaelfawr::providers::{AuthProvider, UserInfo};
use gafaelfawr::AppState;

pub const TEST_KEY: &str = include_str!("../data/issuer_key.pem");

/// Code the mock provider accepts during login-flow tests.
pub const GOOD_CODE: &str = "good-upstream-code";

/// Build a test configuration with in-memory-friendly settings: one OIDC
/// server client (`app`), a bootstrap token, and a small scope table.
pub fn test_config() -> Config {
    let mut known_scopes = HashMap::new();
    for (scope, description) in [
        ("exec:admin", "Administrative access"),
        ("exec:test", "Test access"),
        ("read:all", "Read everything"),
        ("user:token", "Manage tokens"),
        ("admin:token", "Manage all tokens"),
    ] {
        known_scopes.insert(scope.to_string(), description.to_string());
    }
    let mut group_mapping = HashMap::new();
    group_mapping.insert("exec:admin".to_string(), vec!["admins".to_string()]);
    group_mapping.insert("read:all".to_string(), vec!["science".to_string()]);

    Config {
        realm: "example.com".to_string(),
        loglevel: "debug".to_string(),
        session_secret: "test-session-secret".to_string(),
        redis_url: "redis://localhost:6379/0".to_string(),
        database_url: "postgresql://localhost/gafaelfawr_test".to_string(),
        bootstrap_token: Some(Token::generate().printable()),
        token_lifetime: chrono::Duration::hours(1),
        expiry_sweep_minutes: 60,
        proxies: vec!["10.0.0.0/8".parse().unwrap()],
        after_logout_url: "https://example.com/".to_string(),
        allowed_return_hosts: vec![],
        known_scopes,
        group_mapping,
        initial_admins: vec!["admin".to_string()],
        issuer: IssuerConfig {
            iss: "https://example.com".to_string(),
            aud: "https://example.com".to_string(),
            key_pem: TEST_KEY.to_string(),
            kid: None,
            exp_minutes: 5,
            influxdb_secret: Some("influx-secret".to_string()),
            influxdb_username: None,
        },
        github: None,
        oidc: None,
        oidc_server: Some(OidcServerConfig {
            clients: vec![OidcClient {
                id: "app".to_string(),
                secret: "app-secret".to_string(),
                redirect_uri: "https://app.example.com/".to_string(),
            }],
        }),
        ldap: None,
    }
}

/// The identity the mock upstream provider returns.
pub fn test_user() -> UserInfo {
    UserInfo {
        username: "rachel".to_string(),
        name: Some("Rachel".to_string()),
        email: Some("rachel@example.com".to_string()),
        uid: Some(4510),
        gid: None,
        groups: vec![
            Group {
                name: "admins".to_string(),
                id: Some(1000),
            },
            Group {
                name: "science".to_string(),
                id: Some(1001),
            },
        ],
    }
}

/// Upstream provider stub: accepts [`GOOD_CODE`] and returns a fixed
/// identity, so login-flow tests need no network.
pub struct MockProvider {
    pub user: UserInfo,
}

#[async_trait]
impl AuthProvider for MockProvider {
    fn login_url(&self, state: &str) -> String {
        format!(
            "https://upstream.example.com/oauth/authorize?state={}",
            state
        )
    }

    async fn exchange(&self, code: &str, _state: &str) -> Result<UserInfo, ApiError> {
        if code == GOOD_CODE {
            Ok(self.user.clone())
        } else {
            Err(ApiError::permission_denied("Authentication failed"))
        }
    }
}

/// Build an [`AppState`] backed by in-memory stores and the mock provider.
pub fn test_state() -> AppState {
    test_state_with_config(test_config())
}

pub fn test_state_with_config(config: Config) -> AppState {
    AppState::new(
        Arc::new(config),
        Arc::new(MemoryDatabase::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(MockProvider { user: test_user() }),
    )
    .expect("test signing keys")
}

/// Build the full application [`Router`] wired to the test state.
pub fn test_app() -> (Router, AppState) {
    let state = test_state();
    let app = gafaelfawr::routes::router().with_state(state.clone());
    (app, state)
}

/// Create a session token for the test user with the given scopes.
pub async fn create_session_token(state: &AppState, scopes: &[&str]) -> TokenData {
    state
        .token_service()
        .create_session_token(
            &test_user(),
            scopes.iter().map(|s| s.to_string()).collect(),
            None,
        )
        .await
        .expect("create session token")
}

/// Create a session token for an arbitrary username.
pub async fn create_session_token_for(
    state: &AppState,
    username: &str,
    scopes: &[&str],
) -> TokenData {
    let user = UserInfo {
        username: username.to_string(),
        name: None,
        email: None,
        uid: None,
        gid: None,
        groups: vec![],
    };
    state
        .token_service()
        .create_session_token(&user, scopes.iter().map(|s| s.to_string()).collect(), None)
        .await
        .expect("create session token")
}
