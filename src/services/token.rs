use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};

use crate::auth::token::{hash_secret, Token};
use crate::config::Config;
use crate::db::cache::TokenStore;
use crate::db::tokens::{DerivedOutcome, TokenDatabase, TokenUpdate};
use crate::error::ApiError;
use crate::models::admin::BOOTSTRAP_ACTOR;
use crate::models::history::{HistoryEvent, NewHistoryEntry};
use crate::models::token::{
    normalize_scopes, TokenData, TokenInfo, TokenRecord, TokenType,
};
use crate::providers::UserInfo;

/// Minimum lifetime of a token with an explicit expiration, in seconds.
pub const MINIMUM_LIFETIME_SECS: i64 = 300;

/// Maximum length of a username.
const USERNAME_MAX: usize = 64;

/// The only writer of tokens and the sole authority on derivation rules.
///
/// Creation writes the database row first and mirrors into Redis after; the
/// database is the system of record and a failed mirror write is repaired
/// by the miss path of [`TokenService::resolve`].
#[derive(Clone)]
pub struct TokenService {
    config: Arc<Config>,
    db: Arc<dyn TokenDatabase>,
    cache: TokenStore,
}

impl TokenService {
    pub fn new(config: Arc<Config>, db: Arc<dyn TokenDatabase>, cache: TokenStore) -> Self {
        Self { config, db, cache }
    }

    // -- Resolution -------------------------------------------------------

    /// Resolve a presented token to its data, or `None` if the token is
    /// unknown, revoked, expired, or carries the wrong secret.
    ///
    /// Redis is the fast path; on a miss the record is rebuilt from the
    /// database (verifying the presented secret against its stored hash)
    /// and written back into Redis.
    pub async fn resolve(&self, token: &Token) -> Result<Option<TokenData>, ApiError> {
        let now = Utc::now();
        if let Some(data) = self.cache.get(&token.key).await? {
            if !constant_time_eq(data.token.secret.as_bytes(), token.secret.as_bytes()) {
                tracing::warn!(token = %token.key, "token secret mismatch");
                return Ok(None);
            }
            if data.is_expired(now) {
                return Ok(None);
            }
            return Ok(Some(data));
        }

        let Some(record) = self.db.get(&token.key).await? else {
            return Ok(None);
        };
        if record.revoked || record.is_expired(now) {
            return Ok(None);
        }
        let presented = hash_secret(&token.secret);
        if !constant_time_eq(record.secret_hash.as_bytes(), presented.as_bytes()) {
            tracing::warn!(token = %token.key, "token secret mismatch");
            return Ok(None);
        }
        let data = record.to_data(token.secret.clone());
        self.mirror(&data).await;
        Ok(Some(data))
    }

    // -- Creation ---------------------------------------------------------

    /// Issue a new session token at login.
    ///
    /// The scope set has already been computed from the user's group
    /// memberships; the default session lifetime comes from configuration.
    pub async fn create_session_token(
        &self,
        user: &UserInfo,
        scopes: Vec<String>,
        ip_address: Option<&str>,
    ) -> Result<TokenData, ApiError> {
        validate_username(&user.username)?;
        let now = Utc::now();
        let token = Token::generate();
        let record = TokenRecord {
            key: token.key.clone(),
            secret_hash: token.secret_hash(),
            username: user.username.clone(),
            token_type: TokenType::Session,
            scopes: normalize_scopes(scopes),
            service: None,
            token_name: None,
            parent: None,
            uid: user.uid,
            gid: user.gid,
            email: user.email.clone(),
            name: user.name.clone(),
            groups: Some(user.groups.clone()),
            created: now,
            expires: Some(now + self.config.token_lifetime),
            revoked: false,
        };
        let history = self.create_entry(&record, &user.username, ip_address, now);
        self.db.add(&record, &history).await?;
        let data = record.to_data(token.secret);
        self.mirror(&data).await;
        tracing::info!(user = %data.username, token = %data.token.key, "created session token");
        Ok(data)
    }

    /// Create a long-lived user token.
    ///
    /// The actor must be the owner or an admin (enforced by the caller);
    /// non-admin actors may only grant scopes their own token has.
    pub async fn create_user_token(
        &self,
        actor_data: &TokenData,
        actor_is_admin: bool,
        username: &str,
        token_name: &str,
        scopes: Vec<String>,
        expires: Option<DateTime<Utc>>,
        ip_address: Option<&str>,
    ) -> Result<Token, ApiError> {
        validate_username(username)?;
        let scopes = normalize_scopes(scopes);
        self.validate_scopes(&scopes)?;
        if !actor_is_admin {
            require_subset(&scopes, &actor_data.scopes)?;
        }
        if token_name.is_empty() {
            return Err(ApiError::validation(
                "validation_failed",
                crate::error::ErrorLocation::Body,
                "token_name",
                "token_name must not be empty",
            ));
        }
        let now = Utc::now();
        validate_expires(expires, now)?;
        if self.db.get_by_name(username, token_name).await?.is_some() {
            return Err(ApiError::duplicate_token_name(format!(
                "A token named \"{}\" already exists",
                token_name
            )));
        }

        let token = Token::generate();
        let same_user = actor_data.username == username;
        let record = TokenRecord {
            key: token.key.clone(),
            secret_hash: token.secret_hash(),
            username: username.to_string(),
            token_type: TokenType::User,
            scopes,
            service: None,
            token_name: Some(token_name.to_string()),
            parent: None,
            uid: if same_user { actor_data.uid } else { None },
            gid: if same_user { actor_data.gid } else { None },
            email: if same_user {
                actor_data.email.clone()
            } else {
                None
            },
            name: if same_user {
                actor_data.name.clone()
            } else {
                None
            },
            groups: if same_user {
                actor_data.groups.clone()
            } else {
                None
            },
            created: now,
            expires,
            revoked: false,
        };
        let history = self.create_entry(&record, &actor_data.username, ip_address, now);
        self.db.add(&record, &history).await?;
        self.mirror(&record.to_data(token.secret.clone())).await;
        tracing::info!(
            user = username,
            token = %token.key,
            token_name,
            "created user token"
        );
        Ok(token)
    }

    // -- Derived tokens ---------------------------------------------------

    /// The canonical notebook token for a parent, created on first call.
    ///
    /// The key is `SHA-256(parent.key || "notebook")` truncated to 16
    /// bytes, so the call is idempotent and concurrent-safe: the database
    /// unique-key constraint is the serialization point and the losing
    /// writer returns the winner's token.
    pub async fn get_notebook_token(
        &self,
        parent: &TokenData,
        ip_address: Option<&str>,
    ) -> Result<Token, ApiError> {
        let key = derived_key(&parent.token.key, "notebook");
        self.get_or_create_derived(
            parent,
            key,
            TokenType::Notebook,
            None,
            parent.scopes.clone(),
            ip_address,
        )
        .await
    }

    /// The canonical internal token for a (parent, service, scope set).
    ///
    /// Scopes must be a subset of the parent's scopes. The key is
    /// `SHA-256(parent.key || service || sorted(scopes).join(" "))`
    /// truncated to 16 bytes.
    pub async fn get_internal_token(
        &self,
        parent: &TokenData,
        service: &str,
        scopes: Vec<String>,
        ip_address: Option<&str>,
    ) -> Result<Token, ApiError> {
        validate_service(service)?;
        let scopes = normalize_scopes(scopes);
        require_subset(&scopes, &parent.scopes)?;
        let key = derived_key(
            &parent.token.key,
            &format!("{}{}", service, scopes.join(" ")),
        );
        self.get_or_create_derived(
            parent,
            key,
            TokenType::Internal,
            Some(service.to_string()),
            scopes,
            ip_address,
        )
        .await
    }

    async fn get_or_create_derived(
        &self,
        parent: &TokenData,
        key: String,
        token_type: TokenType,
        service: Option<String>,
        scopes: Vec<String>,
        ip_address: Option<&str>,
    ) -> Result<Token, ApiError> {
        let now = Utc::now();
        if let Some(existing) = self.db.get(&key).await? {
            return self.token_for_existing(existing, parent, now).await;
        }

        let token = Token::with_key(key);
        let record = TokenRecord {
            key: token.key.clone(),
            secret_hash: token.secret_hash(),
            username: parent.username.clone(),
            token_type,
            scopes,
            service,
            token_name: None,
            parent: Some(parent.token.key.clone()),
            uid: parent.uid,
            gid: parent.gid,
            email: parent.email.clone(),
            name: parent.name.clone(),
            groups: parent.groups.clone(),
            created: now,
            expires: parent.expires,
            revoked: false,
        };
        let history = self.create_entry(&record, &parent.username, ip_address, now);
        match self.db.add_derived(&record, &history).await? {
            DerivedOutcome::Created => {
                self.mirror(&record.to_data(token.secret.clone())).await;
                Ok(token)
            }
            // Lost the race; the winner's row and Redis entry are
            // authoritative.
            DerivedOutcome::Existing(existing) => {
                self.token_for_existing(existing, parent, now).await
            }
        }
    }

    /// Return the full token for an existing derived row, recovering the
    /// secret from Redis. If the Redis record is gone (or the row is stale
    /// from a revoked ancestor chain), rotate the secret in place; the key,
    /// and therefore the derivation identity, never changes.
    async fn token_for_existing(
        &self,
        existing: TokenRecord,
        parent: &TokenData,
        now: DateTime<Utc>,
    ) -> Result<Token, ApiError> {
        if !existing.revoked && !existing.is_expired(now) {
            if let Some(data) = self.cache.get(&existing.key).await? {
                return Ok(data.token);
            }
        }
        let token = Token::with_key(existing.key.clone());
        self.db
            .refresh_derived(&existing.key, &token.secret_hash(), parent.expires)
            .await?;
        let mut record = existing;
        record.expires = parent.expires;
        record.revoked = false;
        self.mirror(&record.to_data(token.secret.clone())).await;
        Ok(token)
    }

    // -- Listing and inspection ------------------------------------------

    pub async fn list_tokens(&self, username: &str) -> Result<Vec<TokenInfo>, ApiError> {
        let records = self.db.list_for_user(username).await?;
        Ok(records.iter().map(TokenInfo::from).collect())
    }

    pub async fn get_token_info(&self, key: &str) -> Result<Option<TokenInfo>, ApiError> {
        let record = self.db.get(key).await?;
        Ok(record.as_ref().filter(|r| !r.revoked).map(TokenInfo::from))
    }

    // -- Modification and revocation -------------------------------------

    /// Modify a token's name, scopes, or expiry, recording an `edit`
    /// history entry with before/after snapshots of changed fields.
    pub async fn modify_token(
        &self,
        key: &str,
        update: TokenUpdate,
        actor_data: &TokenData,
        actor_is_admin: bool,
        ip_address: Option<&str>,
    ) -> Result<Option<TokenInfo>, ApiError> {
        let Some(record) = self.db.get(key).await?.filter(|r| !r.revoked) else {
            return Ok(None);
        };
        let now = Utc::now();
        let mut update = update;
        if let Some(ref mut scopes) = update.scopes {
            *scopes = normalize_scopes(scopes.clone());
            self.validate_scopes(scopes)?;
            // Widening a token's scopes beyond the actor's own is reserved
            // for admins.
            if !actor_is_admin {
                require_subset(scopes, &actor_data.scopes)?;
            }
        }
        if let Some(expires) = update.expires {
            validate_expires(expires, now)?;
        }

        let mut old_values = serde_json::Map::new();
        let mut new_values = serde_json::Map::new();
        if let Some(ref name) = update.token_name {
            old_values.insert("token_name".into(), serde_json::json!(record.token_name));
            new_values.insert("token_name".into(), serde_json::json!(name));
        }
        if let Some(ref scopes) = update.scopes {
            old_values.insert("scopes".into(), serde_json::json!(record.scopes));
            new_values.insert("scopes".into(), serde_json::json!(scopes));
        }
        if let Some(expires) = update.expires {
            old_values.insert(
                "expires".into(),
                serde_json::json!(record.expires.map(|e| e.timestamp())),
            );
            new_values.insert(
                "expires".into(),
                serde_json::json!(expires.map(|e| e.timestamp())),
            );
        }

        let history = NewHistoryEntry {
            token: record.key.clone(),
            username: record.username.clone(),
            token_type: record.token_type,
            event: HistoryEvent::Edit,
            actor: actor_data.username.clone(),
            ip_address: ip_address.map(str::to_string),
            event_time: now,
            old_values: Some(serde_json::Value::Object(old_values)),
            new_values: Some(serde_json::Value::Object(new_values)),
        };
        let updated = self.db.modify(key, &update, &history).await?;
        // Drop the mirror; the next resolve rebuilds it from the database.
        self.cache.delete(key).await?;
        Ok(updated.map(|r| TokenInfo::from(&r)))
    }

    /// Revoke a token and all of its descendants.
    pub async fn delete_token(
        &self,
        key: &str,
        actor: &str,
        ip_address: Option<&str>,
    ) -> Result<bool, ApiError> {
        let keys = self
            .db
            .revoke_cascade(key, actor, ip_address, Utc::now())
            .await?;
        if keys.is_empty() {
            return Ok(false);
        }
        for key in &keys {
            self.cache.delete(key).await?;
        }
        tracing::info!(token = key, revoked = keys.len(), actor, "revoked token");
        Ok(true)
    }

    /// One pass of the expiry sweep: write `expire` history entries for
    /// newly-expired tokens and clear their Redis mirrors. Database rows
    /// are kept so history and audit remain queryable.
    pub async fn expire_tokens(&self) -> Result<usize, ApiError> {
        let keys = self.db.expire_tokens(Utc::now()).await?;
        for key in &keys {
            // Best effort; Redis TTLs have usually handled these already.
            if let Err(error) = self.cache.delete(key).await {
                tracing::warn!(%error, token = %key, "failed to delete expired token from redis");
            }
        }
        if !keys.is_empty() {
            tracing::info!(count = keys.len(), "marked tokens expired");
        }
        Ok(keys.len())
    }

    // -- Helpers ----------------------------------------------------------

    /// Mirror token data into Redis after a database commit. Failures are
    /// logged, not propagated: the database already holds the truth and the
    /// next resolve repairs the mirror on its miss path.
    async fn mirror(&self, data: &TokenData) {
        if let Err(error) = self.cache.store(data).await {
            tracing::warn!(%error, token = %data.token.key, "failed to mirror token into redis");
        }
    }

    fn create_entry(
        &self,
        record: &TokenRecord,
        actor: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> NewHistoryEntry {
        NewHistoryEntry {
            token: record.key.clone(),
            username: record.username.clone(),
            token_type: record.token_type,
            event: HistoryEvent::Create,
            actor: actor.to_string(),
            ip_address: ip_address.map(str::to_string),
            event_time: now,
            old_values: None,
            new_values: None,
        }
    }

    fn validate_scopes(&self, scopes: &[String]) -> Result<(), ApiError> {
        for scope in scopes {
            if !is_valid_scope(scope) {
                return Err(ApiError::invalid_scopes(format!(
                    "Invalid scope {}",
                    scope
                )));
            }
            if !self.config.known_scopes.contains_key(scope) {
                return Err(ApiError::invalid_scopes(format!(
                    "Unknown scope {}",
                    scope
                )));
            }
        }
        Ok(())
    }
}

/// Key of a derived token: SHA-256 of the parent key and derivation
/// material, truncated to 16 bytes and base64url-encoded like any other
/// token key.
fn derived_key(parent_key: &str, material: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", parent_key, material).as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

fn require_subset(scopes: &[String], parent_scopes: &[String]) -> Result<(), ApiError> {
    for scope in scopes {
        if !parent_scopes.contains(scope) {
            return Err(ApiError::permission_denied(format!(
                "Requested scope {} is not available",
                scope
            )));
        }
    }
    Ok(())
}

fn validate_expires(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(), ApiError> {
    if let Some(expires) = expires {
        if expires < now + Duration::seconds(MINIMUM_LIFETIME_SECS) {
            return Err(ApiError::invalid_expires(
                "Token must be valid for at least five minutes",
            ));
        }
    }
    Ok(())
}

/// Usernames match `^[a-z_][a-z0-9._-]*$` and are at most 64 characters.
pub fn validate_username(username: &str) -> Result<(), ApiError> {
    let valid = username.len() <= USERNAME_MAX
        && username != BOOTSTRAP_ACTOR
        && matches!(username.chars().next(), Some('a'..='z') | Some('_'))
        && username
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::validation(
            "validation_failed",
            crate::error::ErrorLocation::Path,
            "username",
            format!("Invalid username {}", username),
        ))
    }
}

/// Scopes match `^[A-Za-z0-9:._-]+$`.
pub fn is_valid_scope(scope: &str) -> bool {
    !scope.is_empty()
        && scope
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '_' | '-'))
}

fn validate_service(service: &str) -> Result<(), ApiError> {
    let valid = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::invalid_delegate_to(format!(
            "Invalid service name {}",
            service
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::crypto::SessionCipher;
    use crate::db::kv::MemoryStore;
    use crate::db::tokens::MemoryDatabase;
    use crate::models::token::Group;

    fn test_config() -> Arc<Config> {
        let mut known_scopes = std::collections::HashMap::new();
        for (scope, description) in [
            ("exec:admin", "Admin access"),
            ("read:all", "Read everything"),
            ("user:token", "Token management"),
        ] {
            known_scopes.insert(scope.to_string(), description.to_string());
        }
        Arc::new(Config {
            realm: "example.com".to_string(),
            loglevel: "debug".to_string(),
            session_secret: "test-session-secret".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            database_url: "postgresql://localhost/gafaelfawr".to_string(),
            bootstrap_token: None,
            token_lifetime: Duration::hours(23),
            expiry_sweep_minutes: 60,
            proxies: vec!["10.0.0.0/8".parse().unwrap()],
            after_logout_url: "https://example.com/".to_string(),
            allowed_return_hosts: vec![],
            known_scopes,
            group_mapping: std::collections::HashMap::new(),
            initial_admins: vec!["admin".to_string()],
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
        })
    }

    fn service() -> TokenService {
        let kv = Arc::new(MemoryStore::new());
        let cipher = SessionCipher::new("test-session-secret");
        TokenService::new(
            test_config(),
            Arc::new(MemoryDatabase::new()),
            TokenStore::new(kv, cipher),
        )
    }

    fn user() -> UserInfo {
        UserInfo {
            username: "rachel".to_string(),
            name: Some("Rachel".to_string()),
            email: Some("rachel@example.com".to_string()),
            uid: Some(4510),
            gid: None,
            groups: vec![Group {
                name: "admins".to_string(),
                id: Some(1000),
            }],
        }
    }

    fn scopes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn session_token_resolves_with_correct_secret_only() {
        let service = service();
        let data = service
            .create_session_token(&user(), scopes(&["read:all", "user:token"]), None)
            .await
            .unwrap();

        let resolved = service.resolve(&data.token).await.unwrap().unwrap();
        assert_eq!(resolved.username, "rachel");
        assert_eq!(resolved.scopes, vec!["read:all", "user:token"]);

        let forged = Token {
            key: data.token.key.clone(),
            secret: Token::generate().secret,
        };
        assert!(service.resolve(&forged).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resolve_rebuilds_redis_from_database() {
        let service = service();
        let data = service
            .create_session_token(&user(), scopes(&["read:all"]), None)
            .await
            .unwrap();

        // Simulate Redis loss.
        service.cache.delete(&data.token.key).await.unwrap();
        let resolved = service.resolve(&data.token).await.unwrap().unwrap();
        assert_eq!(resolved.username, data.username);
        assert_eq!(resolved.scopes, data.scopes);
        // The mirror is repopulated.
        assert!(service
            .cache
            .get(&data.token.key)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn notebook_token_is_deterministic() {
        let service = service();
        let parent = service
            .create_session_token(&user(), scopes(&["read:all", "user:token"]), None)
            .await
            .unwrap();

        let first = service.get_notebook_token(&parent, None).await.unwrap();
        let second = service.get_notebook_token(&parent, None).await.unwrap();
        assert_eq!(first, second);

        let data = service.resolve(&first).await.unwrap().unwrap();
        assert_eq!(data.token_type, TokenType::Notebook);
        assert_eq!(data.username, "rachel");
        assert_eq!(data.scopes, parent.scopes);
    }

    #[tokio::test]
    async fn internal_token_requires_scope_subset() {
        let service = service();
        let parent = service
            .create_session_token(&user(), scopes(&["read:all"]), None)
            .await
            .unwrap();

        let token = service
            .get_internal_token(&parent, "tap", scopes(&["read:all"]), None)
            .await
            .unwrap();
        let again = service
            .get_internal_token(&parent, "tap", scopes(&["read:all"]), None)
            .await
            .unwrap();
        assert_eq!(token, again);

        let err = service
            .get_internal_token(&parent, "tap", scopes(&["exec:admin"]), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, "permission_denied");
    }

    #[tokio::test]
    async fn internal_tokens_differ_by_service_and_scopes() {
        let service = service();
        let parent = service
            .create_session_token(&user(), scopes(&["exec:admin", "read:all"]), None)
            .await
            .unwrap();

        let tap = service
            .get_internal_token(&parent, "tap", scopes(&["read:all"]), None)
            .await
            .unwrap();
        let portal = service
            .get_internal_token(&parent, "portal", scopes(&["read:all"]), None)
            .await
            .unwrap();
        let tap_admin = service
            .get_internal_token(&parent, "tap", scopes(&["exec:admin"]), None)
            .await
            .unwrap();
        assert_ne!(tap.key, portal.key);
        assert_ne!(tap.key, tap_admin.key);
    }

    #[tokio::test]
    async fn derived_token_survives_redis_loss() {
        let service = service();
        let parent = service
            .create_session_token(&user(), scopes(&["read:all"]), None)
            .await
            .unwrap();
        let first = service.get_notebook_token(&parent, None).await.unwrap();

        service.cache.delete(&first.key).await.unwrap();
        let second = service.get_notebook_token(&parent, None).await.unwrap();
        // Same key, rotated secret, and the new token resolves.
        assert_eq!(first.key, second.key);
        assert!(service.resolve(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revoking_parent_revokes_descendants() {
        let service = service();
        let parent = service
            .create_session_token(&user(), scopes(&["read:all"]), None)
            .await
            .unwrap();
        let notebook = service.get_notebook_token(&parent, None).await.unwrap();
        let internal = service
            .get_internal_token(&parent, "tap", scopes(&["read:all"]), None)
            .await
            .unwrap();

        assert!(service
            .delete_token(&parent.token.key, "rachel", None)
            .await
            .unwrap());

        assert!(service.resolve(&parent.token).await.unwrap().is_none());
        assert!(service.resolve(&notebook).await.unwrap().is_none());
        assert!(service.resolve(&internal).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn user_token_names_are_unique_per_owner() {
        let service = service();
        let session = service
            .create_session_token(&user(), scopes(&["read:all", "user:token"]), None)
            .await
            .unwrap();

        service
            .create_user_token(&session, false, "rachel", "laptop", scopes(&["read:all"]), None, None)
            .await
            .unwrap();
        let err = service
            .create_user_token(&session, false, "rachel", "laptop", scopes(&["read:all"]), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, "duplicate_token_name");
    }

    #[tokio::test]
    async fn user_token_scopes_limited_to_actor_scopes() {
        let service = service();
        let session = service
            .create_session_token(&user(), scopes(&["user:token"]), None)
            .await
            .unwrap();

        let err = service
            .create_user_token(
                &session,
                false,
                "rachel",
                "laptop",
                scopes(&["exec:admin"]),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "permission_denied");

        // Admins may grant scopes they do not hold themselves.
        service
            .create_user_token(
                &session,
                true,
                "rachel",
                "laptop",
                scopes(&["exec:admin"]),
                None,
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expires_must_be_far_enough_out() {
        let service = service();
        let session = service
            .create_session_token(&user(), scopes(&["user:token"]), None)
            .await
            .unwrap();
        let err = service
            .create_user_token(
                &session,
                false,
                "rachel",
                "soon",
                scopes(&["user:token"]),
                Some(Utc::now() + Duration::seconds(60)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, "invalid_expires");
    }

    #[tokio::test]
    async fn expiry_sweep_revokes_and_is_idempotent() {
        let service = service();
        let session = service
            .create_session_token(&user(), scopes(&["user:token"]), None)
            .await
            .unwrap();
        // Force the token to be expired in the database.
        service
            .db
            .modify(
                &session.token.key,
                &TokenUpdate {
                    expires: Some(Some(Utc::now() - Duration::minutes(1))),
                    ..TokenUpdate::default()
                },
                &NewHistoryEntry {
                    token: session.token.key.clone(),
                    username: "rachel".to_string(),
                    token_type: TokenType::Session,
                    event: HistoryEvent::Edit,
                    actor: "rachel".to_string(),
                    ip_address: None,
                    event_time: Utc::now(),
                    old_values: None,
                    new_values: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(service.expire_tokens().await.unwrap(), 1);
        assert_eq!(service.expire_tokens().await.unwrap(), 0);
        assert!(service.resolve(&session.token).await.unwrap().is_none());
    }

    #[test]
    fn username_validation() {
        assert!(validate_username("rachel").is_ok());
        assert!(validate_username("_service").is_ok());
        assert!(validate_username("r2.d2-c3_po").is_ok());
        assert!(validate_username("Rachel").is_err());
        assert!(validate_username("1rachel").is_err());
        assert!(validate_username("<bootstrap>").is_err());
        assert!(validate_username(&"a".repeat(65)).is_err());
    }

    #[test]
    fn scope_validation() {
        assert!(is_valid_scope("exec:admin"));
        assert!(is_valid_scope("read.all_of-it"));
        assert!(!is_valid_scope(""));
        assert!(!is_valid_scope("exec admin"));
    }
}
