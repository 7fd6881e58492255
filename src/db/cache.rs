use std::sync::Arc;

use chrono::Utc;

use crate::auth::crypto::SessionCipher;
use crate::db::kv::KeyValueStore;
use crate::error::ApiError;
use crate::models::oidc::OidcAuthorization;
use crate::models::token::TokenData;

const TOKEN_PREFIX: &str = "token:";
const CODE_PREFIX: &str = "oidcauth:";

/// Extra TTL on top of the token expiry so that in-flight requests near the
/// deadline still see the entry; expiry is enforced on read regardless.
const TTL_GRACE_SECS: u64 = 30;

/// Encrypted mirror of token data in the key-value store.
///
/// The primary lookup path for `/auth`. Values are AES-256-GCM sealed JSON
/// keyed by the session secret, under `token:<key>`. Undecryptable or
/// unparsable entries are logged and treated as absent; the caller falls
/// back to the database of record.
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KeyValueStore>,
    cipher: SessionCipher,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, cipher: SessionCipher) -> Self {
        Self { kv, cipher }
    }

    pub async fn get(&self, key: &str) -> Result<Option<TokenData>, ApiError> {
        let blob = match self.kv.get(&format!("{}{}", TOKEN_PREFIX, key)).await? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        match self
            .cipher
            .open(&blob)
            .and_then(|plain| serde_json::from_slice::<TokenData>(&plain).ok())
        {
            Some(data) => Ok(Some(data)),
            None => {
                tracing::warn!(token = key, "undecryptable token data, treating as missing");
                Ok(None)
            }
        }
    }

    pub async fn store(&self, data: &TokenData) -> Result<(), ApiError> {
        let plain = serde_json::to_vec(data).map_err(|e| {
            tracing::error!(?e, "token data serialization failed");
            ApiError::internal("An internal error occurred")
        })?;
        let blob = self.cipher.seal(&plain);
        let ttl = data.expires.map(|expires| {
            let remaining = (expires - Utc::now()).num_seconds().max(0) as u64;
            remaining + TTL_GRACE_SECS
        });
        self.kv
            .set(&format!("{}{}", TOKEN_PREFIX, data.token.key), &blob, ttl)
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<(), ApiError> {
        self.kv.del(&format!("{}{}", TOKEN_PREFIX, key)).await
    }

    /// Remove every stored token. Used by the delete-all-tokens
    /// administrative flow.
    pub async fn delete_all(&self) -> Result<u64, ApiError> {
        self.kv.del_prefix(TOKEN_PREFIX).await
    }
}

/// Encrypted store of one-shot OIDC authorization codes.
#[derive(Clone)]
pub struct CodeStore {
    kv: Arc<dyn KeyValueStore>,
    cipher: SessionCipher,
}

impl CodeStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, cipher: SessionCipher) -> Self {
        Self { kv, cipher }
    }

    pub async fn store(
        &self,
        authorization: &OidcAuthorization,
        lifetime_secs: u64,
    ) -> Result<(), ApiError> {
        let plain = serde_json::to_vec(authorization).map_err(|e| {
            tracing::error!(?e, "authorization serialization failed");
            ApiError::internal("An internal error occurred")
        })?;
        let blob = self.cipher.seal(&plain);
        self.kv
            .set(
                &format!("{}{}", CODE_PREFIX, authorization.code.key),
                &blob,
                Some(lifetime_secs),
            )
            .await
    }

    /// Consume a code atomically. A second call for the same key returns
    /// `None`, which is what makes redemption single-use.
    pub async fn consume(&self, key: &str) -> Result<Option<OidcAuthorization>, ApiError> {
        let blob = match self.kv.get_del(&format!("{}{}", CODE_PREFIX, key)).await? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        match self
            .cipher
            .open(&blob)
            .and_then(|plain| serde_json::from_slice(&plain).ok())
        {
            Some(authorization) => Ok(Some(authorization)),
            None => {
                tracing::warn!(code = key, "undecryptable authorization code");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::Token;
    use crate::db::kv::MemoryStore;
    use crate::models::token::TokenType;
    use chrono::Duration;

    fn store() -> TokenStore {
        TokenStore::new(
            Arc::new(MemoryStore::new()),
            SessionCipher::new("test-secret"),
        )
    }

    fn data() -> TokenData {
        TokenData {
            token: Token::generate(),
            username: "rachel".to_string(),
            token_type: TokenType::Session,
            scopes: vec!["read:all".to_string(), "user:token".to_string()],
            created: Utc::now(),
            expires: Some(Utc::now() + Duration::hours(1)),
            name: None,
            email: Some("rachel@example.com".to_string()),
            uid: Some(4510),
            gid: None,
            groups: None,
        }
    }

    #[tokio::test]
    async fn store_and_get_round_trip() {
        let store = store();
        let data = data();
        store.store(&data).await.unwrap();
        let back = store.get(&data.token.key).await.unwrap().unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn get_with_wrong_cipher_is_a_miss() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let writer = TokenStore::new(kv.clone(), SessionCipher::new("old-secret"));
        let reader = TokenStore::new(kv, SessionCipher::new("new-secret"));
        let data = data();
        writer.store(&data).await.unwrap();
        assert!(reader.get(&data.token.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_all_clears_only_tokens() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        kv.set("unrelated", "x", None).await.unwrap();
        let store = TokenStore::new(kv.clone(), SessionCipher::new("s"));
        let data = data();
        store.store(&data).await.unwrap();
        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert_eq!(kv.get("unrelated").await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test]
    async fn code_consume_is_single_use() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let codes = CodeStore::new(kv, SessionCipher::new("s"));
        let authorization = OidcAuthorization {
            code: Token::generate(),
            client_id: "app".to_string(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            token: Token::generate(),
            nonce: None,
            scope: "openid".to_string(),
            created: Utc::now(),
        };
        codes.store(&authorization, 3600).await.unwrap();
        let first = codes.consume(&authorization.code.key).await.unwrap();
        assert_eq!(first, Some(authorization.clone()));
        let second = codes.consume(&authorization.code.key).await.unwrap();
        assert_eq!(second, None);
    }
}
