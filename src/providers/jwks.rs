//! JWKS client for fetching and caching an issuer's RSA public keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::ApiError;

/// How long to cache JWKS before re-fetching.
const CACHE_TTL: Duration = Duration::from_secs(600);

/// A cached set of decoding keys fetched from an issuer's JWKS endpoint.
#[derive(Clone)]
pub struct JwksClient {
    jwks_uri: String,
    http: reqwest::Client,
    cache: Arc<RwLock<JwksCache>>,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

impl JwksClient {
    pub fn new(jwks_uri: &str, http: reqwest::Client) -> Self {
        Self {
            jwks_uri: jwks_uri.to_string(),
            http,
            cache: Arc::new(RwLock::new(JwksCache {
                keys: HashMap::new(),
                fetched_at: None,
            })),
        }
    }

    /// For tests: create a client pre-loaded with a known key.
    pub fn with_static_key(kid: &str, decoding_key: DecodingKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(kid.to_string(), decoding_key);
        Self {
            jwks_uri: String::new(),
            http: reqwest::Client::new(),
            cache: Arc::new(RwLock::new(JwksCache {
                keys,
                // Set fetched_at far in the future so it never expires in tests.
                fetched_at: Some(Instant::now() + Duration::from_secs(86400)),
            })),
        }
    }

    /// Get the decoding key for a given `kid`. Fetches or re-fetches the
    /// JWKS as needed; an unknown kid after a fresh fetch is an
    /// authentication failure, not an infrastructure error.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, ApiError> {
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.keys.get(kid) {
                if cache_is_fresh(&cache) {
                    return Ok(key.clone());
                }
            }
        }

        self.refresh().await?;

        let cache = self.cache.read().await;
        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| ApiError::permission_denied("Unknown signing key"))
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        tracing::info!(url = %self.jwks_uri, "fetching issuer JWKS");

        let resp: JwksResponse = self
            .http
            .get(&self.jwks_uri)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(?e, "JWKS fetch failed");
                ApiError::internal("Failed to fetch issuer JWKS")
            })?
            .json()
            .await
            .map_err(|e| {
                tracing::error!(?e, "JWKS parse failed");
                ApiError::internal("Failed to parse issuer JWKS")
            })?;

        let mut keys = HashMap::new();
        for entry in resp.keys {
            if entry.kty != "RSA" {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (entry.kid, entry.n, entry.e) else {
                continue;
            };
            let decoding = DecodingKey::from_rsa_components(&n, &e).map_err(|err| {
                tracing::error!(?err, %kid, "bad JWKS key components");
                ApiError::internal("Invalid JWKS key encoding")
            })?;
            keys.insert(kid, decoding);
        }

        let mut cache = self.cache.write().await;
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());

        Ok(())
    }
}

fn cache_is_fresh(cache: &JwksCache) -> bool {
    match cache.fetched_at {
        Some(t) => Instant::now().saturating_duration_since(t) < CACHE_TTL,
        None => false,
    }
}
