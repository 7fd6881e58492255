use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ldap3::{ldap_escape, LdapConnAsync, Scope, SearchEntry};
use tokio::sync::{Mutex, RwLock};

use crate::config::LdapConfig;
use crate::error::ApiError;
use crate::models::token::Group;

/// Timeout for each LDAP operation.
const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// LDAP group lookups with a per-username cache and single-flight.
///
/// Group membership is resolved by a posixGroup search on `memberUid` and
/// cached for the configured TTL. Concurrent cache misses for the same
/// username share one lookup: the first caller holds that username's flight
/// lock while it queries, and the others find the fresh cache entry once
/// they acquire it.
pub struct LdapGroupResolver {
    config: LdapConfig,
    cache: RwLock<HashMap<String, (Instant, Vec<Group>)>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LdapGroupResolver {
    pub fn new(config: LdapConfig) -> Self {
        Self {
            config,
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The user's groups, from cache or LDAP.
    pub async fn groups(&self, username: &str) -> Result<Vec<Group>, ApiError> {
        if let Some(groups) = self.cached(username).await {
            return Ok(groups);
        }

        let flight = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(username.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Another waiter may have completed the lookup while this one was
        // queued on the flight lock.
        if let Some(groups) = self.cached(username).await {
            return Ok(groups);
        }

        let result = self.lookup(username).await;
        if let Ok(ref groups) = result {
            self.cache
                .write()
                .await
                .insert(username.to_string(), (Instant::now(), groups.clone()));
        }

        let mut inflight = self.inflight.lock().await;
        inflight.remove(username);
        drop(inflight);

        result
    }

    async fn cached(&self, username: &str) -> Option<Vec<Group>> {
        let cache = self.cache.read().await;
        let (fetched_at, groups) = cache.get(username)?;
        if fetched_at.elapsed() < self.config.cache_ttl {
            Some(groups.clone())
        } else {
            None
        }
    }

    async fn lookup(&self, username: &str) -> Result<Vec<Group>, ApiError> {
        let (conn, mut ldap) = LdapConnAsync::new(&self.config.url).await?;
        ldap3::drive!(conn);
        ldap.with_timeout(OP_TIMEOUT);

        ldap.simple_bind(&self.config.user_dn, &self.config.password)
            .await?
            .success()?;

        let filter = format!(
            "(&(objectClass=posixGroup)(memberUid={}))",
            ldap_escape(username)
        );
        ldap.with_timeout(OP_TIMEOUT);
        let (entries, _result) = ldap
            .search(
                &self.config.group_base_dn,
                Scope::Subtree,
                &filter,
                vec!["cn", "gidNumber"],
            )
            .await?
            .success()?;

        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = SearchEntry::construct(entry);
            let Some(name) = entry.attrs.get("cn").and_then(|v| v.first()) else {
                continue;
            };
            let id = entry
                .attrs
                .get("gidNumber")
                .and_then(|v| v.first())
                .and_then(|v| v.parse().ok());
            groups.push(Group {
                name: name.clone(),
                id,
            });
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        ldap.unbind().await.ok();

        tracing::debug!(username, count = groups.len(), "LDAP groups resolved");
        Ok(groups)
    }
}
