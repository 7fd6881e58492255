use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;

use crate::db::pool::DbPool;
use crate::db::schema::{admins, token_change_history, tokens};
use crate::error::ApiError;
use crate::models::admin::Admin;
use crate::models::history::{
    HistoryCursor, HistoryEntry, HistoryEvent, HistoryQuery, HistoryRow, NewHistoryEntry,
    NewHistoryRow, PaginatedHistory,
};
use crate::models::token::{NewTokenRow, TokenRecord, TokenRow, TokenType};

/// Result of inserting a deterministically-keyed derived token.
#[derive(Debug)]
pub enum DerivedOutcome {
    /// This writer created the row.
    Created,
    /// Another writer got there first; here is its row.
    Existing(TokenRecord),
}

/// Changes to apply to a token. Fields left `None` are unchanged.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub token_name: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub expires: Option<Option<DateTime<Utc>>>,
}

/// The relational system of record for tokens, history, and admins.
///
/// Backed by Postgres in production and an in-memory map in tests. Every
/// mutation that touches more than one row runs in a single transaction;
/// Redis mirror updates happen after commit in the service layer.
#[async_trait]
pub trait TokenDatabase: Send + Sync {
    /// Insert a new token and its `create` history entry.
    ///
    /// Fails with `duplicate_token_name` if a user token with the same
    /// (owner, name) already exists.
    async fn add(&self, record: &TokenRecord, history: &NewHistoryEntry) -> Result<(), ApiError>;

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>, ApiError>;

    async fn get_by_name(
        &self,
        username: &str,
        token_name: &str,
    ) -> Result<Option<TokenRecord>, ApiError>;

    /// All live tokens belonging to a user, newest first.
    async fn list_for_user(&self, username: &str) -> Result<Vec<TokenRecord>, ApiError>;

    /// Apply an update and record an `edit` history entry. Returns the
    /// updated record, or `None` if the token does not exist.
    async fn modify(
        &self,
        key: &str,
        update: &TokenUpdate,
        history: &NewHistoryEntry,
    ) -> Result<Option<TokenRecord>, ApiError>;

    /// Revoke a token and every descendant in one transaction, writing a
    /// `revoke` history entry per token. Returns the revoked keys so the
    /// caller can clear the Redis mirror.
    async fn revoke_cascade(
        &self,
        key: &str,
        actor: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ApiError>;

    /// Insert a derived token whose key is deterministic. The unique key
    /// constraint is the serialization point: the losing writer of a race
    /// receives the winner's row.
    async fn add_derived(
        &self,
        record: &TokenRecord,
        history: &NewHistoryEntry,
    ) -> Result<DerivedOutcome, ApiError>;

    /// Refresh a derived token in place: rotate the stored secret hash,
    /// reset the expiry, and clear the revoked flag. The key, and therefore
    /// the derivation identity, is unchanged.
    async fn refresh_derived(
        &self,
        key: &str,
        secret_hash: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError>;

    /// Mark every expired, unrevoked token revoked, writing an `expire`
    /// history entry each. Rows are never deleted, so the audit trail stays
    /// queryable; the revoked flag keeps the sweep idempotent.
    async fn expire_tokens(&self, now: DateTime<Utc>) -> Result<Vec<String>, ApiError>;

    async fn history(&self, query: &HistoryQuery) -> Result<PaginatedHistory, ApiError>;

    async fn list_admins(&self) -> Result<Vec<Admin>, ApiError>;
    async fn is_admin(&self, username: &str) -> Result<bool, ApiError>;
    /// Returns false if the username was already an admin.
    async fn add_admin(&self, username: &str) -> Result<bool, ApiError>;
    /// Returns false if the username was not an admin.
    async fn delete_admin(&self, username: &str) -> Result<bool, ApiError>;
    async fn count_admins(&self) -> Result<i64, ApiError>;
}

fn expire_entry(record: &TokenRecord, now: DateTime<Utc>) -> NewHistoryEntry {
    NewHistoryEntry {
        token: record.key.clone(),
        username: record.username.clone(),
        token_type: record.token_type,
        event: HistoryEvent::Expire,
        actor: crate::models::admin::BOOTSTRAP_ACTOR.to_string(),
        ip_address: None,
        event_time: now,
        old_values: None,
        new_values: None,
    }
}

fn revoke_entry(
    record: &TokenRecord,
    actor: &str,
    ip_address: Option<&str>,
    now: DateTime<Utc>,
) -> NewHistoryEntry {
    NewHistoryEntry {
        token: record.key.clone(),
        username: record.username.clone(),
        token_type: record.token_type,
        event: HistoryEvent::Revoke,
        actor: actor.to_string(),
        ip_address: ip_address.map(str::to_string),
        event_time: now,
        old_values: None,
        new_values: None,
    }
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgDatabase {
    pool: DbPool,
}

impl PgDatabase {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Unique violations on token inserts mean a duplicate user token name; the
/// key column cannot collide because keys carry 128 bits of entropy or are
/// handled via `ON CONFLICT` in `add_derived`.
fn map_unique_violation(err: diesel::result::Error) -> ApiError {
    match err {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        ) => ApiError::duplicate_token_name("Token name already in use"),
        err => err.into(),
    }
}

type HistoryPredicate = Box<
    dyn BoxableExpression<
        token_change_history::table,
        diesel::pg::Pg,
        SqlType = diesel::sql_types::Bool,
    >,
>;

/// Build the WHERE clause for a history query as a boxed expression so the
/// same filters feed both the count and the page queries.
fn history_predicate(query: &HistoryQuery) -> HistoryPredicate {
    let mut predicate: HistoryPredicate =
        Box::new(diesel::dsl::sql::<diesel::sql_types::Bool>("TRUE"));
    if let Some(ref token) = query.token {
        predicate = Box::new(predicate.and(token_change_history::token_key.eq(token.clone())));
    }
    if let Some(ref username) = query.username {
        predicate = Box::new(predicate.and(token_change_history::username.eq(username.clone())));
    }
    if let Some(since) = query.since {
        predicate = Box::new(predicate.and(token_change_history::event_time.ge(since)));
    }
    if let Some(until) = query.until {
        predicate = Box::new(predicate.and(token_change_history::event_time.le(until)));
    }
    predicate
}

#[async_trait]
impl TokenDatabase for PgDatabase {
    async fn add(&self, record: &TokenRecord, history: &NewHistoryEntry) -> Result<(), ApiError> {
        let mut conn = self.pool.get().await?;
        let row = NewTokenRow::from(record);
        let entry = NewHistoryRow::from(history);
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                diesel::insert_into(tokens::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(token_change_history::table)
                    .values(&entry)
                    .execute(conn)
                    .await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await
        .map_err(map_unique_violation)
    }

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>, ApiError> {
        let mut conn = self.pool.get().await?;
        let row: Option<TokenRow> = tokens::table
            .find(key)
            .select(TokenRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(TokenRow::into_record))
    }

    async fn get_by_name(
        &self,
        username: &str,
        token_name: &str,
    ) -> Result<Option<TokenRecord>, ApiError> {
        let mut conn = self.pool.get().await?;
        let row: Option<TokenRow> = tokens::table
            .filter(tokens::username.eq(username))
            .filter(tokens::token_name.eq(token_name))
            .filter(tokens::token_type.eq(TokenType::User.as_str()))
            .filter(tokens::revoked.eq(false))
            .select(TokenRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(TokenRow::into_record))
    }

    async fn list_for_user(&self, username: &str) -> Result<Vec<TokenRecord>, ApiError> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<TokenRow> = tokens::table
            .filter(tokens::username.eq(username))
            .filter(tokens::revoked.eq(false))
            .order((tokens::created.desc(), tokens::key.desc()))
            .select(TokenRow::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows.into_iter().map(TokenRow::into_record).collect())
    }

    async fn modify(
        &self,
        key: &str,
        update: &TokenUpdate,
        history: &NewHistoryEntry,
    ) -> Result<Option<TokenRecord>, ApiError> {
        let mut conn = self.pool.get().await?;
        let key = key.to_string();
        let update = update.clone();
        let entry = NewHistoryRow::from(history);
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            async move {
                let row: Option<TokenRow> = tokens::table
                    .find(&key)
                    .select(TokenRow::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let mut record = row.into_record();
                if let Some(ref name) = update.token_name {
                    record.token_name = Some(name.clone());
                }
                if let Some(ref scopes) = update.scopes {
                    record.scopes = scopes.clone();
                }
                if let Some(expires) = update.expires {
                    record.expires = expires;
                }
                diesel::update(tokens::table.find(&key))
                    .set((
                        tokens::token_name.eq(record.token_name.clone()),
                        tokens::scopes.eq(record.scopes.clone()),
                        tokens::expires.eq(record.expires),
                    ))
                    .execute(conn)
                    .await?;
                diesel::insert_into(token_change_history::table)
                    .values(&entry)
                    .execute(conn)
                    .await?;
                Ok(Some(record))
            }
            .scope_boxed()
        })
        .await
        .map_err(map_unique_violation)
    }

    async fn revoke_cascade(
        &self,
        key: &str,
        actor: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ApiError> {
        let mut conn = self.pool.get().await?;
        let key = key.to_string();
        let actor = actor.to_string();
        let ip_address = ip_address.map(str::to_string);
        Ok(conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let root: Option<TokenRow> = tokens::table
                        .find(&key)
                        .select(TokenRow::as_select())
                        .for_update()
                        .first(conn)
                        .await
                        .optional()?;
                    let Some(root) = root else {
                        return Ok(Vec::new());
                    };
                    if root.revoked {
                        return Ok(Vec::new());
                    }
                    // Descendants via iterative BFS; parent edges cannot form
                    // cycles because derived keys are hashes of parent keys.
                    let mut records = vec![root.into_record()];
                    let mut frontier = vec![key.clone()];
                    while !frontier.is_empty() {
                        let children: Vec<TokenRow> = tokens::table
                            .filter(tokens::parent.eq_any(&frontier))
                            .filter(tokens::revoked.eq(false))
                            .select(TokenRow::as_select())
                            .for_update()
                            .load(conn)
                            .await?;
                        frontier = children.iter().map(|c| c.key.clone()).collect();
                        records.extend(children.into_iter().map(TokenRow::into_record));
                    }
                    let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
                    diesel::update(tokens::table.filter(tokens::key.eq_any(&keys)))
                        .set(tokens::revoked.eq(true))
                        .execute(conn)
                        .await?;
                    let entries: Vec<NewHistoryRow> = records
                        .iter()
                        .map(|r| NewHistoryRow::from(&revoke_entry(r, &actor, ip_address.as_deref(), now)))
                        .collect();
                    diesel::insert_into(token_change_history::table)
                        .values(entries)
                        .execute(conn)
                        .await?;
                    Ok(keys)
                }
                .scope_boxed()
            })
            .await?)
    }

    async fn add_derived(
        &self,
        record: &TokenRecord,
        history: &NewHistoryEntry,
    ) -> Result<DerivedOutcome, ApiError> {
        let mut conn = self.pool.get().await?;
        let row = NewTokenRow::from(record);
        let entry = NewHistoryRow::from(history);
        Ok(conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let inserted = diesel::insert_into(tokens::table)
                        .values(&row)
                        .on_conflict(tokens::key)
                        .do_nothing()
                        .execute(conn)
                        .await?;
                    if inserted == 0 {
                        let existing: TokenRow = tokens::table
                            .find(&row.key)
                            .select(TokenRow::as_select())
                            .first(conn)
                            .await?;
                        return Ok(DerivedOutcome::Existing(existing.into_record()));
                    }
                    diesel::insert_into(token_change_history::table)
                        .values(&entry)
                        .execute(conn)
                        .await?;
                    Ok(DerivedOutcome::Created)
                }
                .scope_boxed()
            })
            .await?)
    }

    async fn refresh_derived(
        &self,
        key: &str,
        secret_hash: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let mut conn = self.pool.get().await?;
        diesel::update(tokens::table.find(key))
            .set((
                tokens::secret_hash.eq(secret_hash),
                tokens::expires.eq(expires),
                tokens::revoked.eq(false),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn expire_tokens(&self, now: DateTime<Utc>) -> Result<Vec<String>, ApiError> {
        let mut conn = self.pool.get().await?;
        Ok(conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let rows: Vec<TokenRow> = tokens::table
                        .filter(tokens::expires.is_not_null())
                        .filter(tokens::expires.le(now))
                        .filter(tokens::revoked.eq(false))
                        .select(TokenRow::as_select())
                        .for_update()
                        .load(conn)
                        .await?;
                    if rows.is_empty() {
                        return Ok(Vec::new());
                    }
                    let records: Vec<TokenRecord> =
                        rows.into_iter().map(TokenRow::into_record).collect();
                    let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
                    diesel::update(tokens::table.filter(tokens::key.eq_any(&keys)))
                        .set(tokens::revoked.eq(true))
                        .execute(conn)
                        .await?;
                    let entries: Vec<NewHistoryRow> = records
                        .iter()
                        .map(|r| NewHistoryRow::from(&expire_entry(r, now)))
                        .collect();
                    diesel::insert_into(token_change_history::table)
                        .values(entries)
                        .execute(conn)
                        .await?;
                    Ok(keys)
                }
                .scope_boxed()
            })
            .await?)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<PaginatedHistory, ApiError> {
        let mut conn = self.pool.get().await?;
        let count: i64 = token_change_history::table
            .filter(history_predicate(query))
            .count()
            .get_result(&mut conn)
            .await?;

        let limit = query.limit as i64;
        let (entries, prev_cursor, next_cursor) = match query.cursor {
            Some(cursor) if cursor.previous => {
                // Page of entries newer than the cursor, fetched ascending
                // and flipped back to descending order.
                let predicate: HistoryPredicate = Box::new(history_predicate(query).and(
                    token_change_history::event_time.gt(cursor.time).or(
                        token_change_history::event_time
                            .eq(cursor.time)
                            .and(token_change_history::id.gt(cursor.id)),
                    ),
                ));
                let rows: Vec<HistoryRow> = token_change_history::table
                    .filter(predicate)
                    .order((
                        token_change_history::event_time.asc(),
                        token_change_history::id.asc(),
                    ))
                    .limit(limit + 1)
                    .select(HistoryRow::as_select())
                    .load(&mut conn)
                    .await?;
                let more_newer = rows.len() as i64 > limit;
                let mut entries: Vec<HistoryEntry> = rows
                    .into_iter()
                    .take(query.limit)
                    .map(HistoryRow::into_entry)
                    .collect();
                entries.reverse();
                let prev = if more_newer {
                    <[HistoryEntry]>::first(&entries).map(|e| HistoryCursor {
                        time: e.event_time,
                        id: e.id,
                        previous: true,
                    })
                } else {
                    None
                };
                (entries, prev, Some(cursor.invert()))
            }
            cursor => {
                let mut predicate = history_predicate(query);
                if let Some(cursor) = cursor {
                    predicate = Box::new(predicate.and(
                        token_change_history::event_time.lt(cursor.time).or(
                            token_change_history::event_time
                                .eq(cursor.time)
                                .and(token_change_history::id.le(cursor.id)),
                        ),
                    ));
                }
                let rows: Vec<HistoryRow> = token_change_history::table
                    .filter(predicate)
                    .order((
                        token_change_history::event_time.desc(),
                        token_change_history::id.desc(),
                    ))
                    .limit(limit + 1)
                    .select(HistoryRow::as_select())
                    .load(&mut conn)
                    .await?;
                let next = rows.get(query.limit).map(|row| HistoryCursor {
                    time: row.event_time,
                    id: row.id,
                    previous: false,
                });
                let entries: Vec<HistoryEntry> = rows
                    .into_iter()
                    .take(query.limit)
                    .map(HistoryRow::into_entry)
                    .collect();
                (entries, cursor.map(HistoryCursor::invert), next)
            }
        };

        Ok(PaginatedHistory {
            entries,
            count,
            prev_cursor,
            next_cursor,
        })
    }

    async fn list_admins(&self) -> Result<Vec<Admin>, ApiError> {
        let mut conn = self.pool.get().await?;
        Ok(admins::table
            .order(admins::username.asc())
            .select(Admin::as_select())
            .load(&mut conn)
            .await?)
    }

    async fn is_admin(&self, username: &str) -> Result<bool, ApiError> {
        let mut conn = self.pool.get().await?;
        let count: i64 = admins::table
            .filter(admins::username.eq(username))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn add_admin(&self, username: &str) -> Result<bool, ApiError> {
        let mut conn = self.pool.get().await?;
        let inserted = diesel::insert_into(admins::table)
            .values(admins::username.eq(username))
            .on_conflict(admins::username)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn delete_admin(&self, username: &str) -> Result<bool, ApiError> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel::delete(admins::table.filter(admins::username.eq(username)))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn count_admins(&self) -> Result<i64, ApiError> {
        let mut conn = self.pool.get().await?;
        Ok(admins::table.count().get_result(&mut conn).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    tokens: HashMap<String, TokenRecord>,
    history: Vec<HistoryEntry>,
    admins: BTreeSet<String>,
    next_history_id: i64,
}

pub struct MemoryDatabase {
    inner: Mutex<MemoryInner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                next_history_id: 1,
                ..MemoryInner::default()
            }),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryInner {
    fn push_history(&mut self, entry: &NewHistoryEntry) {
        let id = self.next_history_id;
        self.next_history_id += 1;
        self.history.push(HistoryEntry {
            id,
            token: entry.token.clone(),
            username: entry.username.clone(),
            token_type: entry.token_type,
            event: entry.event,
            actor: entry.actor.clone(),
            ip_address: entry.ip_address.clone(),
            event_time: entry.event_time,
            old_values: entry.old_values.clone(),
            new_values: entry.new_values.clone(),
        });
    }

    fn has_duplicate_name(&self, record: &TokenRecord) -> bool {
        record.token_type == TokenType::User
            && record.token_name.is_some()
            && self.tokens.values().any(|t| {
                !t.revoked
                    && t.key != record.key
                    && t.token_type == TokenType::User
                    && t.username == record.username
                    && t.token_name == record.token_name
            })
    }
}

#[async_trait]
impl TokenDatabase for MemoryDatabase {
    async fn add(&self, record: &TokenRecord, history: &NewHistoryEntry) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.has_duplicate_name(record) {
            return Err(ApiError::duplicate_token_name("Token name already in use"));
        }
        inner.tokens.insert(record.key.clone(), record.clone());
        inner.push_history(history);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<TokenRecord>, ApiError> {
        Ok(self.inner.lock().unwrap().tokens.get(key).cloned())
    }

    async fn get_by_name(
        &self,
        username: &str,
        token_name: &str,
    ) -> Result<Option<TokenRecord>, ApiError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tokens
            .values()
            .find(|t| {
                !t.revoked
                    && t.token_type == TokenType::User
                    && t.username == username
                    && t.token_name.as_deref() == Some(token_name)
            })
            .cloned())
    }

    async fn list_for_user(&self, username: &str) -> Result<Vec<TokenRecord>, ApiError> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<TokenRecord> = inner
            .tokens
            .values()
            .filter(|t| !t.revoked && t.username == username)
            .cloned()
            .collect();
        records.sort_by(|a, b| (b.created, &b.key).cmp(&(a.created, &a.key)));
        Ok(records)
    }

    async fn modify(
        &self,
        key: &str,
        update: &TokenUpdate,
        history: &NewHistoryEntry,
    ) -> Result<Option<TokenRecord>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut record) = inner.tokens.get(key).cloned() else {
            return Ok(None);
        };
        if let Some(ref name) = update.token_name {
            record.token_name = Some(name.clone());
        }
        if let Some(ref scopes) = update.scopes {
            record.scopes = scopes.clone();
        }
        if let Some(expires) = update.expires {
            record.expires = expires;
        }
        if inner.has_duplicate_name(&record) {
            return Err(ApiError::duplicate_token_name("Token name already in use"));
        }
        inner.tokens.insert(key.to_string(), record.clone());
        inner.push_history(history);
        Ok(Some(record))
    }

    async fn revoke_cascade(
        &self,
        key: &str,
        actor: &str,
        ip_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tokens.get(key) {
            Some(record) if !record.revoked => {}
            _ => return Ok(Vec::new()),
        }
        let mut keys = vec![key.to_string()];
        let mut frontier = vec![key.to_string()];
        while !frontier.is_empty() {
            let children: Vec<String> = inner
                .tokens
                .values()
                .filter(|t| {
                    !t.revoked
                        && t.parent
                            .as_ref()
                            .map(|p| frontier.contains(p))
                            .unwrap_or(false)
                })
                .map(|t| t.key.clone())
                .collect();
            keys.extend(children.clone());
            frontier = children;
        }
        for key in &keys {
            if let Some(record) = inner.tokens.get_mut(key) {
                record.revoked = true;
            }
            let record = inner.tokens.get(key).cloned().unwrap();
            inner.push_history(&revoke_entry(&record, actor, ip_address, now));
        }
        Ok(keys)
    }

    async fn add_derived(
        &self,
        record: &TokenRecord,
        history: &NewHistoryEntry,
    ) -> Result<DerivedOutcome, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.tokens.get(&record.key) {
            return Ok(DerivedOutcome::Existing(existing.clone()));
        }
        inner.tokens.insert(record.key.clone(), record.clone());
        inner.push_history(history);
        Ok(DerivedOutcome::Created)
    }

    async fn refresh_derived(
        &self,
        key: &str,
        secret_hash: &str,
        expires: Option<DateTime<Utc>>,
    ) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.tokens.get_mut(key) {
            record.secret_hash = secret_hash.to_string();
            record.expires = expires;
            record.revoked = false;
        }
        Ok(())
    }

    async fn expire_tokens(&self, now: DateTime<Utc>) -> Result<Vec<String>, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<TokenRecord> = inner
            .tokens
            .values()
            .filter(|t| !t.revoked && t.is_expired(now))
            .cloned()
            .collect();
        let mut keys = Vec::with_capacity(expired.len());
        for record in expired {
            if let Some(entry) = inner.tokens.get_mut(&record.key) {
                entry.revoked = true;
            }
            inner.push_history(&expire_entry(&record, now));
            keys.push(record.key);
        }
        Ok(keys)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<PaginatedHistory, ApiError> {
        let inner = self.inner.lock().unwrap();
        let mut matching: Vec<HistoryEntry> = inner
            .history
            .iter()
            .filter(|e| {
                query.token.as_ref().map(|t| &e.token == t).unwrap_or(true)
                    && query
                        .username
                        .as_ref()
                        .map(|u| &e.username == u)
                        .unwrap_or(true)
                    && query.since.map(|s| e.event_time >= s).unwrap_or(true)
                    && query.until.map(|u| e.event_time <= u).unwrap_or(true)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.event_time, b.id).cmp(&(a.event_time, a.id)));
        let count = matching.len() as i64;

        let (entries, prev_cursor, next_cursor) = match query.cursor {
            Some(cursor) if cursor.previous => {
                let mut newer: Vec<HistoryEntry> = matching
                    .into_iter()
                    .filter(|e| (e.event_time, e.id) > (cursor.time, cursor.id))
                    .collect();
                // Closest to the cursor first.
                newer.reverse();
                let more_newer = newer.len() > query.limit;
                let mut entries: Vec<HistoryEntry> =
                    newer.into_iter().take(query.limit).collect();
                entries.reverse();
                let prev = if more_newer {
                    <[HistoryEntry]>::first(&entries).map(|e| HistoryCursor {
                        time: e.event_time,
                        id: e.id,
                        previous: true,
                    })
                } else {
                    None
                };
                (entries, prev, Some(cursor.invert()))
            }
            cursor => {
                let filtered: Vec<HistoryEntry> = match cursor {
                    Some(c) => matching
                        .into_iter()
                        .filter(|e| (e.event_time, e.id) <= (c.time, c.id))
                        .collect(),
                    None => matching,
                };
                let next = filtered.get(query.limit).map(|e| HistoryCursor {
                    time: e.event_time,
                    id: e.id,
                    previous: false,
                });
                let entries: Vec<HistoryEntry> =
                    filtered.into_iter().take(query.limit).collect();
                (entries, cursor.map(HistoryCursor::invert), next)
            }
        };

        Ok(PaginatedHistory {
            entries,
            count,
            prev_cursor,
            next_cursor,
        })
    }

    async fn list_admins(&self) -> Result<Vec<Admin>, ApiError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .admins
            .iter()
            .map(|username| Admin {
                username: username.clone(),
            })
            .collect())
    }

    async fn is_admin(&self, username: &str) -> Result<bool, ApiError> {
        Ok(self.inner.lock().unwrap().admins.contains(username))
    }

    async fn add_admin(&self, username: &str) -> Result<bool, ApiError> {
        Ok(self.inner.lock().unwrap().admins.insert(username.to_string()))
    }

    async fn delete_admin(&self, username: &str) -> Result<bool, ApiError> {
        Ok(self.inner.lock().unwrap().admins.remove(username))
    }

    async fn count_admins(&self) -> Result<i64, ApiError> {
        Ok(self.inner.lock().unwrap().admins.len() as i64)
    }
}
