use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::auth::token::Token;
use crate::db::schema::tokens;

/// Type of a token, determining its derivation and naming rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Top-level token bound to a browser session, created at login.
    Session,
    /// User-named long-lived token.
    User,
    /// Derived token for interactive compute, deterministic per parent.
    Notebook,
    /// Derived token delegated to a downstream service.
    Internal,
    /// Token for an internal service account (bootstrap actor).
    Service,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Session => "session",
            TokenType::User => "user",
            TokenType::Notebook => "notebook",
            TokenType::Internal => "internal",
            TokenType::Service => "service",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "session" => Some(TokenType::Session),
            "user" => Some(TokenType::User),
            "notebook" => Some(TokenType::Notebook),
            "internal" => Some(TokenType::Internal),
            "service" => Some(TokenType::Service),
            _ => None,
        }
    }
}

/// A group membership attached to a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

/// Everything attached to a token, as stored (encrypted) in Redis.
///
/// This is the resolution result for the `/auth` hot path. The embedded
/// [`Token`] includes the secret so that presented secrets can be compared
/// against the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub token: Token,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: Vec<String>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
}

impl TokenData {
    /// Whether the token is past its expiration.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }
}

/// A token row in the database of record.
///
/// Unlike [`TokenData`], this never holds the cleartext secret, only its
/// SHA-256 hash, and additionally carries the bookkeeping columns (parent
/// link, user-chosen name, delegated service, revocation flag).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub key: String,
    pub secret_hash: String,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: Vec<String>,
    pub service: Option<String>,
    pub token_name: Option<String>,
    pub parent: Option<String>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub groups: Option<Vec<Group>>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }

    /// Rebuild the Redis-side [`TokenData`] from this row plus a verified
    /// secret.
    pub fn to_data(&self, secret: String) -> TokenData {
        TokenData {
            token: Token {
                key: self.key.clone(),
                secret,
            },
            username: self.username.clone(),
            token_type: self.token_type,
            scopes: self.scopes.clone(),
            created: self.created,
            expires: self.expires,
            name: self.name.clone(),
            email: self.email.clone(),
            uid: self.uid,
            gid: self.gid,
            groups: self.groups.clone(),
        }
    }
}

/// Full token row from the database.
#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = tokens)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TokenRow {
    pub key: String,
    pub secret_hash: String,
    pub username: String,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub service: Option<String>,
    pub token_name: Option<String>,
    pub parent: Option<String>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub groups: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl TokenRow {
    pub fn into_record(self) -> TokenRecord {
        TokenRecord {
            key: self.key,
            secret_hash: self.secret_hash,
            username: self.username,
            // Unknown type strings cannot appear: rows are only written
            // through TokenRecord.
            token_type: TokenType::from_str(&self.token_type).unwrap_or(TokenType::Session),
            scopes: self.scopes,
            service: self.service,
            token_name: self.token_name,
            parent: self.parent,
            uid: self.uid,
            gid: self.gid,
            email: self.email,
            name: self.name,
            groups: self
                .groups
                .and_then(|v| serde_json::from_value(v).ok()),
            created: self.created,
            expires: self.expires,
            revoked: self.revoked,
        }
    }
}

/// Insertable struct for creating a new token row.
#[derive(Debug, Insertable)]
#[diesel(table_name = tokens)]
pub struct NewTokenRow {
    pub key: String,
    pub secret_hash: String,
    pub username: String,
    pub token_type: String,
    pub scopes: Vec<String>,
    pub service: Option<String>,
    pub token_name: Option<String>,
    pub parent: Option<String>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub groups: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl From<&TokenRecord> for NewTokenRow {
    fn from(record: &TokenRecord) -> Self {
        NewTokenRow {
            key: record.key.clone(),
            secret_hash: record.secret_hash.clone(),
            username: record.username.clone(),
            token_type: record.token_type.as_str().to_string(),
            scopes: record.scopes.clone(),
            service: record.service.clone(),
            token_name: record.token_name.clone(),
            parent: record.parent.clone(),
            uid: record.uid,
            gid: record.gid,
            email: record.email.clone(),
            name: record.name.clone(),
            groups: record
                .groups
                .as_ref()
                .and_then(|g| serde_json::to_value(g).ok()),
            created: record.created,
            expires: record.expires,
            revoked: record.revoked,
        }
    }
}

/// Public-facing token metadata (no secrets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    /// The token key, which identifies the token in the API.
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: Vec<String>,
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl From<&TokenRecord> for TokenInfo {
    fn from(record: &TokenRecord) -> Self {
        TokenInfo {
            token: record.key.clone(),
            username: record.username.clone(),
            token_type: record.token_type,
            scopes: record.scopes.clone(),
            created: record.created.timestamp(),
            expires: record.expires.map(|e| e.timestamp()),
            token_name: record.token_name.clone(),
            service: record.service.clone(),
            parent: record.parent.clone(),
        }
    }
}

/// Body of a user token creation request.
#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub token_name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires: Option<i64>,
}

/// Body of a token modification request. Absent fields are unchanged.
#[derive(Debug, Deserialize)]
pub struct ModifyTokenRequest {
    pub token_name: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub expires: Option<i64>,
}

/// Sort, deduplicate, and return a scope list in canonical order.
///
/// The canonical order matters: the wire representation of a scope set is
/// sorted and space-separated so that internal-token derivation hashes are
/// deterministic.
pub fn normalize_scopes<I, S>(scopes: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut scopes: Vec<String> = scopes.into_iter().map(Into::into).collect();
    scopes.sort();
    scopes.dedup();
    scopes
}
