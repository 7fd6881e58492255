use chrono::{DateTime, TimeZone, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::token_change_history;
use crate::models::token::TokenType;

/// Kind of token lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEvent {
    Create,
    Revoke,
    Edit,
    Expire,
}

impl HistoryEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryEvent::Create => "create",
            HistoryEvent::Revoke => "revoke",
            HistoryEvent::Edit => "edit",
            HistoryEvent::Expire => "expire",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "create" => Some(HistoryEvent::Create),
            "revoke" => Some(HistoryEvent::Revoke),
            "edit" => Some(HistoryEvent::Edit),
            "expire" => Some(HistoryEvent::Expire),
            _ => None,
        }
    }
}

/// An immutable record of a token lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub event: HistoryEvent,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub event_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_values: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_values: Option<serde_json::Value>,
}

/// A history entry before it has been assigned a database id.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub event: HistoryEvent,
    pub actor: String,
    pub ip_address: Option<String>,
    pub event_time: DateTime<Utc>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

#[derive(Debug, Queryable, Selectable)]
#[diesel(table_name = token_change_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HistoryRow {
    pub id: i64,
    pub token_key: String,
    pub username: String,
    pub token_type: String,
    pub event: String,
    pub actor: String,
    pub ip_address: Option<String>,
    pub event_time: DateTime<Utc>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

impl HistoryRow {
    pub fn into_entry(self) -> HistoryEntry {
        HistoryEntry {
            id: self.id,
            token: self.token_key,
            username: self.username,
            token_type: TokenType::from_str(&self.token_type).unwrap_or(TokenType::Session),
            event: HistoryEvent::from_str(&self.event).unwrap_or(HistoryEvent::Create),
            actor: self.actor,
            ip_address: self.ip_address,
            event_time: self.event_time,
            old_values: self.old_values,
            new_values: self.new_values,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = token_change_history)]
pub struct NewHistoryRow {
    pub token_key: String,
    pub username: String,
    pub token_type: String,
    pub event: String,
    pub actor: String,
    pub ip_address: Option<String>,
    pub event_time: DateTime<Utc>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
}

impl From<&NewHistoryEntry> for NewHistoryRow {
    fn from(entry: &NewHistoryEntry) -> Self {
        NewHistoryRow {
            token_key: entry.token.clone(),
            username: entry.username.clone(),
            token_type: entry.token_type.as_str().to_string(),
            event: entry.event.as_str().to_string(),
            actor: entry.actor.clone(),
            ip_address: entry.ip_address.clone(),
            event_time: entry.event_time,
            old_values: entry.old_values.clone(),
            new_values: entry.new_values.clone(),
        }
    }
}

/// A keyset pagination cursor in the form `p?<unix_seconds>_<id>`.
///
/// Sort order is (event_time desc, id desc), which keeps cursors stable
/// under concurrent inserts. A leading `p` marks a before-cursor pointing at
/// the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCursor {
    pub time: DateTime<Utc>,
    pub id: i64,
    pub previous: bool,
}

impl HistoryCursor {
    pub fn parse(value: &str) -> Option<Self> {
        let (previous, rest) = match value.strip_prefix('p') {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let (time, id) = rest.split_once('_')?;
        let time: i64 = time.parse().ok()?;
        let id: i64 = id.parse().ok()?;
        if time < 0 || id < 0 {
            return None;
        }
        Some(Self {
            time: Utc.timestamp_opt(time, 0).single()?,
            id,
            previous,
        })
    }

    /// The inverse cursor pointing the other direction from the same entry.
    pub fn invert(self) -> Self {
        Self {
            previous: !self.previous,
            ..self
        }
    }
}

impl std::fmt::Display for HistoryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.previous {
            write!(f, "p{}_{}", self.time.timestamp(), self.id)
        } else {
            write!(f, "{}_{}", self.time.timestamp(), self.id)
        }
    }
}

/// Filters and pagination for a history query.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub token: Option<String>,
    pub username: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub cursor: Option<HistoryCursor>,
    pub limit: usize,
}

/// One page of history entries plus cursors and the unpaginated count.
#[derive(Debug)]
pub struct PaginatedHistory {
    pub entries: Vec<HistoryEntry>,
    pub count: i64,
    pub prev_cursor: Option<HistoryCursor>,
    pub next_cursor: Option<HistoryCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let cursor = HistoryCursor {
            time: Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            id: 42,
            previous: false,
        };
        assert_eq!(cursor.to_string(), "1600000000_42");
        assert_eq!(HistoryCursor::parse("1600000000_42").unwrap(), cursor);

        let prev = cursor.invert();
        assert_eq!(prev.to_string(), "p1600000000_42");
        assert_eq!(HistoryCursor::parse("p1600000000_42").unwrap(), prev);
    }

    #[test]
    fn cursor_rejects_malformed_input() {
        assert!(HistoryCursor::parse("").is_none());
        assert!(HistoryCursor::parse("12345").is_none());
        assert!(HistoryCursor::parse("abc_def").is_none());
        assert!(HistoryCursor::parse("p_1").is_none());
        assert!(HistoryCursor::parse("-5_1").is_none());
    }
}
