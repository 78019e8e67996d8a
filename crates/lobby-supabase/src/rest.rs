//! PostgREST row mapping and request building.

use chrono::{DateTime, NaiveDateTime, SecondsFormat};
use lobby_core::{FetchQuery, Message, MessageId, NewMessage, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One `messages` row as returned by PostgREST or Realtime.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub(crate) struct MessageRow {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub user_id: Option<i64>,
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message, SyncError> {
        let room = self.room.ok_or_else(|| {
            SyncError::serialization("missing_room", "message row has no room")
        })?;
        let created_at = self.created_at.ok_or_else(|| {
            SyncError::serialization("missing_created_at", "message row has no created_at")
        })?;

        Ok(Message {
            id: self.id.and_then(row_id),
            room,
            author: self.user_name.unwrap_or_default(),
            text: self.text.unwrap_or_default(),
            created_at_ms: parse_timestamp(&created_at)?,
            user_id: self.user_id,
        })
    }
}

/// Insert body; the table assigns `id` and `created_at`.
#[derive(Debug, Serialize)]
pub(crate) struct InsertRow<'a> {
    pub room: &'a str,
    pub user_name: &'a str,
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl<'a> From<&'a NewMessage> for InsertRow<'a> {
    fn from(message: &'a NewMessage) -> Self {
        Self {
            room: &message.room,
            user_name: &message.author,
            text: &message.text,
            user_id: message.user_id,
        }
    }
}

/// Query string for an ascending room fetch.
pub(crate) fn fetch_params(query: &FetchQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("select", "*".to_owned()),
        ("room", format!("eq.{}", query.room)),
    ];
    if let Some(since_ms) = query.since_ms {
        params.push(("created_at", format!("gte.{}", format_timestamp(since_ms))));
    }
    params.push(("order", "created_at.asc".to_owned()));
    params.push(("limit", query.limit.to_string()));
    params
}

/// Convert rows, skipping ones that cannot be placed on the timeline.
pub(crate) fn rows_to_messages(rows: Vec<MessageRow>) -> Vec<Message> {
    rows.into_iter()
        .filter_map(|row| match row.into_message() {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(code = %err.code, "skipping malformed message row");
                None
            }
        })
        .collect()
}

pub(crate) fn format_timestamp(ms: u64) -> String {
    DateTime::from_timestamp_millis(ms as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<u64, SyncError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return millis(parsed.timestamp_millis(), value);
    }

    // `timestamp` columns (no zone) come back without an offset.
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, pattern) {
            return millis(naive.and_utc().timestamp_millis(), value);
        }
    }

    Err(SyncError::serialization(
        "invalid_timestamp",
        format!("unrecognized timestamp '{value}'"),
    ))
}

fn millis(ms: i64, raw: &str) -> Result<u64, SyncError> {
    u64::try_from(ms).map_err(|_| {
        SyncError::serialization("invalid_timestamp", format!("timestamp before epoch '{raw}'"))
    })
}

fn row_id(value: Value) -> Option<MessageId> {
    match value {
        Value::String(id) if !id.is_empty() => Some(MessageId::new(id)),
        Value::Number(id) => Some(MessageId::new(id.to_string())),
        _ => None,
    }
}
