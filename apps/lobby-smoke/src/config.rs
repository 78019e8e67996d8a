//! Environment-backed runtime configuration for `lobby-smoke`.

use std::{env, error::Error, fmt};

use lobby_core::SyncConfig;
use uuid::Uuid;

const DEFAULT_ROOM: &str = "lobby";
const DEFAULT_TABLE: &str = "messages";
const DEFAULT_SCHEMA: &str = "public";

/// Runtime configuration used by the smoke client.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Supabase project URL.
    pub supabase_url: String,
    /// Public anon key used for REST and Realtime.
    pub anon_key: String,
    pub room: String,
    /// Display name written with sent messages.
    pub author: String,
    /// Optional stable sender id.
    pub user_id: Option<i64>,
    pub table: String,
    /// Postgres schema holding the table.
    pub schema: String,
    /// Window, page and timer tuning.
    pub sync: SyncConfig,
    /// Message to send once the session is up.
    pub send_text: Option<String>,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let supabase_url = required_env("LOBBY_SUPABASE_URL", &mut lookup)?;
        let anon_key = required_env("LOBBY_SUPABASE_ANON_KEY", &mut lookup)?;
        let room = optional_trimmed_env("LOBBY_ROOM", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ROOM.to_owned());
        let author = optional_trimmed_env("LOBBY_AUTHOR", &mut lookup).unwrap_or_else(guest_name);
        let user_id = parse_optional::<i64, _>("LOBBY_USER_ID", &mut lookup)?;
        let table = optional_trimmed_env("LOBBY_TABLE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_TABLE.to_owned());
        let schema = optional_trimmed_env("LOBBY_SCHEMA", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_owned());
        let send_text = optional_trimmed_env("LOBBY_SEND_TEXT", &mut lookup);

        let defaults = SyncConfig::default();
        let horizon_ms = match parse_optional::<u64, _>("LOBBY_HORIZON_SECS", &mut lookup)? {
            Some(secs) => secs.saturating_mul(1_000),
            None => defaults.horizon_ms,
        };
        let sync = SyncConfig {
            horizon_ms,
            page_limit: parse_optional("LOBBY_PAGE_LIMIT", &mut lookup)?
                .unwrap_or(defaults.page_limit),
            poll_interval_ms: parse_optional("LOBBY_POLL_INTERVAL_MS", &mut lookup)?
                .unwrap_or(defaults.poll_interval_ms),
            fallback_grace_ms: parse_optional("LOBBY_FALLBACK_GRACE_MS", &mut lookup)?
                .unwrap_or(defaults.fallback_grace_ms),
            janitor_interval_ms: parse_optional("LOBBY_JANITOR_INTERVAL_MS", &mut lookup)?
                .unwrap_or(defaults.janitor_interval_ms),
        };

        if let Err(err) = sync.validate() {
            return Err(ConfigError::InvalidValue {
                key: "sync",
                value: format!("{sync:?}"),
                reason: err.message,
            });
        }

        Ok(Self {
            supabase_url,
            anon_key,
            room,
            author,
            user_id,
            table,
            schema,
            sync,
            send_text,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "{key} must be set"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn guest_name() -> String {
    format!("Guest{}", Uuid::new_v4().as_u128() % 1_000)
}

fn required_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &'static str, lookup: &mut F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<T>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REQUIRED: [(&str, &str); 2] = [
        ("LOBBY_SUPABASE_URL", "https://demo.supabase.co"),
        ("LOBBY_SUPABASE_ANON_KEY", "anon"),
    ];

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SmokeConfig, ConfigError> {
        let map = REQUIRED
            .iter()
            .chain(pairs)
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SmokeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn parses_required_fields_and_defaults() {
        let cfg = config_from_pairs(&[]).expect("config should parse");

        assert_eq!(cfg.supabase_url, "https://demo.supabase.co");
        assert_eq!(cfg.anon_key, "anon");
        assert_eq!(cfg.room, DEFAULT_ROOM);
        assert_eq!(cfg.table, DEFAULT_TABLE);
        assert_eq!(cfg.schema, DEFAULT_SCHEMA);
        assert_eq!(cfg.user_id, None);
        assert_eq!(cfg.send_text, None);
        assert_eq!(cfg.sync, SyncConfig::default());
        assert!(cfg.author.starts_with("Guest"));
    }

    #[test]
    fn missing_credentials_are_reported_by_key() {
        let err = SmokeConfig::from_lookup(|_| None).expect_err("url is required");
        assert_eq!(
            err,
            ConfigError::Missing {
                key: "LOBBY_SUPABASE_URL"
            }
        );

        let err = SmokeConfig::from_lookup(|key| {
            (key == "LOBBY_SUPABASE_URL").then(|| "https://demo.supabase.co".to_owned())
        })
        .expect_err("anon key is required");
        assert_eq!(err.to_string(), "LOBBY_SUPABASE_ANON_KEY must be set");
    }

    #[test]
    fn parses_session_overrides() {
        let cfg = config_from_pairs(&[
            ("LOBBY_ROOM", " garden "),
            ("LOBBY_AUTHOR", "alice"),
            ("LOBBY_USER_ID", "7"),
            ("LOBBY_TABLE", "lobby_messages"),
            ("LOBBY_SCHEMA", "chat"),
            ("LOBBY_HORIZON_SECS", "600"),
            ("LOBBY_PAGE_LIMIT", "50"),
            ("LOBBY_POLL_INTERVAL_MS", "1000"),
            ("LOBBY_FALLBACK_GRACE_MS", "3000"),
            ("LOBBY_JANITOR_INTERVAL_MS", "30000"),
            ("LOBBY_SEND_TEXT", "hello from smoke"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.room, "garden");
        assert_eq!(cfg.author, "alice");
        assert_eq!(cfg.user_id, Some(7));
        assert_eq!(cfg.table, "lobby_messages");
        assert_eq!(cfg.schema, "chat");
        assert_eq!(cfg.sync.horizon_ms, 600_000);
        assert_eq!(cfg.sync.page_limit, 50);
        assert_eq!(cfg.sync.poll_interval_ms, 1_000);
        assert_eq!(cfg.sync.fallback_grace_ms, 3_000);
        assert_eq!(cfg.sync.janitor_interval_ms, 30_000);
        assert_eq!(cfg.send_text.as_deref(), Some("hello from smoke"));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("LOBBY_PAGE_LIMIT", "abc")])
            .expect_err("invalid page limit should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "LOBBY_PAGE_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("LOBBY_POLL_INTERVAL_MS", "0")])
            .expect_err("zero poll interval should fail");
        assert!(err.to_string().contains("poll_interval_ms must be greater than 0"));
    }
}
