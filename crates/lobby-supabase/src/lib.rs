//! Supabase-backed room store plus the session runtime that drives any
//! [`RoomStore`].

mod realtime;
mod rest;
mod session;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use lobby_core::{
    FetchQuery, InsertSubscription, Message, NewMessage, RoomStore, SyncError, SyncErrorCategory,
    http_error_code,
};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::rest::{InsertRow, MessageRow, fetch_params, rows_to_messages};

pub use session::{SessionHandle, SessionOptions, spawn_session};

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_TABLE: &str = "messages";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Project endpoint and table settings.
#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: Url,
    pub anon_key: String,
    pub schema: String,
    pub table: String,
    /// How long to wait for a Realtime join reply.
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl SupabaseConfig {
    pub fn new(url: &str, anon_key: impl Into<String>) -> Result<Self, SyncError> {
        let mut url = Url::parse(url)
            .map_err(|err| SyncError::config("invalid_supabase_url", err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::config(
                "invalid_supabase_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        let anon_key = anon_key.into();
        if anon_key.trim().is_empty() {
            return Err(SyncError::config(
                "missing_anon_key",
                "anon key must not be empty",
            ));
        }

        Ok(Self {
            url,
            anon_key,
            schema: DEFAULT_SCHEMA.to_owned(),
            table: DEFAULT_TABLE.to_owned(),
            join_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
        })
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn rest_url(&self) -> Result<Url, SyncError> {
        self.url
            .join(&format!("rest/v1/{}", self.table))
            .map_err(|err| SyncError::config("invalid_supabase_url", err.to_string()))
    }

    fn realtime_url(&self) -> Result<Url, SyncError> {
        let mut url = self
            .url
            .join("realtime/v1/websocket")
            .map_err(|err| SyncError::config("invalid_supabase_url", err.to_string()))?;
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme).map_err(|()| {
            SyncError::config("invalid_supabase_url", "cannot derive realtime scheme")
        })?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }
}

/// [`RoomStore`] over PostgREST and Realtime.
#[derive(Clone)]
pub struct SupabaseStore {
    http: reqwest::Client,
    config: Arc<SupabaseConfig>,
}

impl SupabaseStore {
    pub fn new(config: SupabaseConfig) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| SyncError::internal("http_client_build_failed", err.to_string()))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self
            .http
            .request(method, url)
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key);
        if self.config.schema == DEFAULT_SCHEMA {
            request
        } else {
            request
                .header("Accept-Profile", &self.config.schema)
                .header("Content-Profile", &self.config.schema)
        }
    }
}

#[async_trait]
impl RoomStore for SupabaseStore {
    async fn fetch_messages(&self, query: &FetchQuery) -> Result<Vec<Message>, SyncError> {
        let url = self.config.rest_url()?;
        let response = self
            .request(Method::GET, url)
            .query(&fetch_params(query))
            .send()
            .await
            .map_err(|err| map_reqwest_error(SyncErrorCategory::Query, err))?;
        let response = ensure_success(response, SyncErrorCategory::Query).await?;

        let rows: Vec<MessageRow> = response
            .json()
            .await
            .map_err(|err| SyncError::serialization("invalid_rows", err.to_string()))?;
        debug!(room = %query.room, count = rows.len(), "fetched rows");
        Ok(rows_to_messages(rows))
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SyncError> {
        let url = self.config.rest_url()?;
        let response = self
            .request(Method::POST, url)
            .header("Prefer", "return=representation")
            .json(&[InsertRow::from(message)])
            .send()
            .await
            .map_err(|err| map_reqwest_error(SyncErrorCategory::Write, err))?;
        let response = ensure_success(response, SyncErrorCategory::Write).await?;

        let rows: Vec<MessageRow> = response
            .json()
            .await
            .map_err(|err| SyncError::serialization("invalid_rows", err.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SyncError::write("empty_insert_response", "insert returned no row"))?
            .into_message()
    }

    async fn subscribe_insertions(&self, room: &str) -> Result<InsertSubscription, SyncError> {
        // Validate before spawning so a bad URL fails the call instead of the feed.
        self.config.realtime_url()?;
        Ok(realtime::spawn_subscription(
            Arc::clone(&self.config),
            room.to_owned(),
        ))
    }
}

async fn ensure_success(
    response: Response,
    category: SyncErrorCategory,
) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SyncError::new(
        category,
        http_error_code(status.as_u16()),
        format!("HTTP {}: {}", status.as_u16(), error_detail(&body)),
    ))
}

/// PostgREST error bodies carry a `message`; anything else is passed through.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned())
}

fn map_reqwest_error(category: SyncErrorCategory, err: reqwest::Error) -> SyncError {
    let code = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect_failed"
    } else if let Some(status) = err.status() {
        http_error_code(status.as_u16())
    } else {
        "http_error"
    };
    SyncError::new(category, code, err.to_string())
}
