//! Realtime insert feed over the Phoenix channel protocol.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use lobby_core::{
    InsertSubscription, Message, RetryPolicy, SubscriptionEvent, SubscriptionStatus, SyncError,
    SyncErrorCategory,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{SupabaseConfig, rest::MessageRow};

const SUBSCRIPTION_BUFFER: usize = 128;
const PHOENIX_TOPIC: &str = "phoenix";

/// Open a self-healing insert feed for `room`.
///
/// The returned handle owns the connection task; cancelling or dropping it
/// leaves the channel and closes the socket.
pub(crate) fn spawn_subscription(config: Arc<SupabaseConfig>, room: String) -> InsertSubscription {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
    let cancel = CancellationToken::new();
    tokio::spawn(run_channel(config, room, tx, cancel.clone()));
    InsertSubscription::new(rx, cancel)
}

enum ConnectionEnd {
    Cancelled,
    Closed,
}

async fn run_channel(
    config: Arc<SupabaseConfig>,
    room: String,
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancellationToken,
) {
    let retry_policy = RetryPolicy::default();
    let mut attempt: u32 = 0;

    loop {
        let status = match run_connection(&config, &room, &tx, &cancel, &mut attempt).await {
            Ok(ConnectionEnd::Cancelled) => break,
            Ok(ConnectionEnd::Closed) => {
                warn!(%room, "realtime channel closed");
                SubscriptionStatus::Errored
            }
            Err(err) if err.category == SyncErrorCategory::SubscriptionTimeout => {
                warn!(%room, code = %err.code, "realtime join timed out");
                SubscriptionStatus::TimedOut
            }
            Err(err) => {
                warn!(%room, code = %err.code, message = %err.message, "realtime channel failed");
                SubscriptionStatus::Errored
            }
        };

        if tx.send(SubscriptionEvent::Status(status)).await.is_err() {
            break;
        }

        let delay = retry_policy.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(%room, delay_ms = delay.as_millis() as u64, "reconnecting realtime channel");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(%room, "realtime task finished");
}

async fn run_connection(
    config: &SupabaseConfig,
    room: &str,
    tx: &mpsc::Sender<SubscriptionEvent>,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> Result<ConnectionEnd, SyncError> {
    let url = config.realtime_url()?;
    let connected = tokio::select! {
        _ = cancel.cancelled() => return Ok(ConnectionEnd::Cancelled),
        connected = connect_async(url.as_str()) => connected,
    };
    let (socket, _) = connected
        .map_err(|err| SyncError::subscription("realtime_connect_failed", err.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let topic = channel_topic(room);
    let mut refs = RefCounter::default();
    let join_ref = refs.next();
    let join = join_frame(&topic, &join_ref, config, room);
    sink.send(WsMessage::Text(join.to_string()))
        .await
        .map_err(write_error)?;
    debug!(%topic, "realtime join sent");

    let join_deadline = tokio::time::sleep(config.join_timeout);
    tokio::pin!(join_deadline);
    let mut joined = false;
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let leave = control_frame(&topic, "phx_leave", &refs.next());
                let _ = sink.send(WsMessage::Text(leave.to_string())).await;
                let _ = sink.close().await;
                debug!(%topic, "realtime channel left");
                return Ok(ConnectionEnd::Cancelled);
            }
            () = &mut join_deadline, if !joined => {
                return Err(SyncError::new(
                    SyncErrorCategory::SubscriptionTimeout,
                    "join_timeout",
                    format!("no join reply within {}ms", config.join_timeout.as_millis()),
                ));
            }
            _ = heartbeat.tick() => {
                let beat = control_frame(PHOENIX_TOPIC, "heartbeat", &refs.next());
                sink.send(WsMessage::Text(beat.to_string()))
                    .await
                    .map_err(write_error)?;
            }
            frame = stream.next() => {
                let text = match frame {
                    None | Some(Ok(WsMessage::Close(_))) => return Ok(ConnectionEnd::Closed),
                    Some(Err(err)) => {
                        return Err(SyncError::subscription("realtime_read_failed", err.to_string()));
                    }
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };

                let event = match classify_frame(&text, &topic, &join_ref) {
                    FrameAction::Joined => {
                        info!(%topic, "realtime channel joined");
                        joined = true;
                        *attempt = 0;
                        SubscriptionEvent::Status(SubscriptionStatus::Confirmed)
                    }
                    FrameAction::JoinRejected(reason) => {
                        return Err(SyncError::subscription("join_rejected", reason));
                    }
                    FrameAction::ChannelClosed(reason) => {
                        return Err(SyncError::subscription("channel_closed", reason));
                    }
                    FrameAction::Insert(message) => SubscriptionEvent::Inserted(message),
                    FrameAction::Ignore => continue,
                };
                if tx.send(event).await.is_err() {
                    return Ok(ConnectionEnd::Cancelled);
                }
            }
        }
    }
}

fn write_error(err: tokio_tungstenite::tungstenite::Error) -> SyncError {
    SyncError::subscription("realtime_write_failed", err.to_string())
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn channel_topic(room: &str) -> String {
    format!("realtime:room:{room}")
}

fn join_frame(topic: &str, join_ref: &str, config: &SupabaseConfig, room: &str) -> Value {
    json!({
        "topic": topic,
        "event": "phx_join",
        "ref": join_ref,
        "join_ref": join_ref,
        "payload": {
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": config.schema,
                    "table": config.table,
                    "filter": format!("room=eq.{room}"),
                }],
                "private": false,
            },
            "access_token": config.anon_key,
        },
    })
}

fn control_frame(topic: &str, event: &str, reference: &str) -> Value {
    json!({
        "topic": topic,
        "event": event,
        "ref": reference,
        "payload": {},
    })
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

/// What one inbound frame means for our channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FrameAction {
    Joined,
    JoinRejected(String),
    ChannelClosed(String),
    Insert(Message),
    Ignore,
}

pub(crate) fn classify_frame(text: &str, topic: &str, join_ref: &str) -> FrameAction {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "ignoring undecodable realtime frame");
            return FrameAction::Ignore;
        }
    };
    if frame.topic != topic {
        return FrameAction::Ignore;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => FrameAction::Joined,
                status => {
                    let reason = frame
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .or(status)
                        .unwrap_or("join rejected");
                    FrameAction::JoinRejected(reason.to_owned())
                }
            }
        }
        "phx_error" => FrameAction::ChannelClosed("channel error".to_owned()),
        "phx_close" => FrameAction::ChannelClosed("channel closed by server".to_owned()),
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let message = frame
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("realtime system error");
            FrameAction::ChannelClosed(message.to_owned())
        }
        "postgres_changes" => {
            let is_insert = frame
                .payload
                .pointer("/data/type")
                .and_then(Value::as_str)
                .is_none_or(|kind| kind == "INSERT");
            insert_from_record(frame.payload.pointer("/data/record"), is_insert)
        }
        // Older servers address the change event directly.
        "INSERT" => insert_from_record(frame.payload.get("record"), true),
        _ => FrameAction::Ignore,
    }
}

fn insert_from_record(record: Option<&Value>, is_insert: bool) -> FrameAction {
    let Some(record) = record.filter(|_| is_insert) else {
        return FrameAction::Ignore;
    };

    let message = serde_json::from_value::<MessageRow>(record.clone())
        .map_err(|err| SyncError::serialization("invalid_record", err.to_string()))
        .and_then(MessageRow::into_message);
    match message {
        Ok(message) => FrameAction::Insert(message),
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "dropping malformed realtime record");
            FrameAction::Ignore
        }
    }
}
