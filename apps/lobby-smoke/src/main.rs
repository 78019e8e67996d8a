mod config;
mod logging;

use std::process::ExitCode;

use lobby_core::{SessionEvent, SyncError, TimelineRow, build_timeline};
use lobby_supabase::{SessionHandle, SessionOptions, SupabaseConfig, SupabaseStore, spawn_session};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let session = match start_session(&config) {
        Ok(session) => session,
        Err(err) => {
            error!(code = %err.code, message = %err.message, "failed to start session");
            return ExitCode::FAILURE;
        }
    };
    info!(room = %config.room, author = %config.author, "session running, Ctrl-C to stop");

    let mut events = session.subscribe();
    let mut pending_send = config.send_text.clone();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!(error = %err, "failed to listen for Ctrl-C");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SourceStateChanged { state }) => {
                    info!(state = ?state, "source state changed");
                    if let Some(text) = pending_send.take() {
                        if let Err(err) = session.send_text(text).await {
                            warn!(error = %err, "send was not queued");
                        }
                    }
                }
                Ok(SessionEvent::MessagesChanged { source, count }) => {
                    info!(source = ?source, count, "messages changed");
                    log_latest(&session, &config.author);
                }
                Ok(SessionEvent::SendAck(ack)) => match ack.error_message {
                    Some(notice) => warn!(pending_id = %ack.pending_id, %notice, "send rejected"),
                    None => info!(pending_id = %ack.pending_id, message_id = ?ack.message_id, "send stored"),
                },
                Ok(SessionEvent::Stopped) | Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
            }
        }
    }

    session.stop().await;
    info!("session stopped");
    ExitCode::SUCCESS
}

fn start_session(config: &SmokeConfig) -> Result<SessionHandle, SyncError> {
    let supabase = SupabaseConfig::new(&config.supabase_url, config.anon_key.clone())?
        .with_table(&config.table)
        .with_schema(&config.schema);
    let store = SupabaseStore::new(supabase)?;

    let mut options =
        SessionOptions::new(&config.room, &config.author).with_config(config.sync.clone());
    if let Some(user_id) = config.user_id {
        options = options.with_user_id(user_id);
    }
    spawn_session(store, options)
}

fn log_latest(session: &SessionHandle, own_author: &str) {
    let snapshot = session.snapshot();
    let rows = build_timeline(snapshot.items(), own_author);
    if let Some(TimelineRow::Message(row)) = rows.last() {
        debug!(
            time = %row.time_label,
            author = %row.author,
            own = row.is_own,
            pending = row.is_pending,
            text = %row.text,
            "latest message"
        );
    }
}
