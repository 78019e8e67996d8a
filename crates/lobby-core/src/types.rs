use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

/// Reserved prefix carried by locally generated ids awaiting confirmation.
pub const PENDING_ID_PREFIX: &str = "tmp-";

const DEFAULT_HORIZON_MS: u64 = 3 * 60 * 60 * 1_000;
const DEFAULT_PAGE_LIMIT: u16 = 200;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_FALLBACK_GRACE_MS: u64 = 5_000;
const DEFAULT_JANITOR_INTERVAL_MS: u64 = 60_000;

/// Message identifier, either backend-assigned or a pending local id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a backend-assigned identifier.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a pending id for a message created at `created_at_ms`.
    pub fn pending(created_at_ms: u64) -> Self {
        Self(format!(
            "{PENDING_ID_PREFIX}{created_at_ms}-{}",
            Uuid::new_v4().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was generated locally and not yet confirmed.
    pub fn is_pending(&self) -> bool {
        self.0.starts_with(PENDING_ID_PREFIX)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key used to deduplicate messages across sources.
///
/// Records without an id fall back to a composite of timestamp, author and
/// text. Two distinct messages sharing all three collapse into one entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdentityKey {
    Id(MessageId),
    Composite {
        created_at_ms: u64,
        author: String,
        text: String,
    },
}

/// One chat message in the room stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Backend id, pending local id, or `None` for malformed payloads.
    pub id: Option<MessageId>,
    /// Room the message belongs to.
    pub room: String,
    /// Display name of the sender.
    pub author: String,
    /// Message body.
    pub text: String,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    /// Optional stable sender id, used for coloring when present.
    pub user_id: Option<i64>,
}

impl Message {
    /// Build the optimistic local record for an outgoing message.
    pub fn pending(draft: &NewMessage, created_at_ms: u64) -> Self {
        Self {
            id: Some(MessageId::pending(created_at_ms)),
            room: draft.room.clone(),
            author: draft.author.clone(),
            text: draft.text.clone(),
            created_at_ms,
            user_id: draft.user_id,
        }
    }

    pub fn identity_key(&self) -> IdentityKey {
        match &self.id {
            Some(id) => IdentityKey::Id(id.clone()),
            None => IdentityKey::Composite {
                created_at_ms: self.created_at_ms,
                author: self.author.clone(),
                text: self.text.clone(),
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.as_ref().is_some_and(MessageId::is_pending)
    }

    /// Shallow merge: fields of `newer` overwrite ours, except optional
    /// fields `newer` leaves unset.
    pub fn merge_from(&mut self, newer: Message) {
        let Message {
            id,
            room,
            author,
            text,
            created_at_ms,
            user_id,
        } = newer;

        if id.is_some() {
            self.id = id;
        }
        if user_id.is_some() {
            self.user_id = user_id;
        }
        self.room = room;
        self.author = author;
        self.text = text;
        self.created_at_ms = created_at_ms;
    }

    /// Coloring key resolved from the sender id, falling back to the author.
    pub fn color_key(&self) -> ColorKey {
        match self.user_id {
            Some(user_id) => ColorKey::Numeric(user_id),
            None if !self.author.is_empty() => ColorKey::Named(self.author.clone()),
            None => ColorKey::Named("unknown".to_owned()),
        }
    }
}

/// Durable write payload; the backend assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub room: String,
    pub author: String,
    pub text: String,
    pub user_id: Option<i64>,
}

/// Sender coloring key, fixed when the message is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ColorKey {
    Numeric(i64),
    Named(String),
}

/// Which acquisition strategy is authoritative for new messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceState {
    /// Session started; subscription health not yet known.
    Initializing,
    /// Push subscription confirmed healthy; polling is off.
    Live,
    /// Subscription failed or never confirmed; polling is on.
    Degraded,
    /// Session torn down.
    Stopped,
}

/// Lifecycle status reported by a push subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Confirmed,
    Errored,
    TimedOut,
}

/// Origin of a merge into the message list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncSource {
    Backfill,
    Push,
    Poll,
    Send,
    Janitor,
}

/// Tuning values for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Retention window in milliseconds.
    pub horizon_ms: u64,
    /// Page size for backfill and poll fetches.
    pub page_limit: u16,
    /// Poll cadence while degraded.
    pub poll_interval_ms: u64,
    /// How long to wait for subscription confirmation before polling.
    pub fallback_grace_ms: u64,
    /// Cadence of the window janitor.
    pub janitor_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            horizon_ms: DEFAULT_HORIZON_MS,
            page_limit: DEFAULT_PAGE_LIMIT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fallback_grace_ms: DEFAULT_FALLBACK_GRACE_MS,
            janitor_interval_ms: DEFAULT_JANITOR_INTERVAL_MS,
        }
    }
}

impl SyncConfig {
    /// Reject zero durations and page sizes.
    pub fn validate(&self) -> Result<(), SyncError> {
        let checks = [
            ("horizon_ms", self.horizon_ms),
            ("page_limit", u64::from(self.page_limit)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("fallback_grace_ms", self.fallback_grace_ms),
            ("janitor_interval_ms", self.janitor_interval_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(SyncError::config(
                    "invalid_sync_config",
                    format!("{name} must be greater than 0"),
                ));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }
}

/// Command channel input accepted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Send a message as the session author.
    Send {
        /// Raw composer text; trimmed before sending.
        text: String,
    },
    /// Tear the session down.
    Stop,
}

/// Acknowledgement for one send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Pending id shown while the write was in flight.
    pub pending_id: MessageId,
    /// Durable id on success.
    pub message_id: Option<MessageId>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
    /// Human-readable failure notice.
    pub error_message: Option<String>,
}

/// Event channel output emitted by a session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEvent {
    /// Source arbitration transition.
    SourceStateChanged { state: SourceState },
    /// The message list changed.
    MessagesChanged {
        /// What caused the change.
        source: SyncSource,
        /// Number of messages now retained.
        count: usize,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Session finished teardown.
    Stopped,
}
