//! Core message stream contract shared between session runtimes and frontends.
//!
//! This crate defines the message model, the window/merge/cursor engine that
//! keeps one room's list consistent, the source arbitration state machine,
//! the backend store contract, and common error/channel abstractions.

/// Session command/event channel primitives.
pub mod channel;
/// Wall-clock abstraction.
pub mod clock;
/// Monotonic fetch cursor.
pub mod cursor;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Keyed merge of message collections.
pub mod merge;
/// Send acknowledgement normalization.
pub mod normalization;
/// Reconnect backoff policy.
pub mod retry;
/// Push/poll source arbitration.
pub mod state_machine;
/// Backend store contract.
pub mod store;
/// Frontend-facing protocol and data model types.
pub mod types;
/// Presentation helpers consuming the message list.
pub mod view;
/// Retention window policy.
pub mod window;

pub use channel::{EventStream, SessionChannelError, SessionChannels};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cursor::CursorTracker;
pub use error::{SyncError, SyncErrorCategory, http_error_code};
pub use merge::{MergeError, MessageList, merge};
pub use normalization::{SendOutcome, normalize_send_outcome, send_failure_notice};
pub use retry::RetryPolicy;
pub use state_machine::SourceStateMachine;
pub use store::{FetchQuery, InsertSubscription, RoomStore, SubscriptionEvent};
pub use types::{
    ColorKey, IdentityKey, Message, MessageId, NewMessage, PENDING_ID_PREFIX, SendAck,
    SessionCommand, SessionEvent, SourceState, SubscriptionStatus, SyncConfig, SyncSource,
};
pub use view::{MessageRow, TimelineRow, build_timeline, color_for, initials, is_near_bottom};
pub use window::WindowPolicy;
