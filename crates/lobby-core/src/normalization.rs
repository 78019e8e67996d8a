use crate::{
    error::SyncError,
    types::{MessageId, SendAck, SessionEvent},
};

/// Durable write result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The backend stored the message, normally under a durable id.
    Success { message_id: Option<MessageId> },
    /// The write failed and the optimistic entry was rolled back.
    Failure { error: SyncError },
}

/// Convert a send outcome to a stable `SessionEvent::SendAck`.
pub fn normalize_send_outcome(pending_id: MessageId, outcome: SendOutcome) -> SessionEvent {
    match outcome {
        SendOutcome::Success { message_id } => SessionEvent::SendAck(SendAck {
            pending_id,
            message_id,
            error_code: None,
            error_message: None,
        }),
        SendOutcome::Failure { error } => SessionEvent::SendAck(SendAck {
            pending_id,
            message_id: None,
            error_message: Some(send_failure_notice(&error)),
            error_code: Some(error.code),
        }),
    }
}

/// User-facing notice for a failed send.
pub fn send_failure_notice(error: &SyncError) -> String {
    format!("send failed: {}", error.message)
}
