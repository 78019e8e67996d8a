use std::time::Duration;

use crate::types::Message;

/// Rolling retention horizon applied to the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    horizon_ms: u64,
}

impl WindowPolicy {
    pub fn new(horizon: Duration) -> Self {
        Self::from_millis(horizon.as_millis() as u64)
    }

    pub fn from_millis(horizon_ms: u64) -> Self {
        Self { horizon_ms }
    }

    /// Oldest timestamp still retained at `now_ms`.
    pub fn window_start(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.horizon_ms)
    }

    pub fn retains(&self, message: &Message, now_ms: u64) -> bool {
        message.created_at_ms >= self.window_start(now_ms)
    }

    /// Drop every message older than the window, keeping order.
    pub fn trim(&self, mut messages: Vec<Message>, now_ms: u64) -> Vec<Message> {
        messages.retain(|message| self.retains(message, now_ms));
        messages
    }
}
