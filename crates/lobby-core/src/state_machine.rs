use crate::{
    error::SyncError,
    types::{SessionEvent, SourceState, SubscriptionStatus},
};

/// Arbitrates between push delivery and poll fallback.
///
/// `Initializing` moves to `Live` on the first confirmation, or to
/// `Degraded` on a subscription failure or when the grace period runs out.
/// `Live` and `Degraded` then follow the subscription health signals.
#[derive(Debug, Clone)]
pub struct SourceStateMachine {
    state: SourceState,
}

impl Default for SourceStateMachine {
    fn default() -> Self {
        Self {
            state: SourceState::Initializing,
        }
    }
}

impl SourceStateMachine {
    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Whether the poll fallback should be running.
    pub fn should_poll(&self) -> bool {
        self.state == SourceState::Degraded
    }

    pub fn on_subscription_status(
        &mut self,
        status: SubscriptionStatus,
    ) -> Result<Vec<SessionEvent>, SyncError> {
        self.ensure_running("subscription_status")?;

        let next = match status {
            SubscriptionStatus::Confirmed => SourceState::Live,
            SubscriptionStatus::Errored | SubscriptionStatus::TimedOut => SourceState::Degraded,
        };
        Ok(self.transition(next))
    }

    /// The confirmation grace period elapsed.
    pub fn on_grace_expired(&mut self) -> Result<Vec<SessionEvent>, SyncError> {
        self.ensure_running("grace_expired")?;

        if self.state != SourceState::Initializing {
            return Ok(Vec::new());
        }
        Ok(self.transition(SourceState::Degraded))
    }

    pub fn on_stop(&mut self) -> Vec<SessionEvent> {
        self.transition(SourceState::Stopped)
    }

    fn ensure_running(&self, action: &str) -> Result<(), SyncError> {
        if self.state == SourceState::Stopped {
            return Err(SyncError::invalid_state(self.state, action));
        }
        Ok(())
    }

    fn transition(&mut self, next: SourceState) -> Vec<SessionEvent> {
        if self.state == next {
            return Vec::new();
        }
        self.state = next;
        vec![SessionEvent::SourceStateChanged { state: next }]
    }
}
