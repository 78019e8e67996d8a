use std::time::Duration;

/// Exponential backoff used by subscription reconnect loops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before reconnect attempt `attempt` (0-based), capped at the max.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
