//! Backoff for restarting silence after a failure.

use std::time::Duration;

use crate::{BASE_RESTART_DELAY_MS, MAX_RESTART_DELAY_MS};

/// Restart policy configuration.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first retry (exponential backoff applied).
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(BASE_RESTART_DELAY_MS),
            max_delay: Duration::from_millis(MAX_RESTART_DELAY_MS),
        }
    }
}

impl RestartPolicy {
    /// Calculate delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}
