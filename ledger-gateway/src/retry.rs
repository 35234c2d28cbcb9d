//! Reconnect backoff: capped exponential delay with jitter

use crate::config::NetworkConfig;
use std::time::Duration;

/// Backoff policy for reconnection attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
}

impl RetryPolicy {
    /// Create a policy, clamping nonsensical values
    pub fn new(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter_factor: f64,
    ) -> Self {
        let initial_delay_ms = initial_delay_ms.max(1);
        Self {
            initial_delay_ms,
            max_delay_ms: max_delay_ms.max(initial_delay_ms),
            backoff_multiplier: backoff_multiplier.max(1.0),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Policy from the network section of the config
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.initial_backoff_ms,
            config.max_backoff_ms,
            config.backoff_multiplier,
            config.jitter_factor,
        )
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        // Cap at max_delay
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        // Spread reconnects from many gateways
        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).clamp(0.0, self.max_delay_ms as f64);

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}
