//! Jittered exponential backoff for transport and provider reconnects.
//!
//! The signaling layer retries dropped WebSocket/provider connections;
//! the delay schedule lives here so every reconnect path shares one
//! policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reconnect delay schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling for the exponential growth.
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Spread delays ±25% to avoid reconnect storms.
    pub jitter: bool,
    /// 0 = retry forever.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: 0,
        }
    }
}

impl BackoffPolicy {
    /// Whether another reconnect attempt is allowed after `attempt`
    /// failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt < self.max_attempts
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let mut delay = (self.base_delay_ms as f64) * self.multiplier.powi(exp);
        delay = delay.min(self.max_delay_ms as f64);
        if self.jitter {
            let spread = delay * 0.25;
            if spread > 0.0 {
                let offset = rand::thread_rng().gen_range(-spread..=spread);
                delay = (delay + offset).max(0.0);
            }
        }
        Duration::from_millis(delay as u64)
    }
}
