use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Sleep between status rounds. With the default factor of 1.0 every round
/// waits the same interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
    pub initial_interval_ms: u64,
    pub backoff_factor: f64,
    pub max_interval_ms: u64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }
}

impl PollBackoff {
    pub fn fixed(interval: Duration) -> Self {
        let interval_ms = duration_ms(interval);
        Self {
            initial_interval_ms: interval_ms,
            backoff_factor: 1.0,
            max_interval_ms: interval_ms,
        }
    }

    pub fn exponential(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            initial_interval_ms: duration_ms(initial),
            backoff_factor: factor,
            max_interval_ms: duration_ms(max),
        }
    }

    /// Rounds are counted from 1.
    pub fn interval_for_round(&self, round: u32) -> Duration {
        Duration::from_millis(interval_for_round_ms(round, self))
    }
}

pub fn interval_for_round_ms(round: u32, config: &PollBackoff) -> u64 {
    let exp = round.saturating_sub(1).min(i32::MAX as u32) as i32;
    let factor = if config.backoff_factor.is_finite() && config.backoff_factor >= 1.0 {
        config.backoff_factor
    } else {
        1.0
    };
    let base = (config.initial_interval_ms as f64) * factor.powi(exp);
    let ceiling = config.max_interval_ms.max(config.initial_interval_ms) as f64;
    base.min(ceiling).round().max(0.0) as u64
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
