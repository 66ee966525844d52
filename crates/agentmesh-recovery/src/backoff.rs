//! Delay policies between recovery attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter must stay below one full exponential step or delays could shrink.
const MAX_JITTER_RATIO: f64 = 0.99;
/// Smallest growth factor that outpaces the largest jitter.
const MIN_MULTIPLIER: f64 = 2.0;
const MIN_BASE_MS: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed {
        delay_ms: u64,
    },
    /// `base * multiplier^(attempt-1)` plus up to `jitter_ratio` of that
    /// again, capped at `max_ms`. `base_ms` is raised to at least 1 and
    /// `multiplier` to at least 2.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        multiplier: f64,
        jitter_ratio: f64,
    },
}

impl Backoff {
    pub fn exponential(base_ms: u64, max_ms: u64, jitter_ratio: f64) -> Self {
        Self::Exponential {
            base_ms,
            max_ms,
            multiplier: 2.0,
            jitter_ratio,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    ///
    /// For exponential policies, successive delays strictly increase until
    /// the cap is reached.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                base_ms,
                max_ms,
                multiplier,
                jitter_ratio,
            } => {
                let step = attempt.max(1) as i32 - 1;
                let base = (*base_ms).max(MIN_BASE_MS) as f64;
                let exp = base * multiplier.max(MIN_MULTIPLIER).powi(step);
                let ratio = jitter_ratio.clamp(0.0, MAX_JITTER_RATIO);
                let jitter = if ratio > 0.0 {
                    rand::thread_rng().gen_range(0.0..ratio) * exp
                } else {
                    0.0
                };
                let ms = (exp + jitter).min(*max_ms as f64);
                Duration::from_secs_f64(ms / 1000.0)
            }
        }
    }
}
