//! Rolling performance snapshot maintained by the runtime wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smoothing factor for both moving averages.
pub const EMA_ALPHA: f64 = 0.2;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Exponential moving average of handler latency.
    pub latency_ema_ms: f64,
    /// Exponential moving average of the failure indicator (0.0..=1.0).
    pub error_rate: f64,
    /// Messages waiting in or being processed by the mailbox.
    pub load: usize,
    pub processed: u64,
    pub failed: u64,
    pub last_active: Option<DateTime<Utc>>,
}

impl PerformanceSnapshot {
    pub fn record(&mut self, latency: Duration, success: bool) {
        let ms = latency.as_secs_f64() * 1000.0;
        let failure = if success { 0.0 } else { 1.0 };
        if self.processed == 0 {
            self.latency_ema_ms = ms;
            self.error_rate = failure;
        } else {
            self.latency_ema_ms = EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * self.latency_ema_ms;
            self.error_rate = EMA_ALPHA * failure + (1.0 - EMA_ALPHA) * self.error_rate;
        }
        self.processed += 1;
        if !success {
            self.failed += 1;
        }
        self.last_active = Some(Utc::now());
    }
}
