//! Per-unit progress and liveness cadence.

use std::time::{Duration, Instant};

use fverify_types::ProcessingUnit;

use crate::config::VerifyConfig;

/// Tracks records visited by one unit and decides when a progress line or a
/// liveness probe is due.
///
/// The probe and progress clocks are independent: a probe never resets the
/// progress window and vice versa.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    unit: ProcessingUnit,
    interval: Option<Duration>,
    poll: Duration,
    last_progress: Instant,
    last_probe: Instant,
    total: u64,
    since_last: u64,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(unit: ProcessingUnit, config: &VerifyConfig, now: Instant) -> Self {
        Self {
            unit,
            interval: config.progress_interval(),
            poll: config.liveness_poll_interval(),
            last_progress: now,
            last_probe: now,
            total: 0,
            since_last: 0,
        }
    }

    #[must_use]
    pub const fn unit(&self) -> ProcessingUnit {
        self.unit
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Count one visited record.
    pub fn record(&mut self) {
        self.total += 1;
        self.since_last += 1;
    }

    /// Whether the liveness probe should run now. Restarts the probe clock
    /// when it returns true.
    pub fn probe_due(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_probe) >= self.poll {
            self.last_probe = now;
            return true;
        }
        false
    }

    /// Progress line text (without `!`) when one is due.
    pub fn progress_due(&mut self, now: Instant) -> Option<String> {
        let interval = self.interval?;
        if now.saturating_duration_since(self.last_progress) < interval {
            return None;
        }
        let rate = self.since_last / interval.as_secs().max(1);
        let line = format!(
            "verifying {}, did {} records, {} per second",
            self.unit, self.total, rate
        );
        self.last_progress = now;
        self.since_last = 0;
        Some(line)
    }
}
