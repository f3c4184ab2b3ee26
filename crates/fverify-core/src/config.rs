//! Run configuration.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use fverify_error::{Result, VerifyError};
use serde::{Deserialize, Serialize};

const MAX_WORKERS: usize = 256;
const MAX_PROGRESS_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Options for one verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Dispatch units onto a worker pool instead of running them in order.
    pub parallel: bool,
    /// Worker threads for parallel dispatch. `0` uses available parallelism.
    pub workers: usize,
    /// Seconds between progress lines. `0` disables progress.
    pub progress_interval_secs: u64,
    /// Rewrite blob-length fields that disagree with the blob store.
    pub attempt_fix: bool,
    /// Minimum milliseconds between client liveness probes. `0` probes on
    /// every record.
    pub liveness_poll_interval_ms: u64,
    /// Whether expression indexes are enabled on this server. When they are,
    /// the index pass re-fetches blobs for tables that carry them.
    pub expression_indexes: bool,
    /// Findings kept in the run report. Further findings are still counted
    /// and written to the sink.
    pub max_recorded_findings: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            workers: 0,
            progress_interval_secs: 0,
            attempt_fix: false,
            liveness_poll_interval_ms: 1000,
            expression_indexes: true,
            max_recorded_findings: 10_000,
        }
    }
}

impl VerifyConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| VerifyError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers > MAX_WORKERS {
            return Err(VerifyError::config(format!(
                "workers must be at most {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.progress_interval_secs > MAX_PROGRESS_INTERVAL_SECS {
            return Err(VerifyError::config(format!(
                "progress_interval_secs must be at most {MAX_PROGRESS_INTERVAL_SECS}, got {}",
                self.progress_interval_secs
            )));
        }
        Ok(())
    }

    /// Effective worker count for parallel dispatch.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism().map_or(1, NonZeroUsize::get)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }

    #[must_use]
    pub const fn liveness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_interval_ms)
    }
}
