//! Shared state of one verification run.
//!
//! A [`VerifyContext`] is created by the dispatcher, borrowed by every unit
//! (possibly from several workers at once), and folded into a
//! [`VerifyReport`] at the end. Flags and counters are atomics; the finding
//! list and failure list sit behind `parking_lot` mutexes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use fverify_error::{ErrorCode, Result, VerifyError};
use fverify_types::{Cx, Genid, ProcessingUnit, TableSchema};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::VerifyConfig;
use crate::format::RecordFormat;
use crate::progress::ProgressTracker;
use crate::report::{Inconsistency, UnitFailure, VerifyReport, VerifyStatus};
use crate::sink::OutputSink;

/// How a unit ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Scanned to the end.
    Completed,
    /// Stopped early because the client went away.
    ClientDropped,
}

/// Whether a scan may keep going after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Default)]
struct Counters {
    records: AtomicU64,
    findings: AtomicU64,
    repairs: AtomicU64,
    completed: AtomicU64,
    interrupted: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

pub struct VerifyContext<'a, F: RecordFormat + ?Sized> {
    pub schema: &'a TableSchema,
    pub format: &'a F,
    pub config: &'a VerifyConfig,
    sink: &'a dyn OutputSink,
    cx: Cx,
    found_inconsistency: AtomicBool,
    client_dropped: AtomicBool,
    degraded: AtomicBool,
    counters: Counters,
    inconsistencies: Mutex<Vec<Inconsistency>>,
    failures: Mutex<Vec<(UnitFailure, ErrorCode)>>,
}

impl<'a, F: RecordFormat + ?Sized> VerifyContext<'a, F> {
    pub fn new(
        schema: &'a TableSchema,
        format: &'a F,
        sink: &'a dyn OutputSink,
        config: &'a VerifyConfig,
        cx: Cx,
    ) -> Self {
        Self {
            schema,
            format,
            config,
            sink,
            cx,
            found_inconsistency: AtomicBool::new(false),
            client_dropped: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            counters: Counters::default(),
            inconsistencies: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn cx(&self) -> &Cx {
        &self.cx
    }

    /// Record a data inconsistency and write it to the sink.
    pub fn report(&self, finding: Inconsistency) {
        self.found_inconsistency.store(true, Ordering::Release);
        let seen = self.counters.findings.fetch_add(1, Ordering::AcqRel);
        debug!(%finding, "inconsistency");
        if let Err(err) = self.sink.write_line(&format!("!{finding}")) {
            trace!(%err, "sink rejected finding line");
        }
        if (seen as usize) < self.config.max_recorded_findings {
            self.inconsistencies.lock().push(finding);
        }
    }

    pub fn found_inconsistency(&self) -> bool {
        self.found_inconsistency.load(Ordering::Acquire)
    }

    pub fn client_dropped(&self) -> bool {
        self.client_dropped.load(Ordering::Acquire)
    }

    pub fn mark_client_dropped(&self) {
        self.client_dropped.store(true, Ordering::Release);
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    pub fn note_repair(&self, genid: Genid) {
        self.counters.repairs.fetch_add(1, Ordering::AcqRel);
        trace!(%genid, "repair counted");
    }

    /// Fresh progress tracker for `unit`.
    pub fn tracker(&self, unit: ProcessingUnit) -> ProgressTracker {
        ProgressTracker::new(unit, self.config, Instant::now())
    }

    /// Per-record checkpoint: counts the record, runs the liveness probe and
    /// host cancellation check at their cadence, and emits progress.
    pub fn checkpoint(&self, tracker: &mut ProgressTracker) -> Result<Flow> {
        tracker.record();
        self.counters.records.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        if tracker.probe_due(now) {
            self.cx.checkpoint()?;
            if self.client_dropped() || self.sink.client_dropped() {
                warn!(unit = %tracker.unit(), "client connection closed, stopped verify");
                self.mark_client_dropped();
                return Ok(Flow::Stop);
            }
        }

        if let Some(line) = tracker.progress_due(now) {
            let written = self
                .sink
                .write_line(&format!("!{line}"))
                .and_then(|()| self.sink.flush());
            if let Err(err) = written {
                warn!(unit = %tracker.unit(), %err, "progress write failed, stopped verify");
                self.mark_client_dropped();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Whether the dispatcher should stop handing out units.
    pub fn should_stop(&self) -> bool {
        self.client_dropped() || self.cx.is_cancelled()
    }

    /// Fold a unit's result into the run state.
    pub fn finish_unit(&self, unit: ProcessingUnit, result: Result<UnitOutcome>) {
        match result {
            Ok(UnitOutcome::Completed) => {
                self.counters.completed.fetch_add(1, Ordering::AcqRel);
                debug!(unit = %unit, "unit verified");
            }
            Ok(UnitOutcome::ClientDropped) => {
                self.counters.interrupted.fetch_add(1, Ordering::AcqRel);
                self.mark_client_dropped();
            }
            Err(err) => self.fail_unit(unit, &err),
        }
        if let Err(err) = self.sink.flush() {
            trace!(%err, "sink flush failed");
        }
    }

    pub fn fail_unit(&self, unit: ProcessingUnit, err: &VerifyError) {
        self.counters.failed.fetch_add(1, Ordering::AcqRel);
        self.mark_degraded();
        error!(unit = %unit, error = %err, code = ?err.error_code(), "verification unit failed");
        self.failures.lock().push((
            UnitFailure {
                unit,
                code: err.run_status_code(),
                message: err.to_string(),
            },
            err.error_code(),
        ));
    }

    pub fn skip_unit(&self, unit: ProcessingUnit) {
        self.counters.skipped.fetch_add(1, Ordering::AcqRel);
        trace!(unit = %unit, "unit skipped");
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.lock().is_empty()
    }

    /// Consume the context into the run summary.
    pub fn into_report(self, units_total: usize) -> VerifyReport {
        let failures = self.failures.into_inner();
        let found = self.found_inconsistency.load(Ordering::Acquire);
        let status = match failures.first() {
            Some((_, code)) => VerifyStatus::Failed(*code),
            None if found => VerifyStatus::Inconsistent,
            None => VerifyStatus::Clean,
        };
        VerifyReport {
            table: self.schema.name.clone(),
            status,
            units_total: units_total as u64,
            units_completed: self.counters.completed.load(Ordering::Acquire),
            units_interrupted: self.counters.interrupted.load(Ordering::Acquire),
            units_failed: self.counters.failed.load(Ordering::Acquire),
            units_skipped: self.counters.skipped.load(Ordering::Acquire),
            records_visited: self.counters.records.load(Ordering::Acquire),
            findings: self.counters.findings.load(Ordering::Acquire),
            inconsistencies: self.inconsistencies.into_inner(),
            repairs: self.counters.repairs.load(Ordering::Acquire),
            failures: failures.into_iter().map(|(failure, _)| failure).collect(),
            client_dropped: self.client_dropped.load(Ordering::Acquire),
            degraded: self.degraded.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::*;
    use crate::fixture::{FixtureTable, genid};
    use crate::sink::{CallbackSink, CollectSink};
    use fverify_types::{IndexDescriptor, StripeLayout};

    fn table() -> FixtureTable {
        FixtureTable::new("ctx", StripeLayout::new(1, 1), 0, &[IndexDescriptor::unique()])
    }

    #[test]
    fn report_prefixes_lines_and_caps_recording() {
        let table = table();
        let sink = CollectSink::new();
        let config = VerifyConfig {
            max_recorded_findings: 1,
            ..VerifyConfig::default()
        };
        let ctx = VerifyContext::new(&table.schema, &table.format, &sink, &config, Cx::new());
        assert!(!ctx.found_inconsistency());

        ctx.report(Inconsistency::OrphanedBlob {
            genid: genid(1, 0),
            column: 0,
        });
        ctx.report(Inconsistency::MissingKey {
            genid: genid(2, 0),
            index: 0,
        });
        assert!(ctx.found_inconsistency());
        assert_eq!(sink.lines()[0], "!0000000000010000 orphaned blob 0");

        let report = ctx.into_report(3);
        assert_eq!(report.findings, 2);
        assert_eq!(report.inconsistencies.len(), 1);
        assert_eq!(report.status, VerifyStatus::Inconsistent);
    }

    #[test]
    fn failed_progress_write_stops_the_unit() {
        let table = table();
        let sink = CallbackSink::new(|_: &str| Err(io::Error::other("gone")));
        let config = VerifyConfig {
            progress_interval_secs: 1,
            ..VerifyConfig::default()
        };
        let ctx = VerifyContext::new(&table.schema, &table.format, &sink, &config, Cx::new());
        let start = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .expect("monotonic clock older than two seconds");
        let mut tracker = ProgressTracker::new(ProcessingUnit::Data { stripe: 0 }, &config, start);

        assert_eq!(ctx.checkpoint(&mut tracker).expect("checkpoint"), Flow::Stop);
        assert!(ctx.client_dropped());
        assert!(ctx.should_stop());
    }

    #[test]
    fn cancellation_surfaces_at_probe() {
        let table = table();
        let sink = CollectSink::new();
        let config = VerifyConfig {
            liveness_poll_interval_ms: 0,
            ..VerifyConfig::default()
        };
        let cx = Cx::new();
        let ctx = VerifyContext::new(&table.schema, &table.format, &sink, &config, cx.clone());
        let mut tracker = ctx.tracker(ProcessingUnit::Index { index: 0 });
        assert_eq!(ctx.checkpoint(&mut tracker).expect("checkpoint"), Flow::Continue);

        cx.cancel();
        assert!(matches!(ctx.checkpoint(&mut tracker), Err(VerifyError::Cancelled)));
        assert!(ctx.should_stop());
    }

    #[test]
    fn failure_outranks_findings() {
        let table = table();
        let sink = CollectSink::new();
        let config = VerifyConfig::default();
        let ctx = VerifyContext::new(&table.schema, &table.format, &sink, &config, Cx::new());
        ctx.report(Inconsistency::MissingKey {
            genid: genid(1, 0),
            index: 0,
        });
        ctx.finish_unit(ProcessingUnit::Data { stripe: 0 }, Ok(UnitOutcome::Completed));
        ctx.finish_unit(ProcessingUnit::Index { index: 0 }, Err(VerifyError::Cancelled));
        ctx.skip_unit(ProcessingUnit::Blob { column: 0, stripe: 0 });

        let report = ctx.into_report(3);
        assert_eq!(report.status.code(), -4);
        assert_eq!(report.units_completed, 1);
        assert_eq!(report.units_failed, 1);
        assert_eq!(report.units_skipped, 1);
        assert!(report.degraded);
        assert_eq!(report.failures[0].unit, ProcessingUnit::Index { index: 0 });
    }
}
