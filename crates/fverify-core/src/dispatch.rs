//! Work dispatch for a verification run.
//!
//! A run is split into [`ProcessingUnit`]s: one per data stripe, one per
//! index, one per blob column and blob stripe. Sequential dispatch runs them
//! in pass order under a single lock token and stops at the first failed
//! unit. Parallel dispatch pushes every unit onto a shared injector queue
//! drained by scoped worker threads; each unit runs under its own lock token
//! and a failed unit does not stop the others.

use std::thread;
use std::time::Instant;

use crossbeam_deque::{Injector, Steal};
use fverify_engine::{LockToken, StorageEngine};
use fverify_error::{Result, VerifyError};
use fverify_types::{Cx, ProcessingUnit, TableSchema};
use tracing::{debug, info, warn};

use crate::config::VerifyConfig;
use crate::context::{UnitOutcome, VerifyContext};
use crate::format::RecordFormat;
use crate::report::VerifyReport;
use crate::sink::OutputSink;
use crate::{pass_blob, pass_data, pass_index};

/// A lock token released when dropped.
struct LockScope<'e, E: StorageEngine> {
    engine: &'e E,
    token: LockToken,
}

impl<'e, E: StorageEngine> LockScope<'e, E> {
    /// Acquire a token under the engine-wide read lock.
    fn acquire(engine: &'e E) -> Result<Self> {
        let token = {
            let _guard = engine.read_lock();
            engine.acquire_lock_token()?
        };
        debug!(token = token.0, "lock token acquired");
        Ok(Self { engine, token })
    }
}

impl<E: StorageEngine> Drop for LockScope<'_, E> {
    fn drop(&mut self) {
        if let Err(err) = self.engine.release_lock_token(self.token) {
            warn!(token = self.token.0, error = %err, "lock token release failed");
        }
    }
}

/// Verify one table.
///
/// Data inconsistencies are findings: they are written to `sink` and
/// collected in the returned report. Operational failures of individual
/// units are also folded into the report. `Err` is returned only when the
/// run cannot start (invalid configuration or schema, no lock token).
pub fn verify<E, F>(
    engine: &E,
    schema: &TableSchema,
    format: &F,
    sink: &dyn OutputSink,
    config: &VerifyConfig,
    cx: &Cx,
) -> Result<VerifyReport>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    config.validate()?;
    schema.validate()?;

    let units = ProcessingUnit::enumerate(schema);
    let started = Instant::now();
    info!(
        table = %schema.name,
        units = units.len(),
        parallel = config.parallel,
        attempt_fix = config.attempt_fix,
        "verify started"
    );

    let ctx = VerifyContext::new(schema, format, sink, config, cx.clone());
    if config.parallel {
        run_parallel(&ctx, engine, &units)?;
    } else {
        run_sequential(&ctx, engine, &units)?;
    }

    let report = ctx.into_report(units.len());
    info!(
        table = %report.table,
        status = report.status.code(),
        findings = report.findings,
        records = report.records_visited,
        repairs = report.repairs,
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        "verify finished"
    );
    Ok(report)
}

fn run_sequential<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    units: &[ProcessingUnit],
) -> Result<()>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let scope = LockScope::acquire(engine)?;
    for &unit in units {
        if ctx.has_failures() || ctx.should_stop() {
            ctx.skip_unit(unit);
            continue;
        }
        let result = run_unit(ctx, engine, scope.token, unit);
        ctx.finish_unit(unit, result);
    }
    Ok(())
}

fn run_parallel<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    units: &[ProcessingUnit],
) -> Result<()>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let queue = Injector::new();
    for &unit in units {
        queue.push(unit);
    }
    let workers = ctx.config.worker_count().clamp(1, units.len().max(1));
    debug!(workers, units = units.len(), "starting verify workers");

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let queue = &queue;
                scope.spawn(move || drain(ctx, engine, queue, worker))
            })
            .collect();
        let panicked = handles
            .into_iter()
            .map(thread::ScopedJoinHandle::join)
            .filter(std::result::Result::is_err)
            .count();
        if panicked > 0 {
            ctx.mark_degraded();
            return Err(VerifyError::internal(format!(
                "{panicked} verify worker(s) panicked"
            )));
        }
        Ok(())
    })
}

/// Worker loop: take units until the queue is empty.
fn drain<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    queue: &Injector<ProcessingUnit>,
    worker: usize,
) where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    while let Some(unit) = steal(queue) {
        if ctx.should_stop() {
            ctx.skip_unit(unit);
            continue;
        }
        debug!(worker, unit = %unit, "unit picked up");
        let result = LockScope::acquire(engine)
            .and_then(|scope| run_unit(ctx, engine, scope.token, unit));
        ctx.finish_unit(unit, result);
    }
}

fn steal(queue: &Injector<ProcessingUnit>) -> Option<ProcessingUnit> {
    loop {
        match queue.steal() {
            Steal::Success(unit) => return Some(unit),
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}

fn run_unit<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    unit: ProcessingUnit,
) -> Result<UnitOutcome>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    match unit {
        ProcessingUnit::Data { stripe } => pass_data::verify_data_stripe(ctx, engine, token, stripe),
        ProcessingUnit::Index { index } => pass_index::verify_index(ctx, engine, token, index),
        ProcessingUnit::Blob { column, stripe } => {
            pass_blob::verify_blob_stripe(ctx, engine, token, column, stripe)
        }
    }
}
