//! Pass 3: blob rows against their owning records.

use fverify_engine::{CursorOp, EngineCursor, FileId, LockToken, StorageEngine};
use fverify_error::{Result, VerifyError};
use fverify_types::{Genid, ProcessingUnit};
use tracing::{info, trace, warn};

use crate::context::{Flow, UnitOutcome, VerifyContext};
use crate::format::RecordFormat;
use crate::lookup::fetch_exact;
use crate::report::Inconsistency;

/// Verify every row of one blob column in one blob stripe.
pub fn verify_blob_stripe<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    column: usize,
    stripe: u32,
) -> Result<UnitOutcome>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let unit = ProcessingUnit::Blob { column, stripe };
    ctx.cx().checkpoint()?;
    info!(table = %ctx.schema.name, column, stripe, "verifying blob stripe");

    let mut cursor = match engine.open_cursor(FileId::Blob { column, stripe }, token) {
        Ok(cursor) => cursor,
        Err(VerifyError::NoSuchFile { target }) => {
            warn!(%target, "blob stripe missing from store");
            ctx.report(Inconsistency::MissingBlobFile { column, stripe });
            return Ok(UnitOutcome::Completed);
        }
        Err(err) => return Err(err),
    };
    let layout = &ctx.schema.layout;
    let mut tracker = ctx.tracker(unit);
    let mut next = cursor.get(CursorOp::First, None)?;

    while let Some(row) = next {
        if ctx.checkpoint(&mut tracker)? == Flow::Stop {
            return Ok(UnitOutcome::ClientDropped);
        }
        next = cursor.get(CursorOp::Next, None)?;

        let Some(genid) = Genid::from_exact(&row.key) else {
            ctx.report(Inconsistency::BadGenidSize { len: row.key.len() });
            continue;
        };
        let Ok(data_stripe) = layout.data_stripe_of(genid) else {
            ctx.report(Inconsistency::UnknownDataFile { genid });
            continue;
        };
        trace!(%genid, column, stripe, data_stripe, "checking blob row");

        if layout.blob_aligned(genid) && data_stripe != stripe {
            ctx.report(Inconsistency::StripeMismatch {
                genid,
                blob_stripe: stripe,
                data_stripe,
            });
        }

        match fetch_exact(engine, token, FileId::Data { stripe: data_stripe }, &row.key) {
            Ok(Some(_)) => {}
            Ok(None) => ctx.report(Inconsistency::OrphanedBlob { genid, column }),
            Err(err) => ctx.report(Inconsistency::RecordFetchFailed {
                genid,
                index: None,
                detail: err.to_string(),
            }),
        }
    }

    cursor.close()?;
    info!(table = %ctx.schema.name, column, stripe, rows = tracker.total(), "blob stripe verified");
    Ok(UnitOutcome::Completed)
}
