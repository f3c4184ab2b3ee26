//! Pass 1: records against their blob rows and index entries.
//!
//! One unit scans one data stripe in key order. For every record the blob
//! layout and index keys are re-derived from the payload and looked up.
//! Mismatches are reported and the scan continues; storage failures end the
//! unit with an error.

use fverify_engine::{CursorOp, EngineCursor, FileId, LockToken, StorageEngine};
use fverify_error::Result;
use fverify_types::{BlobSentinel, Genid, ProcessingUnit};
use smallvec::SmallVec;
use tracing::{info, trace};

use crate::context::{Flow, UnitOutcome, VerifyContext};
use crate::format::{BlobBuffers, BlobLayout, RecordFormat};
use crate::lookup::{expected_suffix, fetch_exact};
use crate::repair::{self, ColumnFix, Resume};
use crate::report::Inconsistency;

/// Observed blob state of one record.
#[derive(Debug, Default)]
pub(crate) struct BlobCheck {
    /// Out-of-line length per column, `None` when absent or unreadable.
    pub observed: SmallVec<[Option<usize>; 16]>,
    pub erroneous: SmallVec<[bool; 16]>,
    /// Some column could not be read at all. Blocks repair.
    pub irrecoverable: bool,
}

impl BlobCheck {
    pub fn repairable(&self) -> bool {
        !self.irrecoverable && self.erroneous.iter().any(|bad| *bad)
    }

    /// One fix per erroneous column.
    pub fn fixes(&self, layout: &BlobLayout) -> SmallVec<[ColumnFix; 16]> {
        layout
            .iter()
            .enumerate()
            .filter(|(column, _)| self.erroneous.get(*column).copied().unwrap_or(false))
            .map(|(column, slot)| ColumnFix {
                column,
                offset: slot.offset,
                observed: self.observed.get(column).copied().flatten(),
            })
            .collect()
    }
}

/// Verify every record of one data stripe.
pub fn verify_data_stripe<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    stripe: u32,
) -> Result<UnitOutcome>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let unit = ProcessingUnit::Data { stripe };
    ctx.cx().checkpoint()?;
    info!(table = %ctx.schema.name, stripe, "verifying data stripe");

    let mut tracker = ctx.tracker(unit);
    let mut blobs = BlobBuffers::new(ctx.schema.blob_columns);
    let mut cursor = engine.open_cursor(FileId::Data { stripe }, token)?;
    let mut op = CursorOp::First;

    while let Some(entry) = cursor.get(op, None)? {
        op = CursorOp::Next;
        if ctx.checkpoint(&mut tracker)? == Flow::Stop {
            return Ok(UnitOutcome::ClientDropped);
        }

        let Some(genid) = Genid::from_exact(&entry.key) else {
            ctx.report(Inconsistency::BadGenidSize {
                len: entry.key.len(),
            });
            continue;
        };
        trace!(%genid, stripe, "checking record");

        let mut payload = entry.value;
        if let Err(err) = ctx.format.translate_version(&mut payload, entry.version) {
            ctx.report(Inconsistency::VersionTranslateFailed {
                genid,
                detail: err.to_string(),
            });
            continue;
        }

        blobs.clear();
        match ctx.format.blob_layout(&payload) {
            Err(err) => ctx.report(Inconsistency::BlobLayoutFailed {
                genid,
                detail: err.to_string(),
            }),
            Ok(layout) => {
                let check = check_blobs(ctx, engine, token, genid, &layout, &mut blobs)?;
                if ctx.config.attempt_fix && check.repairable() {
                    let fixes = check.fixes(&layout);
                    let (resumed, resume) =
                        repair::repair_record(ctx, engine, token, cursor, genid, &fixes)?;
                    cursor = resumed;
                    if resume == Resume::BeforeFirst {
                        op = CursorOp::First;
                    }
                }
            }
        }

        check_indexes(ctx, engine, token, genid, &payload, &blobs)?;
    }

    cursor.close()?;
    info!(table = %ctx.schema.name, stripe, records = tracker.total(), "data stripe verified");
    Ok(UnitOutcome::Completed)
}

/// Reconcile every blob column of a record with the blob store.
pub(crate) fn check_blobs<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    genid: Genid,
    layout: &BlobLayout,
    blobs: &mut BlobBuffers,
) -> Result<BlobCheck>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let mut check = BlobCheck::default();
    if layout.is_empty() {
        return Ok(check);
    }
    let stripe = match ctx.schema.layout.blob_stripe_of(genid) {
        Ok(stripe) => stripe,
        Err(err) => {
            ctx.report(Inconsistency::UnknownDataFile { genid });
            return Err(err);
        }
    };
    let key = genid.to_bytes();

    for (column, slot) in layout.iter().enumerate() {
        let mut cursor = engine.open_cursor(FileId::Blob { column, stripe }, token)?;
        let fetched = cursor.get(CursorOp::Set, Some(&key));
        cursor.close()?;

        let (observed, erroneous) = match fetched {
            Err(err) => {
                ctx.report(Inconsistency::BlobFetchFailed {
                    genid,
                    column,
                    detail: err.to_string(),
                });
                check.irrecoverable = true;
                (None, true)
            }
            Ok(None) => match slot.declared {
                BlobSentinel::Len(expected) => {
                    ctx.report(Inconsistency::MissingBlob {
                        genid,
                        column,
                        expected,
                    });
                    (None, true)
                }
                BlobSentinel::Null | BlobSentinel::Inline => (None, false),
            },
            Ok(Some(row)) => {
                let size = row.value.len();
                let erroneous = match slot.declared {
                    BlobSentinel::Null => {
                        ctx.report(Inconsistency::BlobNotNull { genid, column });
                        true
                    }
                    BlobSentinel::Inline => {
                        ctx.report(Inconsistency::BlobNotInline {
                            genid,
                            column,
                            size,
                        });
                        true
                    }
                    BlobSentinel::Len(expected) if expected as usize != size => {
                        ctx.report(Inconsistency::BlobSizeMismatch {
                            genid,
                            column,
                            got: size,
                            expected,
                        });
                        true
                    }
                    BlobSentinel::Len(_) => false,
                };
                if matches!(slot.declared, BlobSentinel::Len(_)) {
                    blobs.set(column, row.value);
                }
                (Some(size), erroneous)
            }
        };
        check.observed.push(observed);
        check.erroneous.push(erroneous);
    }
    Ok(check)
}

/// Probe every index for the key the record should have produced.
fn check_indexes<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    genid: Genid,
    payload: &[u8],
    blobs: &BlobBuffers,
) -> Result<()>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let has_keys = ctx.format.has_keys(payload, blobs);

    for (index, descriptor) in ctx.schema.indexes.iter().enumerate() {
        let populated = !descriptor.conditional || has_keys.contains(index);
        let mut key = match ctx.format.form_key(payload, blobs, index) {
            Ok(key) => key,
            Err(err) => {
                ctx.report(Inconsistency::FormKeyFailed {
                    genid,
                    index,
                    detail: err.to_string(),
                });
                continue;
            }
        };
        if descriptor.key_contains_genid() {
            let suffix = expected_suffix(ctx.format, descriptor, index, genid, &key);
            key.extend_from_slice(&suffix.to_bytes());
        }

        let hit = fetch_exact(engine, token, FileId::Index { index }, &key)?;
        match (populated, hit) {
            (false, None) => {}
            (false, Some(entry)) => {
                // A unique index may legitimately hold another record's key.
                let owner = Genid::from_prefix(&entry.value);
                if descriptor.dups || owner == Some(genid) {
                    ctx.report(Inconsistency::UnexpectedIndexEntry { genid, index });
                }
            }
            (true, None) => ctx.report(Inconsistency::MissingKey { genid, index }),
            (true, Some(entry)) => match Genid::from_prefix(&entry.value) {
                Some(found) if found == genid => {}
                Some(found) => ctx.report(Inconsistency::GenidMismatch {
                    genid,
                    index,
                    found,
                }),
                None => ctx.report(Inconsistency::UnexpectedLength {
                    index,
                    len: entry.value.len(),
                }),
            },
        }
    }
    Ok(())
}
