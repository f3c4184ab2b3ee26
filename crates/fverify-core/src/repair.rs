//! Transactional rewrite of blob-length fields.
//!
//! A repair moves the data scan through three phases:
//!
//! 1. **Scanning** → the read-only scan cursor is closed,
//! 2. **Repairing** → a transaction rewrites the inline blob fields of one
//!    record and commits (or aborts), then the commit waits for quorum,
//! 3. **Resuming** → a fresh scan cursor is positioned at or before the
//!    repaired genid.
//!
//! The resume step runs whatever the repair's outcome. A failed repair is
//! logged and marks the run degraded; it does not end the unit. A committed
//! repair counts even if quorum never acknowledges it, but the run is then
//! degraded too.

use fverify_engine::{CommitToken, CursorOp, EngineCursor, FileId, LockToken, StorageEngine};
use fverify_error::{Result, VerifyError};
use fverify_types::Genid;
use tracing::{debug, error, warn};

use crate::context::VerifyContext;
use crate::format::RecordFormat;

/// Rewrite of one blob column's inline field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnFix {
    pub column: usize,
    pub offset: usize,
    /// Observed out-of-line length; `None` writes NULL.
    pub observed: Option<usize>,
}

/// Where a restored scan cursor sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// On a key at or before the target; continue with `Next`.
    Positioned,
    /// Every remaining key is after the target; continue with `First`.
    BeforeFirst,
}

/// Repair one record's blob-length fields and hand back a scan cursor.
pub fn repair_record<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    cursor: E::Cursor,
    genid: Genid,
    fixes: &[ColumnFix],
) -> Result<(E::Cursor, Resume)>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let file = cursor.file();
    cursor.close()?;

    match apply_fixes(engine, ctx.format, file, genid, fixes) {
        Ok(commit) => {
            ctx.note_repair(genid);
            warn!(%genid, %file, columns = fixes.len(), seqno = commit.seqno, "rewrote blob length fields");
            // The rewrite is durable locally even when replicas never confirm it.
            if let Err(err) = engine.wait_for_quorum(&commit) {
                ctx.mark_degraded();
                error!(%genid, seqno = commit.seqno, error = %err, "blob length repair not acknowledged");
            }
        }
        Err(err) => {
            ctx.mark_degraded();
            error!(%genid, %file, error = %err, "blob length repair failed");
        }
    }

    restore_cursor_at_genid(engine, file, token, genid)
}

/// Run the repair transaction up to its commit.
fn apply_fixes<E, F>(
    engine: &E,
    format: &F,
    file: FileId,
    genid: Genid,
    fixes: &[ColumnFix],
) -> Result<CommitToken>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let txn = engine.begin()?;
    match patch_record(engine, format, &txn, file, genid, fixes) {
        Ok(()) => engine.commit(txn),
        Err(err) => {
            if let Err(abort_err) = engine.abort(txn) {
                warn!(%genid, error = %abort_err, "repair transaction abort failed");
            }
            Err(err)
        }
    }
}

fn patch_record<E, F>(
    engine: &E,
    format: &F,
    txn: &E::Txn,
    file: FileId,
    genid: Genid,
    fixes: &[ColumnFix],
) -> Result<()>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let mut cursor = engine.open_txn_cursor(txn, file)?;
    let Some(entry) = cursor.get(CursorOp::Set, Some(&genid.to_bytes()))? else {
        // Deleted between the scan and the repair.
        return Err(VerifyError::Busy { genid: genid.get() });
    };
    let mut payload = entry.value;
    format.translate_version(&mut payload, entry.version)?;
    for fix in fixes {
        debug!(%genid, column = fix.column, observed = ?fix.observed, "patching blob field");
        format.write_blob_field(&mut payload, fix.offset, fix.observed)?;
    }
    cursor.put_current(&payload, format.current_version())?;
    cursor.close()
}

/// Open a scan cursor on `file` positioned at the greatest key not after
/// `genid`. The scan may revisit records but never skips one.
pub fn restore_cursor_at_genid<E: StorageEngine>(
    engine: &E,
    file: FileId,
    token: LockToken,
    genid: Genid,
) -> Result<(E::Cursor, Resume)> {
    let mut cursor = engine.open_cursor(file, token)?;
    let target = genid.to_bytes();

    let Some(mut current) = cursor.get(CursorOp::SetRange, Some(&target))? else {
        let resume = if cursor.get(CursorOp::Last, None)?.is_some() {
            Resume::Positioned
        } else {
            Resume::BeforeFirst
        };
        return Ok((cursor, resume));
    };
    while current.key.as_slice() > &target[..] {
        match cursor.get(CursorOp::Prev, None)? {
            Some(entry) => current = entry,
            None => return Ok((cursor, Resume::BeforeFirst)),
        }
    }
    Ok((cursor, Resume::Positioned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fverify_engine::MemEngine;

    const DATA: FileId = FileId::Data { stripe: 0 };

    fn engine_with(stamps: &[u64]) -> MemEngine {
        let engine = MemEngine::new();
        engine.create_file(DATA);
        for stamp in stamps {
            engine.put(DATA, Genid::compose(*stamp, 0, 0).to_bytes(), vec![0]);
        }
        engine
    }

    fn next_stamp(cursor: &mut <MemEngine as StorageEngine>::Cursor, resume: Resume) -> Option<u64> {
        let op = match resume {
            Resume::Positioned => CursorOp::Next,
            Resume::BeforeFirst => CursorOp::First,
        };
        cursor
            .get(op, None)
            .unwrap()
            .map(|e| Genid::from_exact(&e.key).unwrap().stamp())
    }

    #[test]
    fn restores_onto_existing_genid() {
        let engine = engine_with(&[1, 2, 3]);
        let token = engine.acquire_lock_token().unwrap();
        let (mut cursor, resume) =
            restore_cursor_at_genid(&engine, DATA, token, Genid::compose(2, 0, 0)).unwrap();
        assert_eq!(resume, Resume::Positioned);
        assert_eq!(next_stamp(&mut cursor, resume), Some(3));
    }

    #[test]
    fn restores_before_deleted_genid() {
        let engine = engine_with(&[1, 3]);
        let token = engine.acquire_lock_token().unwrap();
        let (mut cursor, resume) =
            restore_cursor_at_genid(&engine, DATA, token, Genid::compose(2, 0, 0)).unwrap();
        assert_eq!(resume, Resume::Positioned);
        assert_eq!(next_stamp(&mut cursor, resume), Some(3));
    }

    #[test]
    fn restores_before_first_when_everything_is_later() {
        let engine = engine_with(&[5, 6]);
        let token = engine.acquire_lock_token().unwrap();
        let (mut cursor, resume) =
            restore_cursor_at_genid(&engine, DATA, token, Genid::compose(2, 0, 0)).unwrap();
        assert_eq!(resume, Resume::BeforeFirst);
        assert_eq!(next_stamp(&mut cursor, resume), Some(5));
    }

    #[test]
    fn restores_at_end_when_everything_is_earlier() {
        let engine = engine_with(&[1]);
        let token = engine.acquire_lock_token().unwrap();
        let (mut cursor, resume) =
            restore_cursor_at_genid(&engine, DATA, token, Genid::compose(9, 0, 0)).unwrap();
        assert_eq!(resume, Resume::Positioned);
        assert_eq!(next_stamp(&mut cursor, resume), None);
    }

    #[test]
    fn restores_on_empty_file() {
        let engine = engine_with(&[]);
        let token = engine.acquire_lock_token().unwrap();
        let (mut cursor, resume) =
            restore_cursor_at_genid(&engine, DATA, token, Genid::compose(1, 0, 0)).unwrap();
        assert_eq!(resume, Resume::BeforeFirst);
        assert_eq!(next_stamp(&mut cursor, resume), None);
    }
}
