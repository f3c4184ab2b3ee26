//! Point lookups shared by the passes.

use fverify_engine::{CursorOp, EngineCursor, Entry, FileId, LockToken, StorageEngine};
use fverify_error::Result;
use fverify_types::{Genid, IndexDescriptor};

use crate::format::{BlobBuffers, RecordFormat};

/// Exact-match fetch through a cursor that lives for this lookup only.
pub fn fetch_exact<E: StorageEngine>(
    engine: &E,
    token: LockToken,
    file: FileId,
    key: &[u8],
) -> Result<Option<Entry>> {
    let mut cursor = engine.open_cursor(file, token)?;
    let found = cursor.get(CursorOp::Set, Some(key))?;
    cursor.close()?;
    Ok(found)
}

/// Genid suffix an index key of `genid` must carry. Unique nullable indexes
/// collapse the suffix to zero when the key has no NULL.
pub fn expected_suffix<F: RecordFormat + ?Sized>(
    format: &F,
    descriptor: &IndexDescriptor,
    index: usize,
    genid: Genid,
    key: &[u8],
) -> Genid {
    if descriptor.nullable && !format.key_has_null(index, key) {
        Genid::ZERO
    } else {
        genid.masked()
    }
}

/// Fill `blobs` with the out-of-line rows a record declares with a length.
/// Absent rows are left empty; findings are not reported here.
pub fn load_blobs<E: StorageEngine, F: RecordFormat + ?Sized>(
    engine: &E,
    format: &F,
    token: LockToken,
    genid: Genid,
    payload: &[u8],
    stripe: u32,
    blobs: &mut BlobBuffers,
) -> Result<()> {
    blobs.clear();
    for (column, slot) in format.blob_layout(payload)?.iter().enumerate() {
        if slot.declared.allows_absence() {
            continue;
        }
        let file = FileId::Blob { column, stripe };
        if let Some(entry) = fetch_exact(engine, token, file, &genid.to_bytes())? {
            blobs.set(column, entry.value);
        }
    }
    Ok(())
}
