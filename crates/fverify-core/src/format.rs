//! Pluggable record-format seam.
//!
//! The verifier knows nothing about column layouts. Everything that depends
//! on how a record is encoded (version translation, blob sentinels, index key
//! formation) is delegated to a [`RecordFormat`] supplied per run.

use fverify_error::{Result, VerifyError};
use fverify_types::{BlobSentinel, Genid, IndexMask, TableSchema};
use smallvec::SmallVec;

/// Declared state of one blob column inside a record, plus where its inline
/// field lives so the repair path can rewrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobSlot {
    pub declared: BlobSentinel,
    /// Byte offset of the inline field within the translated payload.
    pub offset: usize,
}

/// Per-record blob layout, one slot per blob column.
pub type BlobLayout = SmallVec<[BlobSlot; 16]>;

/// Scratch buffers holding the verified bytes of each blob column of the
/// record currently being checked. Index key formation may read them.
#[derive(Debug, Clone, Default)]
pub struct BlobBuffers {
    columns: SmallVec<[Option<Vec<u8>>; 4]>,
}

impl BlobBuffers {
    #[must_use]
    pub fn new(columns: usize) -> Self {
        Self {
            columns: SmallVec::from_elem(None, columns),
        }
    }

    pub fn set(&mut self, column: usize, bytes: Vec<u8>) {
        if column >= self.columns.len() {
            self.columns.resize(column + 1, None);
        }
        self.columns[column] = Some(bytes);
    }

    #[must_use]
    pub fn get(&self, column: usize) -> Option<&[u8]> {
        self.columns.get(column).and_then(Option::as_deref)
    }

    /// Forget every buffered blob, keeping the column count.
    pub fn clear(&mut self) {
        for slot in &mut self.columns {
            *slot = None;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.iter().all(Option::is_none)
    }
}

/// Unpacked form of a header-packed datacopy payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedDatacopy {
    pub genid: Genid,
    pub payload: Vec<u8>,
    /// Version tag the embedded payload was written with.
    pub version: u8,
}

/// Format-specific callbacks the verifier uses to derive expected state
/// from raw record bytes.
pub trait RecordFormat: Send + Sync {
    /// Upgrade `payload`, written with format `version`, to the current
    /// layout in place. Blob offsets and key formation assume the result.
    fn translate_version(&self, payload: &mut Vec<u8>, version: u8) -> Result<()>;

    /// Version tag written back by the repair path.
    fn current_version(&self) -> u8;

    /// Declared blob state of a translated payload.
    fn blob_layout(&self, payload: &[u8]) -> Result<BlobLayout>;

    /// Which indexes this record populates.
    fn has_keys(&self, payload: &[u8], blobs: &BlobBuffers) -> IndexMask;

    /// Expected key of `index` for this record, without a genid suffix.
    fn form_key(&self, payload: &[u8], blobs: &BlobBuffers, index: usize) -> Result<Vec<u8>>;

    /// Whether a formed key of `index` contains a NULL column value.
    fn key_has_null(&self, index: usize, key: &[u8]) -> bool;

    /// Whether the table has expression indexes whose keys may read blobs.
    fn is_expression_schema(&self, _table: &TableSchema) -> bool {
        false
    }

    /// Rewrite the inline blob field at `offset`: NULL when `observed` is
    /// `None`, otherwise the observed out-of-line length.
    fn write_blob_field(&self, payload: &mut [u8], offset: usize, observed: Option<usize>)
    -> Result<()>;

    /// Decode a header-packed datacopy index payload.
    fn unpack_datacopy(&self, _value: &[u8]) -> Result<PackedDatacopy> {
        Err(VerifyError::Unsupported(
            "format does not support packed datacopy payloads".to_owned(),
        ))
    }
}
