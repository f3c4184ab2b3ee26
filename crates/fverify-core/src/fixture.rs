//! Synthetic fixed-layout record format for tests and demos.
//!
//! Current-version (1) record layout:
//!
//! ```text
//! +-------+---------------------------+----------------------------+
//! | flags | blob field x blob_columns | key column x index_count   |
//! | 1 B   | tag (1 B) + len (4 B BE)  | u32 BE, 0xffffffff = NULL  |
//! +-------+---------------------------+----------------------------+
//! ```
//!
//! `flags` is the has-keys bitmap (so at most 8 indexes). Blob tags are
//! `0` NULL, `1` inline, `2` out-of-line with the given length. Version 0
//! records lack the flags byte and populate every index.
//!
//! When the table is built with [`FixtureTable::expression`], every index key
//! is followed by the first four bytes of blob column 0 (zero padded), so key
//! formation needs the blob buffers.

use fverify_engine::{FileId, MemEngine};
use fverify_error::{Result, VerifyError};
use fverify_types::{
    BlobSentinel, GENID_LEN, Genid, IndexDescriptor, IndexMask, IndexPayload, StripeLayout,
    TableSchema,
};
use smallvec::SmallVec;

use crate::format::{BlobBuffers, BlobLayout, BlobSlot, PackedDatacopy, RecordFormat};

pub const CURRENT_VERSION: u8 = 1;
pub const LEGACY_VERSION: u8 = 0;
/// Marker byte after the genid of a header-packed datacopy payload.
pub const PACK_MAGIC: u8 = 0xD0;

const FLAGS_WIDTH: usize = 1;
const BLOB_FIELD_WIDTH: usize = 5;
const KEY_WIDTH: usize = 4;
const NULL_KEY: [u8; KEY_WIDTH] = [0xFF; KEY_WIDTH];
const EXPRESSION_WIDTH: usize = 4;

const TAG_NULL: u8 = 0;
const TAG_INLINE: u8 = 1;
const TAG_STORED: u8 = 2;

/// Genid with update id zero.
#[must_use]
pub const fn genid(stamp: u64, stripe: u32) -> Genid {
    Genid::compose(stamp, 0, stripe)
}

/// Blob column value of a fixture record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureBlob {
    Null,
    Inline,
    Stored(Vec<u8>),
}

impl FixtureBlob {
    fn sentinel(&self) -> BlobSentinel {
        match self {
            Self::Null => BlobSentinel::Null,
            Self::Inline => BlobSentinel::Inline,
            Self::Stored(bytes) => BlobSentinel::Len(bytes.len() as u32),
        }
    }
}

/// Logical record, encoded by [`FixtureTable::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureRecord {
    pub genid: Genid,
    /// One value per index; `None` is NULL.
    pub keys: Vec<Option<u32>>,
    pub blobs: Vec<FixtureBlob>,
    pub has_keys: IndexMask,
}

impl FixtureRecord {
    /// Record populating every index, with no blob columns set.
    #[must_use]
    pub fn new(genid: Genid, keys: &[Option<u32>]) -> Self {
        Self {
            genid,
            keys: keys.to_vec(),
            blobs: Vec::new(),
            has_keys: IndexMask::all(keys.len()),
        }
    }

    #[must_use]
    pub fn with_blob(mut self, column: usize, blob: FixtureBlob) -> Self {
        if self.blobs.len() <= column {
            self.blobs.resize(column + 1, FixtureBlob::Null);
        }
        self.blobs[column] = blob;
        self
    }

    #[must_use]
    pub fn without_index(mut self, index: usize) -> Self {
        self.has_keys = self.has_keys.without(index);
        self
    }

    fn buffers(&self) -> BlobBuffers {
        let mut buffers = BlobBuffers::new(self.blobs.len());
        for (column, blob) in self.blobs.iter().enumerate() {
            if let FixtureBlob::Stored(bytes) = blob {
                buffers.set(column, bytes.clone());
            }
        }
        buffers
    }
}

/// The fixture [`RecordFormat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixtureFormat {
    blob_columns: usize,
    index_count: usize,
    expression: bool,
}

impl FixtureFormat {
    #[must_use]
    pub const fn record_len(blob_columns: usize, index_count: usize) -> usize {
        FLAGS_WIDTH + BLOB_FIELD_WIDTH * blob_columns + KEY_WIDTH * index_count
    }

    const fn blob_offset(column: usize) -> usize {
        FLAGS_WIDTH + BLOB_FIELD_WIDTH * column
    }

    const fn key_offset(&self, index: usize) -> usize {
        FLAGS_WIDTH + BLOB_FIELD_WIDTH * self.blob_columns + KEY_WIDTH * index
    }

    fn legacy_flags(&self) -> u8 {
        IndexMask::all(self.index_count).bits() as u8
    }
}

impl RecordFormat for FixtureFormat {
    fn translate_version(&self, payload: &mut Vec<u8>, version: u8) -> Result<()> {
        match version {
            CURRENT_VERSION => Ok(()),
            LEGACY_VERSION => {
                payload.insert(0, self.legacy_flags());
                Ok(())
            }
            other => Err(VerifyError::format(format!(
                "unknown record version {other}"
            ))),
        }
    }

    fn current_version(&self) -> u8 {
        CURRENT_VERSION
    }

    fn blob_layout(&self, payload: &[u8]) -> Result<BlobLayout> {
        let mut layout = SmallVec::new();
        for column in 0..self.blob_columns {
            let offset = Self::blob_offset(column);
            let field = payload
                .get(offset..offset + BLOB_FIELD_WIDTH)
                .ok_or_else(|| VerifyError::format(format!("record too short for blob {column}")))?;
            let len = u32::from_be_bytes([field[1], field[2], field[3], field[4]]);
            let declared = match field[0] {
                TAG_NULL => BlobSentinel::Null,
                TAG_INLINE => BlobSentinel::Inline,
                TAG_STORED => BlobSentinel::Len(len),
                tag => {
                    return Err(VerifyError::format(format!(
                        "blob {column} has bad tag {tag:#04x}"
                    )));
                }
            };
            layout.push(BlobSlot { declared, offset });
        }
        Ok(layout)
    }

    fn has_keys(&self, payload: &[u8], _blobs: &BlobBuffers) -> IndexMask {
        payload
            .first()
            .map_or_else(IndexMask::default, |flags| IndexMask::from_bits(u64::from(*flags)))
    }

    fn form_key(&self, payload: &[u8], blobs: &BlobBuffers, index: usize) -> Result<Vec<u8>> {
        if index >= self.index_count {
            return Err(VerifyError::format(format!("no key column for index {index}")));
        }
        let offset = self.key_offset(index);
        let column = payload
            .get(offset..offset + KEY_WIDTH)
            .ok_or_else(|| VerifyError::format(format!("record too short for index {index}")))?;
        let mut key = column.to_vec();
        if self.expression && self.blob_columns > 0 {
            let mut extra = [0_u8; EXPRESSION_WIDTH];
            if let Some(blob) = blobs.get(0) {
                let n = blob.len().min(EXPRESSION_WIDTH);
                extra[..n].copy_from_slice(&blob[..n]);
            }
            key.extend_from_slice(&extra);
        }
        Ok(key)
    }

    fn key_has_null(&self, _index: usize, key: &[u8]) -> bool {
        key.get(..KEY_WIDTH) == Some(&NULL_KEY[..])
    }

    fn is_expression_schema(&self, _table: &TableSchema) -> bool {
        self.expression
    }

    fn write_blob_field(
        &self,
        payload: &mut [u8],
        offset: usize,
        observed: Option<usize>,
    ) -> Result<()> {
        let field = payload
            .get_mut(offset..offset + BLOB_FIELD_WIDTH)
            .ok_or_else(|| VerifyError::format(format!("no blob field at offset {offset}")))?;
        match observed {
            None => field.copy_from_slice(&[TAG_NULL, 0, 0, 0, 0]),
            Some(len) => {
                let len = u32::try_from(len)
                    .map_err(|_| VerifyError::format(format!("blob length {len} too large")))?;
                field[0] = TAG_STORED;
                field[1..].copy_from_slice(&len.to_be_bytes());
            }
        }
        Ok(())
    }

    fn unpack_datacopy(&self, value: &[u8]) -> Result<PackedDatacopy> {
        let genid = Genid::from_prefix(value)
            .ok_or_else(|| VerifyError::format("packed datacopy shorter than a genid"))?;
        match value.get(GENID_LEN..GENID_LEN + 2) {
            Some([PACK_MAGIC, version]) => Ok(PackedDatacopy {
                genid,
                payload: value[GENID_LEN + 2..].to_vec(),
                version: *version,
            }),
            _ => Err(VerifyError::format("missing packed datacopy header")),
        }
    }
}

/// A table definition plus its fixture format, with helpers that write
/// consistent records into a [`MemEngine`].
#[derive(Debug, Clone)]
pub struct FixtureTable {
    pub schema: TableSchema,
    pub format: FixtureFormat,
}

impl FixtureTable {
    #[must_use]
    pub fn new(
        name: &str,
        layout: StripeLayout,
        blob_columns: usize,
        indexes: &[IndexDescriptor],
    ) -> Self {
        let mut schema = TableSchema::new(
            name,
            FixtureFormat::record_len(blob_columns, indexes.len()),
            layout,
        )
        .with_blob_columns(blob_columns);
        schema.indexes = indexes.to_vec();
        Self {
            schema,
            format: FixtureFormat {
                blob_columns,
                index_count: indexes.len(),
                expression: false,
            },
        }
    }

    /// Make every index key depend on blob column 0.
    #[must_use]
    pub const fn expression(mut self) -> Self {
        self.format.expression = true;
        self
    }

    /// Empty engine with every file of the table.
    #[must_use]
    pub fn engine(&self) -> MemEngine {
        MemEngine::for_schema(&self.schema)
    }

    /// Current-version payload.
    #[must_use]
    pub fn encode(&self, record: &FixtureRecord) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.schema.record_len);
        payload.push(record.has_keys.bits() as u8);
        for column in 0..self.format.blob_columns {
            let blob = record.blobs.get(column).unwrap_or(&FixtureBlob::Null);
            let (tag, len) = match blob.sentinel() {
                BlobSentinel::Null => (TAG_NULL, 0),
                BlobSentinel::Inline => (TAG_INLINE, 0),
                BlobSentinel::Len(len) => (TAG_STORED, len),
            };
            payload.push(tag);
            payload.extend_from_slice(&len.to_be_bytes());
        }
        for index in 0..self.format.index_count {
            match record.keys.get(index).copied().flatten() {
                Some(value) => payload.extend_from_slice(&value.to_be_bytes()),
                None => payload.extend_from_slice(&NULL_KEY),
            }
        }
        payload
    }

    /// Version-0 payload. Legacy records populate every index.
    #[must_use]
    pub fn encode_legacy(&self, record: &FixtureRecord) -> Vec<u8> {
        let mut payload = self.encode(record);
        payload.remove(0);
        payload
    }

    /// Full stored index key of `record` in `index`, suffix included.
    pub fn index_key(&self, record: &FixtureRecord, index: usize) -> Result<Vec<u8>> {
        let descriptor = self.schema.index(index)?;
        let mut key = self
            .format
            .form_key(&self.encode(record), &record.buffers(), index)?;
        if descriptor.key_contains_genid() {
            let suffix = if descriptor.nullable && !self.format.key_has_null(index, &key) {
                Genid::ZERO
            } else {
                record.genid.masked()
            };
            key.extend_from_slice(&suffix.to_bytes());
        }
        Ok(key)
    }

    /// Stored index payload of `record` in `index`.
    pub fn index_value(&self, record: &FixtureRecord, index: usize) -> Result<Vec<u8>> {
        let descriptor = self.schema.index(index)?;
        let mut value = record.genid.to_bytes().to_vec();
        match descriptor.payload {
            IndexPayload::Genid => {}
            IndexPayload::CollationAttrs { count } => {
                value.resize(GENID_LEN + fverify_types::COLLATTR_WIDTH * count, 0);
            }
            IndexPayload::Datacopy { packed: false } => {
                value.extend_from_slice(&self.encode(record));
            }
            IndexPayload::Datacopy { packed: true } => {
                value.extend_from_slice(&[PACK_MAGIC, CURRENT_VERSION]);
                value.extend_from_slice(&self.encode(record));
            }
        }
        Ok(value)
    }

    /// Write `record`, its blobs, and its index entries.
    pub fn insert(&self, engine: &MemEngine, record: &FixtureRecord) -> Result<()> {
        let layout = &self.schema.layout;
        let key = record.genid.to_bytes();
        let stripe = layout.data_stripe_of(record.genid)?;
        engine.put_versioned(
            FileId::Data { stripe },
            key,
            self.encode(record),
            CURRENT_VERSION,
        );
        for (column, blob) in record.blobs.iter().enumerate() {
            if let FixtureBlob::Stored(bytes) = blob {
                let stripe = layout.blob_stripe_of(record.genid)?;
                engine.put(FileId::Blob { column, stripe }, key, bytes.clone());
            }
        }
        for (index, descriptor) in self.schema.indexes.iter().enumerate() {
            if descriptor.conditional && !record.has_keys.contains(index) {
                continue;
            }
            engine.put(
                FileId::Index { index },
                self.index_key(record, index)?,
                self.index_value(record, index)?,
            );
        }
        Ok(())
    }
}
