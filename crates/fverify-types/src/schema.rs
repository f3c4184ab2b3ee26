//! Static table descriptors supplied by the schema layer.

use std::fmt;

use fverify_error::{Result, VerifyError};
use serde::{Deserialize, Serialize};

use crate::genid::{GENID_LEN, MAX_STRIPES, StripeLayout};

/// Maximum number of secondary indexes per table (one has-keys bit each).
pub const MAX_INDEXES: usize = 64;
/// Maximum number of blob columns per table.
pub const MAX_BLOB_COLUMNS: usize = 16;
/// Width of one collation attribute stored in an index payload.
pub const COLLATTR_WIDTH: usize = 4;

// ---------------------------------------------------------------------------
// Blob sentinel
// ---------------------------------------------------------------------------

/// Inline description of a blob column's out-of-line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobSentinel {
    /// SQL NULL: no out-of-line row may exist.
    Null,
    /// Stored inline in the record (short VUTF8): no out-of-line row.
    Inline,
    /// Exactly one out-of-line row of this byte length.
    Len(u32),
}

impl BlobSentinel {
    pub const NULL_RAW: i32 = -1;
    pub const INLINE_RAW: i32 = -2;

    /// Decode the raw `-1 / -2 / >=0` encoding.
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            Self::NULL_RAW => Ok(Self::Null),
            Self::INLINE_RAW => Ok(Self::Inline),
            n if n >= 0 => Ok(Self::Len(n.unsigned_abs())),
            n => Err(VerifyError::format(format!("invalid blob sentinel {n}"))),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i64 {
        match self {
            Self::Null => i64::from(Self::NULL_RAW),
            Self::Inline => i64::from(Self::INLINE_RAW),
            Self::Len(n) => i64::from(n),
        }
    }

    /// Whether this column may legitimately lack an out-of-line row.
    #[must_use]
    pub const fn allows_absence(self) -> bool {
        matches!(self, Self::Null | Self::Inline)
    }
}

impl fmt::Display for BlobSentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_raw())
    }
}

// ---------------------------------------------------------------------------
// Has-keys bitmap
// ---------------------------------------------------------------------------

/// Per-record bitmap of the indexes a record populates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexMask(u64);

impl IndexMask {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Mask with the low `count` bits set.
    #[must_use]
    pub const fn all(count: usize) -> Self {
        if count >= MAX_INDEXES {
            Self(u64::MAX)
        } else {
            Self((1_u64 << count) - 1)
        }
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, index: usize) -> bool {
        index < MAX_INDEXES && self.0 & (1_u64 << index) != 0
    }

    #[must_use]
    pub const fn with(self, index: usize) -> Self {
        if index >= MAX_INDEXES {
            return self;
        }
        Self(self.0 | (1_u64 << index))
    }

    #[must_use]
    pub const fn without(self, index: usize) -> Self {
        if index >= MAX_INDEXES {
            return self;
        }
        Self(self.0 & !(1_u64 << index))
    }
}

impl fmt::Debug for IndexMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexMask({:#b})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Index descriptor
// ---------------------------------------------------------------------------

/// What an index entry stores after the embedded genid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IndexPayload {
    /// Bare genid.
    Genid,
    /// Genid followed by `count` fixed-width collation attributes.
    CollationAttrs { count: usize },
    /// Full denormalized copy of the record. `packed` payloads carry an
    /// on-disk header and are decoded by the record format.
    Datacopy { packed: bool },
}

/// Static properties of one secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Duplicate key values allowed.
    pub dups: bool,
    /// Unique index over nullable columns (NULLs never collide).
    pub nullable: bool,
    /// Layout of the entry payload.
    pub payload: IndexPayload,
    /// Membership conditioned on the record's has-keys bitmap. When false,
    /// every record is expected to populate the index.
    pub conditional: bool,
}

impl IndexDescriptor {
    /// Plain unique index with a bare genid payload.
    #[must_use]
    pub const fn unique() -> Self {
        Self {
            dups: false,
            nullable: false,
            payload: IndexPayload::Genid,
            conditional: true,
        }
    }

    #[must_use]
    pub const fn with_dups(mut self) -> Self {
        self.dups = true;
        self
    }

    #[must_use]
    pub const fn with_nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub const fn with_payload(mut self, payload: IndexPayload) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub const fn unconditional(mut self) -> Self {
        self.conditional = false;
        self
    }

    /// Whether stored keys end with an 8-byte genid suffix.
    #[must_use]
    pub const fn key_contains_genid(&self) -> bool {
        self.dups || self.nullable
    }

    #[must_use]
    pub const fn is_datacopy(&self) -> bool {
        matches!(self.payload, IndexPayload::Datacopy { .. })
    }
}

impl Default for IndexDescriptor {
    fn default() -> Self {
        Self::unique()
    }
}

// ---------------------------------------------------------------------------
// Table schema
// ---------------------------------------------------------------------------

/// Everything the verifier needs to know about a table's physical shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    /// Fixed length of a current-version record payload.
    pub record_len: usize,
    /// Number of blob columns.
    pub blob_columns: usize,
    pub indexes: Vec<IndexDescriptor>,
    pub layout: StripeLayout,
}

impl TableSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, record_len: usize, layout: StripeLayout) -> Self {
        Self {
            name: name.into(),
            record_len,
            blob_columns: 0,
            indexes: Vec::new(),
            layout,
        }
    }

    #[must_use]
    pub fn with_blob_columns(mut self, count: usize) -> Self {
        self.blob_columns = count;
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    #[must_use]
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }

    pub fn index(&self, index: usize) -> Result<&IndexDescriptor> {
        self.indexes
            .get(index)
            .ok_or_else(|| VerifyError::schema(format!("no index {index} on {}", self.name)))
    }

    /// Expected size of an index entry payload (genid included).
    #[must_use]
    pub fn expected_payload_len(&self, index: &IndexDescriptor) -> Option<usize> {
        match index.payload {
            IndexPayload::Genid => Some(GENID_LEN),
            IndexPayload::CollationAttrs { count } => Some(GENID_LEN + COLLATTR_WIDTH * count),
            IndexPayload::Datacopy { packed: false } => Some(GENID_LEN + self.record_len),
            IndexPayload::Datacopy { packed: true } => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let layout = &self.layout;
        if layout.data_stripes == 0 || layout.data_stripes > MAX_STRIPES {
            return Err(VerifyError::schema(format!(
                "{}: data stripes must be in 1..={MAX_STRIPES}, got {}",
                self.name, layout.data_stripes
            )));
        }
        if layout.blob_stripes > MAX_STRIPES {
            return Err(VerifyError::schema(format!(
                "{}: blob stripes must be at most {MAX_STRIPES}, got {}",
                self.name, layout.blob_stripes
            )));
        }
        if self.blob_columns > 0 && layout.blob_stripes == 0 {
            return Err(VerifyError::schema(format!(
                "{}: {} blob columns but no blob stripes",
                self.name, self.blob_columns
            )));
        }
        if self.blob_columns > 0 && layout.blob_stripes < layout.data_stripes {
            return Err(VerifyError::schema(format!(
                "{}: {} blob stripes cannot hold blobs aligned with {} data stripes",
                self.name, layout.blob_stripes, layout.data_stripes
            )));
        }
        if self.blob_columns > MAX_BLOB_COLUMNS {
            return Err(VerifyError::schema(format!(
                "{}: at most {MAX_BLOB_COLUMNS} blob columns supported, got {}",
                self.name, self.blob_columns
            )));
        }
        if self.indexes.len() > MAX_INDEXES {
            return Err(VerifyError::schema(format!(
                "{}: at most {MAX_INDEXES} indexes supported, got {}",
                self.name,
                self.indexes.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genid::Genid;

    #[test]
    fn sentinel_raw_encoding() {
        assert_eq!(BlobSentinel::from_raw(-1).unwrap(), BlobSentinel::Null);
        assert_eq!(BlobSentinel::from_raw(-2).unwrap(), BlobSentinel::Inline);
        assert_eq!(BlobSentinel::from_raw(10).unwrap(), BlobSentinel::Len(10));
        assert!(BlobSentinel::from_raw(-3).is_err());
        assert_eq!(BlobSentinel::Len(10).to_string(), "10");
        assert_eq!(BlobSentinel::Null.to_string(), "-1");
        assert!(BlobSentinel::Inline.allows_absence());
        assert!(!BlobSentinel::Len(0).allows_absence());
    }

    #[test]
    fn index_mask_bits() {
        let mask = IndexMask::default().with(0).with(3);
        assert!(mask.contains(0));
        assert!(!mask.contains(1));
        assert!(mask.contains(3));
        assert!(!mask.without(3).contains(3));
        assert!(!mask.contains(64));
        assert_eq!(IndexMask::all(3).bits(), 0b111);
        assert_eq!(IndexMask::all(64).bits(), u64::MAX);
    }

    #[test]
    fn genid_suffix_rules() {
        assert!(!IndexDescriptor::unique().key_contains_genid());
        assert!(IndexDescriptor::unique().with_dups().key_contains_genid());
        assert!(IndexDescriptor::unique().with_nullable().key_contains_genid());
    }

    #[test]
    fn payload_sizes() {
        let schema = TableSchema::new("t", 12, StripeLayout::new(1, 1));
        let bare = IndexDescriptor::unique();
        let coll = bare.with_payload(IndexPayload::CollationAttrs { count: 2 });
        let copy = bare.with_payload(IndexPayload::Datacopy { packed: false });
        let packed = bare.with_payload(IndexPayload::Datacopy { packed: true });
        assert_eq!(schema.expected_payload_len(&bare), Some(8));
        assert_eq!(schema.expected_payload_len(&coll), Some(16));
        assert_eq!(schema.expected_payload_len(&copy), Some(20));
        assert_eq!(schema.expected_payload_len(&packed), None);
    }

    #[test]
    fn validate_limits() {
        let ok = TableSchema::new("t", 8, StripeLayout::new(2, 2)).with_blob_columns(2);
        assert!(ok.validate().is_ok());

        let no_stripes = TableSchema::new("t", 8, StripeLayout::new(0, 0));
        assert!(no_stripes.validate().is_err());

        let blobs_without_stripes =
            TableSchema::new("t", 8, StripeLayout::new(1, 0)).with_blob_columns(1);
        assert!(blobs_without_stripes.validate().is_err());

        let fewer_blob_stripes =
            TableSchema::new("t", 8, StripeLayout::new(2, 1)).with_blob_columns(1);
        let err = fewer_blob_stripes.validate().unwrap_err();
        assert!(err.to_string().contains("1 blob stripes"), "{err}");
        let watermarked = StripeLayout::new(3, 2).with_watermark(Genid::compose(100, 0, 0));
        assert!(TableSchema::new("t", 8, watermarked).with_blob_columns(1).validate().is_err());
        // Without blob columns the blob stripe count is irrelevant.
        assert!(TableSchema::new("t", 8, StripeLayout::new(2, 1)).validate().is_ok());
        assert!(TableSchema::new("t", 8, StripeLayout::new(1, 2)).with_blob_columns(1).validate().is_ok());

        let mut too_many = TableSchema::new("t", 8, StripeLayout::new(1, 1));
        too_many.indexes = vec![IndexDescriptor::unique(); MAX_INDEXES + 1];
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn schema_serializes_to_json() {
        let schema = TableSchema::new("t", 8, StripeLayout::new(1, 1)).with_index(
            IndexDescriptor::unique().with_payload(IndexPayload::CollationAttrs { count: 1 }),
        );
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("\"kind\":\"collation_attrs\""));
        let back: TableSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
    }
}
