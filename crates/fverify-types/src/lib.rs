//! Core type definitions shared by the FrankenVerify crates.
//!
//! Nothing here performs I/O. The storage-engine and record-format seams live
//! in `fverify-engine` and `fverify-core` respectively.

pub mod cx;
pub mod genid;
pub mod schema;
pub mod unit;

pub use cx::Cx;
pub use genid::{Genid, StripeLayout, GENID_LEN, MAX_STRIPES};
pub use schema::{
    BlobSentinel, IndexDescriptor, IndexMask, IndexPayload, TableSchema, COLLATTR_WIDTH,
    MAX_BLOB_COLUMNS, MAX_INDEXES,
};
pub use unit::{PassKind, ProcessingUnit};
