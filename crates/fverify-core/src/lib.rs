//! Online consistency verification for genid-keyed tables.
//!
//! A run cross-checks a table's three physical structures in three passes:
//!
//! - **data** ([`pass_data`]): every record must have the blob rows its
//!   inline sentinels declare and the index entries its has-keys bitmap
//!   implies;
//! - **index** ([`pass_index`]): every index entry must point at a record
//!   whose re-formed key and payload match the entry;
//! - **blob** ([`pass_blob`]): every blob row must belong to an existing
//!   record in the expected stripe.
//!
//! Findings are written to an [`OutputSink`] as `!`-prefixed lines and
//! collected in a [`VerifyReport`]. With `attempt_fix`, blob-length fields
//! that disagree with the blob store are rewritten transactionally
//! ([`repair`]).

pub mod config;
pub mod context;
pub mod dispatch;
pub mod fixture;
pub mod format;
pub mod lookup;
pub mod pass_blob;
pub mod pass_data;
pub mod pass_index;
pub mod progress;
pub mod repair;
pub mod report;
pub mod sink;

pub use config::VerifyConfig;
pub use context::{Flow, UnitOutcome, VerifyContext};
pub use dispatch::verify;
pub use format::{BlobBuffers, BlobLayout, BlobSlot, PackedDatacopy, RecordFormat};
pub use repair::{ColumnFix, Resume, restore_cursor_at_genid};
pub use report::{Inconsistency, UnitFailure, VerifyReport, VerifyStatus};
pub use sink::{CallbackSink, CollectSink, LivenessProbe, OutputSink, StreamSink};
#[cfg(unix)]
pub use sink::TcpLiveness;
