//! Findings and the run summary.

use std::fmt;

use fverify_error::ErrorCode;
use fverify_types::{Genid, ProcessingUnit};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// One data inconsistency. `Display` renders the report line without the
/// leading `!`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Inconsistency {
    // --- records vs blobs ---
    BadGenidSize { len: usize },
    VersionTranslateFailed { genid: Genid, detail: String },
    BlobLayoutFailed { genid: Genid, detail: String },
    UnknownDataFile { genid: Genid },
    MissingBlob { genid: Genid, column: usize, expected: u32 },
    BlobNotNull { genid: Genid, column: usize },
    BlobNotInline { genid: Genid, column: usize, size: usize },
    BlobSizeMismatch { genid: Genid, column: usize, got: usize, expected: u32 },
    BlobFetchFailed { genid: Genid, column: usize, detail: String },

    // --- records vs indexes ---
    FormKeyFailed { genid: Genid, index: usize, detail: String },
    UnexpectedIndexEntry { genid: Genid, index: usize },
    MissingKey { genid: Genid, index: usize },
    GenidMismatch { genid: Genid, index: usize, found: Genid },

    // --- indexes vs records ---
    UnexpectedLength { index: usize, len: usize },
    RecordFetchFailed { genid: Genid, index: Option<usize>, detail: String },
    Orphaned { genid: Genid, index: usize, key: Vec<u8> },
    KeyTooShort { genid: Genid, index: usize, got: usize, formed: usize },
    KeyMismatch { genid: Genid, index: usize },
    KeySizeMismatch { genid: Genid, index: usize, expected: usize, got: usize },
    DatacopyUnpackFailed { genid: Genid, index: usize, detail: String },
    DatacopySize { genid: Genid, index: usize, expected: usize, got: usize },
    DatacopyMismatch { genid: Genid, index: usize },
    CollationSize { genid: Genid, index: usize, expected: usize, got: usize },
    PayloadSize { genid: Genid, index: usize, got: usize },
    SuffixMismatch { suffix: Genid, index: usize, masked: Genid, genid: Genid },
    PayloadGenidMismatch { found: Genid, index: usize, genid: Genid },

    // --- blobs vs records ---
    StripeMismatch { genid: Genid, blob_stripe: u32, data_stripe: u32 },
    OrphanedBlob { genid: Genid, column: usize },
    MissingBlobFile { column: usize, stripe: u32 },
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    bytes.iter().try_for_each(|b| write!(f, "{b:02x}"))
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadGenidSize { len } => write!(f, "bad genid sz {len}"),
            Self::VersionTranslateFailed { genid, detail } => {
                write!(f, "{genid} vtag rc {detail}")
            }
            Self::BlobLayoutFailed { genid, detail } => {
                write!(f, "{genid} blob size rc {detail}")
            }
            Self::UnknownDataFile { genid } => write!(f, "{genid} unknown dtafile"),
            Self::MissingBlob {
                genid,
                column,
                expected,
            } => write!(f, "{genid} no blob {column} found expected sz {expected}"),
            Self::BlobNotNull { genid, column } => {
                write!(f, "{genid} blob {column} null but found blob")
            }
            Self::BlobNotInline {
                genid,
                column,
                size,
            } => write!(
                f,
                "{genid} blob {column} size {size} expected none (inline vutf8)"
            ),
            Self::BlobSizeMismatch {
                genid,
                column,
                got,
                expected,
            } => write!(
                f,
                "{genid} blob {column} size mismatch got {got} expected {expected}"
            ),
            Self::BlobFetchFailed {
                genid,
                column,
                detail,
            } => write!(f, "{genid} blob {column} rc {detail}"),
            Self::FormKeyFailed {
                genid,
                index,
                detail,
            } => write!(f, "{genid} ix {index} formkey rc {detail}"),
            Self::UnexpectedIndexEntry { genid, index } => {
                write!(f, "{genid} ix {index} expect notfound but got an index")
            }
            Self::MissingKey { genid, index } => write!(f, "{genid} ix {index} missing key"),
            Self::GenidMismatch {
                genid,
                index,
                found,
            } => write!(f, "{genid} ix {index} genid mismatch {found}"),
            Self::UnexpectedLength { index, len } => {
                write!(f, "ix {index} unexpected length {len}")
            }
            Self::RecordFetchFailed {
                genid,
                index: Some(index),
                detail,
            } => write!(f, "{genid} ix {index} dta rc {detail}"),
            Self::RecordFetchFailed {
                genid,
                index: None,
                detail,
            } => write!(f, "{genid} get rc {detail}"),
            Self::Orphaned { genid, index, key } => {
                write!(f, "{genid} ix {index} orphaned ")?;
                write_hex(f, key)
            }
            Self::KeyTooShort {
                genid,
                index,
                got,
                formed,
            } => write!(f, "{genid} ix {index} key size {got} < formed key {formed}"),
            Self::KeyMismatch { genid, index } => write!(f, "{genid} ix {index} key mismatch"),
            Self::KeySizeMismatch {
                genid,
                index,
                expected,
                got,
            } => write!(
                f,
                "{genid} ix {index} key size mismatch expected {expected} got {got}"
            ),
            Self::DatacopyUnpackFailed {
                genid,
                index,
                detail,
            } => write!(f, "{genid} ix {index} dtacpy unpack rc {detail}"),
            Self::DatacopySize {
                genid,
                index,
                expected,
                got,
            } => write!(
                f,
                "{genid} ix {index} dtacpy payload wrong size expected {expected} got {got}"
            ),
            Self::DatacopyMismatch { genid, index } => {
                write!(f, "{genid} ix {index} dtacpy data mismatch")
            }
            Self::CollationSize {
                genid,
                index,
                expected,
                got,
            } => write!(
                f,
                "{genid} ix {index} decimal payload wrong size expected {expected} got {got}"
            ),
            Self::PayloadSize { genid, index, got } => write!(
                f,
                "{genid} ix {index} payload wrong size expected 8 got {got}"
            ),
            Self::SuffixMismatch {
                suffix,
                index,
                masked,
                genid,
            } => write!(
                f,
                "{suffix} ix {index} dupe key genid != dta genid {masked} ({genid})"
            ),
            Self::PayloadGenidMismatch {
                found,
                index,
                genid,
            } => write!(f, "{found} ix {index} dupe key genid != dta genid {genid}"),
            Self::StripeMismatch {
                genid,
                blob_stripe,
                data_stripe,
            } => write!(
                f,
                "{genid} blobstripe {blob_stripe} != datastripe {data_stripe}"
            ),
            Self::OrphanedBlob { genid, column } => {
                write!(f, "{genid} orphaned blob {column}")
            }
            Self::MissingBlobFile { column, stripe } => write!(
                f,
                "incorrect number of blobs? blob index {column} stripe {stripe} has no DB"
            ),
        }
    }
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Clean,
    Inconsistent,
    /// A unit stopped on an operational error.
    Failed(ErrorCode),
}

impl VerifyStatus {
    /// `0` clean, `1` inconsistent, negated error code on failure.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Inconsistent => 1,
            Self::Failed(code) => -(code as i32),
        }
    }

    #[must_use]
    pub const fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl Serialize for VerifyStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let state = match self {
            Self::Clean => "clean",
            Self::Inconsistent => "inconsistent",
            Self::Failed(_) => "failed",
        };
        let mut s = serializer.serialize_struct("VerifyStatus", 2)?;
        s.serialize_field("state", state)?;
        s.serialize_field("code", &self.code())?;
        s.end()
    }
}

/// A unit that stopped on an operational error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: ProcessingUnit,
    pub code: i32,
    pub message: String,
}

/// Summary of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub table: String,
    pub status: VerifyStatus,
    pub units_total: u64,
    pub units_completed: u64,
    pub units_interrupted: u64,
    pub units_failed: u64,
    pub units_skipped: u64,
    pub records_visited: u64,
    /// Number of findings, including any past the recording cap.
    pub findings: u64,
    pub inconsistencies: Vec<Inconsistency>,
    pub repairs: u64,
    pub failures: Vec<UnitFailure>,
    pub client_dropped: bool,
    pub degraded: bool,
}

impl VerifyReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
