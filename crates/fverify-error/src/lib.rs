use thiserror::Error;

/// Primary error type for FrankenVerify operations.
///
/// Only *operational* failures are errors. Data inconsistencies found by a
/// verification pass are findings, reported through the output sink; they
/// never travel through this type.
#[derive(Error, Debug)]
pub enum VerifyError {
    // === Storage Engine Errors ===
    /// A storage-engine call failed for a reason other than "not found".
    #[error("storage engine error on {target}: {detail}")]
    Engine { target: String, detail: String },

    /// The requested file (data stripe, index, blob stripe) does not exist.
    #[error("no such store file: {target}")]
    NoSuchFile { target: String },

    /// The engine refused to hand out another lock token.
    #[error("lock token unavailable: {detail}")]
    LockUnavailable { detail: String },

    // === Transaction Errors ===
    /// Transaction begin, commit, or abort failed.
    #[error("transaction failed: {detail}")]
    TransactionFailed { detail: String },

    /// The replica quorum never acknowledged a commit.
    #[error("commit {seqno} not acknowledged by quorum")]
    QuorumTimeout { seqno: u64 },

    /// Record was concurrently modified or locked.
    #[error("record {genid:016x} is busy")]
    Busy { genid: u64 },

    // === Layout Errors ===
    /// A genid decodes to a data stripe outside the configured range.
    #[error("genid {genid:016x} maps to unknown data stripe {stripe}")]
    UnknownStripe { genid: u64, stripe: u32 },

    /// The table schema descriptor is unusable.
    #[error("invalid table schema: {detail}")]
    InvalidSchema { detail: String },

    // === Format Errors ===
    /// A record-format callback failed.
    #[error("record format error: {detail}")]
    Format { detail: String },

    // === Configuration Errors ===
    /// Run configuration is invalid.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    // === Control Errors ===
    /// The host cancelled the run.
    #[error("verification cancelled")]
    Cancelled,

    /// Operation is not supported by the current format or engine.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric result codes reported to the caller of a verification run.
///
/// A run returns `0` when clean, `1` when inconsistencies were found, and the
/// negated code of the first hard failure otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Operation aborted (cancelled).
    Abort = 4,
    /// Record or lock busy.
    Busy = 5,
    /// Storage I/O error.
    IoErr = 10,
    /// Store structure is malformed.
    Corrupt = 11,
    /// Requested file not found.
    NotFound = 12,
    /// Locking or replication protocol error.
    Protocol = 15,
    /// Misuse of the library (bad schema or configuration).
    Misuse = 21,
    /// Operation not supported.
    NoLfs = 22,
}

impl VerifyError {
    /// Map this error to a numeric code.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Engine { .. } => ErrorCode::IoErr,
            Self::NoSuchFile { .. } => ErrorCode::NotFound,
            Self::LockUnavailable { .. } | Self::Busy { .. } => ErrorCode::Busy,
            Self::TransactionFailed { .. } => ErrorCode::Error,
            Self::QuorumTimeout { .. } => ErrorCode::Protocol,
            Self::UnknownStripe { .. } => ErrorCode::Corrupt,
            Self::InvalidSchema { .. } | Self::InvalidConfig { .. } => ErrorCode::Misuse,
            Self::Format { .. } => ErrorCode::Error,
            Self::Cancelled => ErrorCode::Abort,
            Self::Unsupported(_) => ErrorCode::NoLfs,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Status value a verification run reports for this error.
    pub const fn run_status_code(&self) -> i32 {
        -(self.error_code() as i32)
    }

    /// Create a storage engine error.
    pub fn engine(target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Engine {
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(detail: impl Into<String>) -> Self {
        Self::TransactionFailed {
            detail: detail.into(),
        }
    }

    /// Create a record-format error.
    pub fn format(detail: impl Into<String>) -> Self {
        Self::Format {
            detail: detail.into(),
        }
    }

    /// Create a schema error.
    pub fn schema(detail: impl Into<String>) -> Self {
        Self::InvalidSchema {
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `VerifyError`.
pub type Result<T> = std::result::Result<T, VerifyError>;
