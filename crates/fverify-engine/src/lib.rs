//! Storage-engine interface consumed by the verifier.
//!
//! The verifier never touches pages, locks, or replication directly. It
//! drives forward cursors over three kinds of store files (data stripes,
//! secondary indexes, blob stripes), opens short-lived transactions for the
//! blob-length repair path, and scopes its reads under read-only lock tokens.
//! [`StorageEngine`] is that surface; [`MemEngine`] is an in-memory
//! implementation with fault injection used by tests and demos.

pub mod mem;

use std::fmt;

use fverify_error::Result;

pub use mem::{FaultPoint, MemCursor, MemEngine, MemTxn};

/// A physical store file addressed by the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileId {
    /// Primary records of one data stripe, keyed by genid.
    Data { stripe: u32 },
    /// One secondary index.
    Index { index: usize },
    /// One stripe of one blob column, keyed by genid.
    Blob { column: usize, stripe: u32 },
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { stripe } => write!(f, "dtastripe {stripe}"),
            Self::Index { index } => write!(f, "ix {index}"),
            Self::Blob { column, stripe } => write!(f, "blob {column} stripe {stripe}"),
        }
    }
}

/// Cursor positioning operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// Smallest key.
    First,
    /// Largest key.
    Last,
    /// Key after the current position (`First` when unpositioned).
    Next,
    /// Key before the current position (`Last` when unpositioned).
    Prev,
    /// Exact key match.
    Set,
    /// Smallest key greater than or equal to the given key.
    SetRange,
}

impl CursorOp {
    /// Whether the operation requires a search key.
    #[must_use]
    pub const fn needs_key(self) -> bool {
        matches!(self, Self::Set | Self::SetRange)
    }
}

/// One fetched key/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Format version tag the value was written with.
    pub version: u8,
}

/// Read-only lock scope handed out by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(pub u32);

/// Acknowledgement handle returned by a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitToken {
    pub seqno: u64,
}

/// A forward cursor over one store file.
///
/// Dropping a cursor closes it; [`EngineCursor::close`] exists so callers can
/// observe close failures.
pub trait EngineCursor: Send {
    /// File this cursor ranges over.
    fn file(&self) -> FileId;

    /// Position the cursor and fetch. `Ok(None)` means "not found" and is
    /// never an error.
    fn get(&mut self, op: CursorOp, key: Option<&[u8]>) -> Result<Option<Entry>>;

    /// Overwrite the value at the current position. Only transactional
    /// cursors accept writes.
    fn put_current(&mut self, value: &[u8], version: u8) -> Result<()>;

    /// Close the cursor.
    fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Transactional key-value engine the verifier runs against.
pub trait StorageEngine: Send + Sync {
    type Cursor: EngineCursor;
    type Txn: Send;
    /// Engine-wide read lock guard.
    type ReadGuard<'a>
    where
        Self: 'a;

    /// Take the engine-wide read lock. Hold it only briefly.
    fn read_lock(&self) -> Self::ReadGuard<'_>;

    /// Allocate a read-only lock token.
    fn acquire_lock_token(&self) -> Result<LockToken>;

    /// Release every lock held by `token` and free it.
    fn release_lock_token(&self, token: LockToken) -> Result<()>;

    /// Open a non-transactional cursor whose locks belong to `token`.
    fn open_cursor(&self, file: FileId, token: LockToken) -> Result<Self::Cursor>;

    fn begin(&self) -> Result<Self::Txn>;

    /// Open a cursor inside `txn`; writes through it become visible on commit.
    fn open_txn_cursor(&self, txn: &Self::Txn, file: FileId) -> Result<Self::Cursor>;

    /// Commit and return the token to wait on for replication.
    fn commit(&self, txn: Self::Txn) -> Result<CommitToken>;

    fn abort(&self, txn: Self::Txn) -> Result<()>;

    /// Block until the replica quorum has acknowledged `token`.
    fn wait_for_quorum(&self, token: &CommitToken) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_display() {
        assert_eq!(FileId::Data { stripe: 2 }.to_string(), "dtastripe 2");
        assert_eq!(FileId::Index { index: 0 }.to_string(), "ix 0");
        assert_eq!(
            FileId::Blob { column: 1, stripe: 3 }.to_string(),
            "blob 1 stripe 3"
        );
    }

    #[test]
    fn keyed_ops() {
        assert!(CursorOp::Set.needs_key());
        assert!(CursorOp::SetRange.needs_key());
        assert!(!CursorOp::Next.needs_key());
    }
}
