//! In-memory [`StorageEngine`] with fault injection.
//!
//! Every store file is an ordered `BTreeMap`. Cursors hold their position as
//! the last key they returned, so concurrent inserts and deletes behave the
//! way a B-tree cursor would: the next `Next` resumes after that key.
//!
//! The engine counts open cursors, live lock tokens, commits, aborts, and
//! quorum waits so tests can assert that a run released everything it took.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use fverify_error::{Result, VerifyError};
use fverify_types::TableSchema;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, trace};

use crate::{CommitToken, CursorOp, EngineCursor, Entry, FileId, LockToken, StorageEngine};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stored {
    version: u8,
    value: Vec<u8>,
}

type Tree = BTreeMap<Vec<u8>, Stored>;
type WriteSet = BTreeMap<(FileId, Vec<u8>), Stored>;

/// Operation to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    OpenCursor(FileId),
    Get(FileId),
    Put(FileId),
    Begin,
    Commit,
    Quorum,
    LockToken,
}

#[derive(Default)]
struct Inner {
    files: RwLock<HashMap<FileId, Tree>>,
    engine_lock: RwLock<()>,
    live_tokens: Mutex<HashSet<u32>>,
    next_token: AtomicU32,
    next_txn: AtomicU64,
    seqno: AtomicU64,
    open_cursors: AtomicUsize,
    commits: AtomicU64,
    aborts: AtomicU64,
    quorum_waits: AtomicU64,
    faults: Mutex<HashSet<FaultPoint>>,
}

impl Inner {
    fn check_fault(&self, point: FaultPoint) -> Result<()> {
        if self.faults.lock().contains(&point) {
            debug!(?point, "injected engine fault");
            return Err(match point {
                FaultPoint::LockToken => VerifyError::LockUnavailable {
                    detail: "injected fault".to_owned(),
                },
                FaultPoint::Begin | FaultPoint::Commit => {
                    VerifyError::transaction(format!("injected {point:?} fault"))
                }
                FaultPoint::Quorum => VerifyError::QuorumTimeout {
                    seqno: self.seqno.load(Ordering::Acquire),
                },
                FaultPoint::OpenCursor(file) | FaultPoint::Get(file) | FaultPoint::Put(file) => {
                    VerifyError::engine(file.to_string(), format!("injected {point:?} fault"))
                }
            });
        }
        Ok(())
    }

    fn token_live(&self, token: LockToken) -> bool {
        self.live_tokens.lock().contains(&token.0)
    }
}

/// Shared in-memory engine. Clones address the same store.
#[derive(Clone, Default)]
pub struct MemEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemEngine")
            .field("files", &self.inner.files.read().len())
            .field("open_cursors", &self.open_cursor_count())
            .field("live_lock_tokens", &self.live_lock_tokens())
            .finish()
    }
}

impl MemEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with every file the schema addresses created empty.
    #[must_use]
    pub fn for_schema(schema: &TableSchema) -> Self {
        let engine = Self::new();
        let layout = &schema.layout;
        for stripe in 0..layout.data_stripes {
            engine.create_file(FileId::Data { stripe });
        }
        for index in 0..schema.indexes.len() {
            engine.create_file(FileId::Index { index });
        }
        for column in 0..schema.blob_columns {
            for stripe in 0..layout.blob_stripes {
                engine.create_file(FileId::Blob { column, stripe });
            }
        }
        engine
    }

    pub fn create_file(&self, file: FileId) {
        self.inner.files.write().entry(file).or_default();
    }

    /// Insert or replace a version-0 value.
    pub fn put(&self, file: FileId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.put_versioned(file, key, value, 0);
    }

    pub fn put_versioned(
        &self,
        file: FileId,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        version: u8,
    ) {
        self.inner.files.write().entry(file).or_default().insert(
            key.into(),
            Stored {
                version,
                value: value.into(),
            },
        );
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, file: FileId, key: &[u8]) -> bool {
        self.inner
            .files
            .write()
            .get_mut(&file)
            .is_some_and(|tree| tree.remove(key).is_some())
    }

    /// Direct lookup bypassing cursors and locks.
    #[must_use]
    pub fn fetch(&self, file: FileId, key: &[u8]) -> Option<Entry> {
        let files = self.inner.files.read();
        let stored = files.get(&file)?.get(key)?;
        Some(Entry {
            key: key.to_vec(),
            value: stored.value.clone(),
            version: stored.version,
        })
    }

    #[must_use]
    pub fn file_len(&self, file: FileId) -> usize {
        self.inner.files.read().get(&file).map_or(0, BTreeMap::len)
    }

    pub fn inject(&self, fault: FaultPoint) {
        self.inner.faults.lock().insert(fault);
    }

    pub fn clear_fault(&self, fault: FaultPoint) {
        self.inner.faults.lock().remove(&fault);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    #[must_use]
    pub fn open_cursor_count(&self) -> usize {
        self.inner.open_cursors.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn live_lock_tokens(&self) -> usize {
        self.inner.live_tokens.lock().len()
    }

    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn abort_count(&self) -> u64 {
        self.inner.aborts.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn quorum_wait_count(&self) -> u64 {
        self.inner.quorum_waits.load(Ordering::Acquire)
    }

    fn new_cursor(&self, file: FileId, token: Option<LockToken>, txn: Option<&MemTxn>) -> Result<MemCursor> {
        self.inner.check_fault(FaultPoint::OpenCursor(file))?;
        if !self.inner.files.read().contains_key(&file) {
            return Err(VerifyError::NoSuchFile {
                target: file.to_string(),
            });
        }
        self.inner.open_cursors.fetch_add(1, Ordering::AcqRel);
        trace!(%file, transactional = txn.is_some(), "cursor opened");
        Ok(MemCursor {
            inner: Arc::clone(&self.inner),
            file,
            token,
            writes: txn.map(|t| Arc::clone(&t.writes)),
            position: None,
        })
    }
}

/// Transaction handle of [`MemEngine`]. Writes are buffered until commit.
pub struct MemTxn {
    id: u64,
    writes: Arc<Mutex<WriteSet>>,
}

impl MemTxn {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Cursor of [`MemEngine`].
pub struct MemCursor {
    inner: Arc<Inner>,
    file: FileId,
    token: Option<LockToken>,
    writes: Option<Arc<Mutex<WriteSet>>>,
    position: Option<Vec<u8>>,
}

impl EngineCursor for MemCursor {
    fn file(&self) -> FileId {
        self.file
    }

    fn get(&mut self, op: CursorOp, key: Option<&[u8]>) -> Result<Option<Entry>> {
        self.inner.check_fault(FaultPoint::Get(self.file))?;
        if let Some(token) = self.token {
            if !self.inner.token_live(token) {
                return Err(VerifyError::LockUnavailable {
                    detail: format!("lock token {} released while cursor open", token.0),
                });
            }
        }
        let search = match (op.needs_key(), key) {
            (true, Some(k)) => Some(k),
            (true, None) => {
                return Err(VerifyError::internal(format!("{op:?} requires a search key")));
            }
            (false, _) => None,
        };

        let files = self.inner.files.read();
        let tree = files.get(&self.file).ok_or_else(|| VerifyError::NoSuchFile {
            target: self.file.to_string(),
        })?;

        let found = match (op, self.position.as_deref(), search) {
            (CursorOp::First, _, _) | (CursorOp::Next, None, _) => tree.iter().next(),
            (CursorOp::Last, _, _) | (CursorOp::Prev, None, _) => tree.iter().next_back(),
            (CursorOp::Next, Some(pos), _) => tree
                .range::<[u8], _>((Bound::Excluded(pos), Bound::Unbounded))
                .next(),
            (CursorOp::Prev, Some(pos), _) => tree
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(pos)))
                .next_back(),
            (CursorOp::Set, _, Some(k)) => tree.get_key_value(k),
            (CursorOp::SetRange, _, Some(k)) => tree
                .range::<[u8], _>((Bound::Included(k), Bound::Unbounded))
                .next(),
            (CursorOp::Set | CursorOp::SetRange, _, None) => None,
        };

        let Some((found_key, stored)) = found else {
            return Ok(None);
        };
        let mut entry = Entry {
            key: found_key.clone(),
            value: stored.value.clone(),
            version: stored.version,
        };
        drop(files);

        if let Some(writes) = &self.writes {
            if let Some(pending) = writes.lock().get(&(self.file, entry.key.clone())) {
                entry.value.clone_from(&pending.value);
                entry.version = pending.version;
            }
        }
        self.position = Some(entry.key.clone());
        Ok(Some(entry))
    }

    fn put_current(&mut self, value: &[u8], version: u8) -> Result<()> {
        self.inner.check_fault(FaultPoint::Put(self.file))?;
        let Some(writes) = &self.writes else {
            return Err(VerifyError::engine(
                self.file.to_string(),
                "write through a non-transactional cursor",
            ));
        };
        let Some(position) = &self.position else {
            return Err(VerifyError::engine(
                self.file.to_string(),
                "put_current on an unpositioned cursor",
            ));
        };
        writes.lock().insert(
            (self.file, position.clone()),
            Stored {
                version,
                value: value.to_vec(),
            },
        );
        Ok(())
    }

    fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for MemCursor {
    fn drop(&mut self) {
        self.inner.open_cursors.fetch_sub(1, Ordering::AcqRel);
        trace!(file = %self.file, "cursor closed");
    }
}

impl StorageEngine for MemEngine {
    type Cursor = MemCursor;
    type Txn = MemTxn;
    type ReadGuard<'a> = RwLockReadGuard<'a, ()>;

    fn read_lock(&self) -> Self::ReadGuard<'_> {
        self.inner.engine_lock.read()
    }

    fn acquire_lock_token(&self) -> Result<LockToken> {
        self.inner.check_fault(FaultPoint::LockToken)?;
        let id = self.inner.next_token.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.live_tokens.lock().insert(id);
        trace!(token = id, "lock token acquired");
        Ok(LockToken(id))
    }

    fn release_lock_token(&self, token: LockToken) -> Result<()> {
        if !self.inner.live_tokens.lock().remove(&token.0) {
            return Err(VerifyError::internal(format!(
                "release of unknown lock token {}",
                token.0
            )));
        }
        trace!(token = token.0, "lock token released");
        Ok(())
    }

    fn open_cursor(&self, file: FileId, token: LockToken) -> Result<Self::Cursor> {
        if !self.inner.token_live(token) {
            return Err(VerifyError::LockUnavailable {
                detail: format!("lock token {} is not live", token.0),
            });
        }
        self.new_cursor(file, Some(token), None)
    }

    fn begin(&self) -> Result<Self::Txn> {
        self.inner.check_fault(FaultPoint::Begin)?;
        let id = self.inner.next_txn.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(txn = id, "transaction begun");
        Ok(MemTxn {
            id,
            writes: Arc::new(Mutex::new(WriteSet::new())),
        })
    }

    fn open_txn_cursor(&self, txn: &Self::Txn, file: FileId) -> Result<Self::Cursor> {
        self.new_cursor(file, None, Some(txn))
    }

    fn commit(&self, txn: Self::Txn) -> Result<CommitToken> {
        if let Err(err) = self.inner.check_fault(FaultPoint::Commit) {
            self.inner.aborts.fetch_add(1, Ordering::AcqRel);
            return Err(err);
        }
        let writes = std::mem::take(&mut *txn.writes.lock());
        let mut files = self.inner.files.write();
        for ((file, key), stored) in writes {
            files.entry(file).or_default().insert(key, stored);
        }
        drop(files);
        let seqno = self.inner.seqno.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.commits.fetch_add(1, Ordering::AcqRel);
        debug!(txn = txn.id, seqno, "transaction committed");
        Ok(CommitToken { seqno })
    }

    fn abort(&self, txn: Self::Txn) -> Result<()> {
        self.inner.aborts.fetch_add(1, Ordering::AcqRel);
        debug!(txn = txn.id, "transaction aborted");
        Ok(())
    }

    fn wait_for_quorum(&self, token: &CommitToken) -> Result<()> {
        self.inner.check_fault(FaultPoint::Quorum)?;
        self.inner.quorum_waits.fetch_add(1, Ordering::AcqRel);
        trace!(seqno = token.seqno, "quorum acknowledged");
        Ok(())
    }
}
