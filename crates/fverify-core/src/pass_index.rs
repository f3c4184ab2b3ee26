//! Pass 2: index entries against the records they point at.
//!
//! Every entry's payload names a genid. The record is fetched, its key is
//! re-formed, and the stored key, suffix, and payload are compared against
//! what the record implies.

use fverify_engine::{CursorOp, EngineCursor, Entry, FileId, LockToken, StorageEngine};
use fverify_error::Result;
use fverify_types::{GENID_LEN, Genid, IndexDescriptor, IndexPayload, ProcessingUnit};
use tracing::{info, trace};

use crate::context::{Flow, UnitOutcome, VerifyContext};
use crate::format::{BlobBuffers, RecordFormat};
use crate::lookup::{expected_suffix, fetch_exact, load_blobs};
use crate::report::Inconsistency;

/// Verify every entry of one index.
pub fn verify_index<E, F>(
    ctx: &VerifyContext<'_, F>,
    engine: &E,
    token: LockToken,
    index: usize,
) -> Result<UnitOutcome>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    let unit = ProcessingUnit::Index { index };
    let descriptor = *ctx.schema.index(index)?;
    ctx.cx().checkpoint()?;
    info!(table = %ctx.schema.name, index, "verifying index");

    let reload_blobs =
        ctx.config.expression_indexes && ctx.format.is_expression_schema(ctx.schema);
    let mut blobs = BlobBuffers::new(ctx.schema.blob_columns);
    let mut tracker = ctx.tracker(unit);
    let mut cursor = engine.open_cursor(FileId::Index { index }, token)?;
    let mut checker = EntryCheck {
        ctx,
        engine,
        token,
        index,
        descriptor: &descriptor,
        reload_blobs,
        blobs: &mut blobs,
    };
    let mut next = cursor.get(CursorOp::First, None)?;

    while let Some(entry) = next {
        if ctx.checkpoint(&mut tracker)? == Flow::Stop {
            return Ok(UnitOutcome::ClientDropped);
        }
        checker.check(&entry);
        next = cursor.get(CursorOp::Next, None)?;
    }

    cursor.close()?;
    info!(table = %ctx.schema.name, index, entries = tracker.total(), "index verified");
    Ok(UnitOutcome::Completed)
}

struct EntryCheck<'c, 'a, E, F: RecordFormat + ?Sized> {
    ctx: &'c VerifyContext<'a, F>,
    engine: &'c E,
    token: LockToken,
    index: usize,
    descriptor: &'c IndexDescriptor,
    reload_blobs: bool,
    blobs: &'c mut BlobBuffers,
}

impl<E, F> EntryCheck<'_, '_, E, F>
where
    E: StorageEngine,
    F: RecordFormat + ?Sized,
{
    fn check(&mut self, entry: &Entry) {
        let ctx = self.ctx;
        let index = self.index;

        let Some(genid) = Genid::from_prefix(&entry.value) else {
            ctx.report(Inconsistency::UnexpectedLength {
                index,
                len: entry.value.len(),
            });
            return;
        };
        trace!(%genid, index, "checking index entry");

        let Ok(stripe) = ctx.schema.layout.data_stripe_of(genid) else {
            ctx.report(Inconsistency::UnknownDataFile { genid });
            return;
        };
        let data = FileId::Data { stripe };
        let record = match fetch_exact(self.engine, self.token, data, &genid.to_bytes()) {
            Ok(Some(record)) => record,
            Ok(None) => {
                ctx.report(Inconsistency::Orphaned {
                    genid,
                    index,
                    key: entry.key.clone(),
                });
                return;
            }
            Err(err) => {
                ctx.report(Inconsistency::RecordFetchFailed {
                    genid,
                    index: Some(index),
                    detail: err.to_string(),
                });
                return;
            }
        };
        let mut payload = record.value;
        if let Err(err) = ctx.format.translate_version(&mut payload, record.version) {
            ctx.report(Inconsistency::VersionTranslateFailed {
                genid,
                detail: err.to_string(),
            });
            return;
        }

        self.blobs.clear();
        if self.reload_blobs {
            if let Err(err) = self.reload(genid, &payload) {
                ctx.report(Inconsistency::BlobLayoutFailed {
                    genid,
                    detail: err.to_string(),
                });
            }
        }

        let formed = match ctx.format.form_key(&payload, self.blobs, index) {
            Ok(formed) => formed,
            Err(err) => {
                ctx.report(Inconsistency::FormKeyFailed {
                    genid,
                    index,
                    detail: err.to_string(),
                });
                return;
            }
        };

        if !self.check_key(entry, genid, &formed) {
            return;
        }
        let Some(payload_genid) = self.check_payload(entry, genid, &payload) else {
            return;
        };

        if self.descriptor.key_contains_genid() {
            let expected = expected_suffix(ctx.format, self.descriptor, index, genid, &formed);
            let stored = Genid::from_prefix(&entry.key[formed.len()..]);
            if stored != Some(expected) {
                ctx.report(Inconsistency::SuffixMismatch {
                    suffix: stored.unwrap_or(Genid::ZERO),
                    index,
                    masked: expected,
                    genid,
                });
            }
        }

        if payload_genid != genid {
            ctx.report(Inconsistency::PayloadGenidMismatch {
                found: payload_genid,
                index,
                genid,
            });
        }
    }

    fn reload(&mut self, genid: Genid, payload: &[u8]) -> Result<()> {
        let stripe = self.ctx.schema.layout.blob_stripe_of(genid)?;
        load_blobs(
            self.engine,
            self.ctx.format,
            self.token,
            genid,
            payload,
            stripe,
            self.blobs,
        )
    }

    /// Stored key against the formed key. Returns false after a finding.
    fn check_key(&self, entry: &Entry, genid: Genid, formed: &[u8]) -> bool {
        let ctx = self.ctx;
        let index = self.index;
        let got = entry.key.len();
        if got < formed.len() {
            ctx.report(Inconsistency::KeyTooShort {
                genid,
                index,
                got,
                formed: formed.len(),
            });
            return false;
        }
        if entry.key[..formed.len()] != *formed {
            ctx.report(Inconsistency::KeyMismatch { genid, index });
            return false;
        }
        let expected = if self.descriptor.key_contains_genid() {
            formed.len() + GENID_LEN
        } else {
            formed.len()
        };
        if expected != got {
            ctx.report(Inconsistency::KeySizeMismatch {
                genid,
                index,
                expected,
                got,
            });
            return false;
        }
        true
    }

    /// Payload shape and datacopy contents. Returns the payload genid, or
    /// `None` after a finding.
    fn check_payload(&self, entry: &Entry, genid: Genid, record: &[u8]) -> Option<Genid> {
        let ctx = self.ctx;
        let index = self.index;
        let value = &entry.value;
        let prefix_genid = Genid::from_prefix(value).unwrap_or(Genid::ZERO);

        match self.descriptor.payload {
            IndexPayload::Datacopy { packed } => {
                let (payload_genid, copy) = if packed {
                    match ctx.format.unpack_datacopy(value) {
                        Ok(unpacked) => {
                            let mut copy = unpacked.payload;
                            if let Err(err) = ctx.format.translate_version(&mut copy, unpacked.version) {
                                ctx.report(Inconsistency::VersionTranslateFailed {
                                    genid,
                                    detail: err.to_string(),
                                });
                                return None;
                            }
                            (unpacked.genid, copy)
                        }
                        Err(err) => {
                            ctx.report(Inconsistency::DatacopyUnpackFailed {
                                genid,
                                index,
                                detail: err.to_string(),
                            });
                            return None;
                        }
                    }
                } else {
                    (prefix_genid, value[GENID_LEN..].to_vec())
                };

                let record_len = ctx.schema.record_len;
                if copy.len() != record_len {
                    ctx.report(Inconsistency::DatacopySize {
                        genid,
                        index,
                        expected: record_len,
                        got: copy.len(),
                    });
                    return None;
                }
                if record.get(..record_len) != Some(copy.as_slice()) {
                    ctx.report(Inconsistency::DatacopyMismatch { genid, index });
                    return None;
                }
                Some(payload_genid)
            }
            IndexPayload::CollationAttrs { .. } | IndexPayload::Genid => {
                let expected = ctx
                    .schema
                    .expected_payload_len(self.descriptor)
                    .unwrap_or(GENID_LEN);
                if value.len() == expected {
                    return Some(prefix_genid);
                }
                if matches!(self.descriptor.payload, IndexPayload::Genid) {
                    ctx.report(Inconsistency::PayloadSize {
                        genid,
                        index,
                        got: value.len(),
                    });
                } else {
                    ctx.report(Inconsistency::CollationSize {
                        genid,
                        index,
                        expected,
                        got: value.len(),
                    });
                }
                None
            }
        }
    }
}
