use fverify_core::fixture::{FixtureBlob, FixtureRecord, FixtureTable, LEGACY_VERSION, genid};
use fverify_core::{CollectSink, Inconsistency, VerifyConfig, VerifyReport, verify};
use fverify_engine::{FileId, MemEngine};
use fverify_types::{Cx, Genid, IndexDescriptor, IndexPayload, ProcessingUnit, StripeLayout};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn run(table: &FixtureTable, engine: &MemEngine, config: &VerifyConfig) -> (VerifyReport, Vec<String>) {
    init_tracing();
    let sink = CollectSink::new();
    let report = verify(engine, &table.schema, &table.format, &sink, config, &Cx::new())
        .expect("verify should start");
    assert_eq!(engine.open_cursor_count(), 0, "cursor leaked");
    assert_eq!(engine.live_lock_tokens(), 0, "lock token leaked");
    (report, sink.findings())
}

fn run_default(table: &FixtureTable, engine: &MemEngine) -> (VerifyReport, Vec<String>) {
    run(table, engine, &VerifyConfig::default())
}

fn fixing() -> VerifyConfig {
    VerifyConfig {
        attempt_fix: true,
        ..VerifyConfig::default()
    }
}

fn blob_table() -> FixtureTable {
    FixtureTable::new("t1", StripeLayout::new(1, 1), 1, &[IndexDescriptor::unique()])
}

fn assert_finding(findings: &[String], expected: &str) {
    assert!(
        findings.iter().any(|line| line == expected),
        "missing {expected:?} in {findings:#?}"
    );
}

// ── Scenarios ──────────────────────────────────────────────────────────

#[test]
fn clean_single_record() {
    let table = blob_table();
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(7)])
        .with_blob(0, FixtureBlob::Stored(b"hello".to_vec()));
    table.insert(&engine, &record).expect("insert");

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert!(report.status.is_clean());
    assert_eq!(report.status.code(), 0);
    assert_eq!(report.units_total, 3);
    assert_eq!(report.units_completed, 3);
    assert_eq!(report.records_visited, 3);
    assert!(!report.degraded);
}

#[test]
fn missing_blob_is_reported_then_repaired() {
    let table = blob_table();
    let engine = table.engine();
    let gid = genid(1, 0);
    let record = FixtureRecord::new(gid, &[Some(7)]).with_blob(0, FixtureBlob::Stored(vec![9; 10]));
    table.insert(&engine, &record).expect("insert");
    assert!(engine.delete(FileId::Blob { column: 0, stripe: 0 }, &gid.to_bytes()));

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(findings, vec![format!("!{gid} no blob 0 found expected sz 10")]);
    assert_eq!(report.status.code(), 1);
    assert_eq!(report.repairs, 0);
    assert_eq!(engine.commit_count(), 0);

    let (report, findings) = run(&table, &engine, &fixing());
    assert_eq!(findings.len(), 1);
    assert_eq!(report.repairs, 1);
    assert_eq!(engine.commit_count(), 1);
    assert_eq!(engine.quorum_wait_count(), 1);
    assert!(!report.degraded);

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert!(report.status.is_clean());
}

#[test]
fn orphaned_index_entry_prints_hex_key() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 1), 0, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let gid = genid(4, 0);
    table
        .insert(&engine, &FixtureRecord::new(gid, &[Some(7)]))
        .expect("insert");
    assert!(engine.delete(FileId::Data { stripe: 0 }, &gid.to_bytes()));

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(findings, vec![format!("!{gid} ix 0 orphaned 00000007")]);
    assert_eq!(report.status.code(), 1);
    assert!(matches!(
        report.inconsistencies.as_slice(),
        [Inconsistency::Orphaned { index: 0, .. }]
    ));
}

#[test]
fn blob_in_wrong_stripe_below_watermark() {
    let layout = StripeLayout::new(3, 3).with_watermark(genid(100, 0));
    let table = FixtureTable::new("t1", layout, 1, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let gid = genid(1, 1);
    let record = FixtureRecord::new(gid, &[Some(3)]).with_blob(0, FixtureBlob::Stored(b"abc".to_vec()));
    table.insert(&engine, &record).expect("insert");
    assert!(engine.delete(FileId::Blob { column: 0, stripe: 1 }, &gid.to_bytes()));
    engine.put(FileId::Blob { column: 0, stripe: 2 }, gid.to_bytes(), b"abc".to_vec());

    let (_, findings) = run_default(&table, &engine);
    assert_finding(&findings, &format!("!{gid} blobstripe 2 != datastripe 1"));
    assert_finding(&findings, &format!("!{gid} no blob 0 found expected sz 3"));
}

#[test]
fn restriped_blobs_above_watermark_are_not_stripe_checked() {
    let layout = StripeLayout::new(2, 3).with_watermark(genid(100, 0));
    let table = FixtureTable::new("t1", layout, 1, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let old = FixtureRecord::new(genid(50, 1), &[Some(3)])
        .with_blob(0, FixtureBlob::Stored(b"abc".to_vec()));
    let new = FixtureRecord::new(genid(200, 1), &[Some(4)])
        .with_blob(0, FixtureBlob::Stored(b"def".to_vec()));
    for record in [&old, &new] {
        table.insert(&engine, record).expect("insert");
        // Stray copy in a blob stripe no data stripe maps to.
        engine.put(FileId::Blob { column: 0, stripe: 2 }, record.genid.to_bytes(), b"x".to_vec());
    }

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(findings, vec![format!("!{} blobstripe 2 != datastripe 1", old.genid)]);
    assert_eq!(report.status.code(), 1);
}

#[test]
fn too_few_blob_stripes_refuse_to_start() {
    let table = FixtureTable::new("t1", StripeLayout::new(2, 1), 1, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let sink = CollectSink::new();
    let err = verify(&engine, &table.schema, &table.format, &sink, &VerifyConfig::default(), &Cx::new())
        .expect_err("blob stripes fewer than data stripes");
    assert!(matches!(err, fverify_error::VerifyError::InvalidSchema { .. }), "{err}");
    assert!(sink.findings().is_empty());
    assert_eq!(engine.live_lock_tokens(), 0);
}

// ── Blob sentinels ─────────────────────────────────────────────────────

#[test]
fn blob_sentinel_disagreements() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 1), 3, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let gid = genid(1, 0);
    let record = FixtureRecord::new(gid, &[Some(1)])
        .with_blob(0, FixtureBlob::Null)
        .with_blob(1, FixtureBlob::Inline)
        .with_blob(2, FixtureBlob::Stored(vec![0; 10]));
    table.insert(&engine, &record).expect("insert");
    let key = gid.to_bytes();
    engine.put(FileId::Blob { column: 0, stripe: 0 }, key, vec![1, 2]);
    engine.put(FileId::Blob { column: 1, stripe: 0 }, key, vec![1, 2, 3]);
    engine.put(FileId::Blob { column: 2, stripe: 0 }, key, vec![0; 4]);

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(
        findings,
        vec![
            format!("!{gid} blob 0 null but found blob"),
            format!("!{gid} blob 1 size 3 expected none (inline vutf8)"),
            format!("!{gid} blob 2 size mismatch got 4 expected 10"),
        ]
    );
    assert_eq!(report.findings, 3);
}

#[test]
fn repair_is_idempotent() {
    let table = blob_table();
    let engine = table.engine();
    let gid = genid(1, 0);
    let record = FixtureRecord::new(gid, &[Some(7)]).with_blob(0, FixtureBlob::Stored(vec![1; 10]));
    table.insert(&engine, &record).expect("insert");
    engine.put(FileId::Blob { column: 0, stripe: 0 }, gid.to_bytes(), vec![1; 4]);

    let (report, findings) = run(&table, &engine, &fixing());
    assert_eq!(findings, vec![format!("!{gid} blob 0 size mismatch got 4 expected 10")]);
    assert_eq!(report.repairs, 1);

    let (report, findings) = run(&table, &engine, &fixing());
    assert!(findings.is_empty(), "{findings:#?}");
    assert_eq!(report.repairs, 0);
    assert_eq!(engine.commit_count(), 1);
}

#[test]
fn repair_keeps_scanning_following_records() {
    let table = blob_table();
    let engine = table.engine();
    for stamp in 1..=5 {
        let record = FixtureRecord::new(genid(stamp, 0), &[Some(stamp as u32)])
            .with_blob(0, FixtureBlob::Stored(vec![0; 6]));
        table.insert(&engine, &record).expect("insert");
    }
    for stamp in [2, 4] {
        assert!(engine.delete(FileId::Blob { column: 0, stripe: 0 }, &genid(stamp, 0).to_bytes()));
    }

    let (report, findings) = run(&table, &engine, &fixing());
    assert_eq!(findings.len(), 2);
    assert_eq!(report.repairs, 2);
    // Five data records, five index entries, three blob rows.
    assert_eq!(report.records_visited, 13);

    let (report, _) = run_default(&table, &engine);
    assert!(report.status.is_clean());
}

#[test]
fn orphaned_blob_row() {
    let table = blob_table();
    let engine = table.engine();
    let gid = genid(8, 0);
    engine.put(FileId::Blob { column: 0, stripe: 0 }, gid.to_bytes(), b"lost".to_vec());

    let (_, findings) = run_default(&table, &engine);
    assert_eq!(findings, vec![format!("!{gid} orphaned blob 0")]);
}

#[test]
fn missing_blob_stripe_file() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 2), 1, &[IndexDescriptor::unique()]);
    let smaller = FixtureTable::new("t1", StripeLayout::new(1, 1), 1, &[IndexDescriptor::unique()]);
    let engine = smaller.engine();

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(
        findings,
        vec!["!incorrect number of blobs? blob index 0 stripe 1 has no DB".to_owned()]
    );
    assert_eq!(report.units_completed, report.units_total);
}

// ── Index cross-checks ─────────────────────────────────────────────────

#[test]
fn index_membership_mismatches() {
    let table = FixtureTable::new(
        "t1",
        StripeLayout::new(1, 1),
        0,
        &[IndexDescriptor::unique(), IndexDescriptor::unique()],
    );
    let engine = table.engine();
    let absent = FixtureRecord::new(genid(1, 0), &[Some(1), Some(10)]).without_index(0);
    let missing = FixtureRecord::new(genid(2, 0), &[Some(2), Some(20)]);
    table.insert(&engine, &absent).expect("insert");
    table.insert(&engine, &missing).expect("insert");

    // An entry the record's has-keys bitmap says should not exist.
    engine.put(
        FileId::Index { index: 0 },
        table.index_key(&absent, 0).expect("key"),
        table.index_value(&absent, 0).expect("value"),
    );
    assert!(engine.delete(
        FileId::Index { index: 1 },
        &table.index_key(&missing, 1).expect("key")
    ));

    let (_, findings) = run_default(&table, &engine);
    assert_eq!(
        findings,
        vec![
            format!("!{} ix 0 expect notfound but got an index", absent.genid),
            format!("!{} ix 1 missing key", missing.genid),
        ]
    );
}

#[test]
fn unique_index_entry_pointing_elsewhere() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 1), 0, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    let first = FixtureRecord::new(genid(1, 0), &[Some(1)]);
    let second = FixtureRecord::new(genid(2, 0), &[Some(2)]);
    table.insert(&engine, &first).expect("insert");
    table.insert(&engine, &second).expect("insert");
    engine.put(
        FileId::Index { index: 0 },
        table.index_key(&first, 0).expect("key"),
        second.genid.to_bytes().to_vec(),
    );

    let (_, findings) = run_default(&table, &engine);
    assert_finding(
        &findings,
        &format!("!{} ix 0 genid mismatch {}", first.genid, second.genid),
    );
    assert_finding(&findings, &format!("!{} ix 0 key mismatch", second.genid));
}

#[test]
fn dups_and_nullable_suffixes_are_clean() {
    let table = FixtureTable::new(
        "t1",
        StripeLayout::new(2, 1),
        0,
        &[
            IndexDescriptor::unique().with_dups(),
            IndexDescriptor::unique().with_nullable(),
        ],
    );
    let engine = table.engine();
    let records = [
        FixtureRecord::new(Genid::compose(1, 3, 0), &[Some(5), Some(1)]),
        FixtureRecord::new(Genid::compose(2, 0, 1), &[Some(5), None]),
        FixtureRecord::new(Genid::compose(3, 7, 1), &[Some(6), None]),
    ];
    for record in &records {
        table.insert(&engine, record).expect("insert");
    }

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert_eq!(report.units_completed, 4);
}

#[test]
fn dups_suffix_mismatch() {
    let table = FixtureTable::new(
        "t1",
        StripeLayout::new(1, 1),
        0,
        &[IndexDescriptor::unique().with_dups()],
    );
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(5)]);
    table.insert(&engine, &record).expect("insert");

    let stray = genid(9, 0);
    let mut key = 5_u32.to_be_bytes().to_vec();
    key.extend_from_slice(&stray.to_bytes());
    engine.put(FileId::Index { index: 0 }, key, record.genid.to_bytes().to_vec());

    let (_, findings) = run_default(&table, &engine);
    let gid = record.genid;
    assert_eq!(
        findings,
        vec![format!("!{stray} ix 0 dupe key genid != dta genid {gid} ({gid})")]
    );
}

#[test]
fn index_key_and_payload_shapes() {
    let table = FixtureTable::new(
        "t1",
        StripeLayout::new(1, 1),
        0,
        &[
            IndexDescriptor::unique(),
            IndexDescriptor::unique().with_payload(IndexPayload::CollationAttrs { count: 2 }),
        ],
    );
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(1), Some(2)]);
    table.insert(&engine, &record).expect("insert");
    let gid = record.genid;

    let mut long_key = 1_u32.to_be_bytes().to_vec();
    long_key.push(0);
    engine.put(FileId::Index { index: 0 }, long_key, gid.to_bytes().to_vec());
    engine.put(FileId::Index { index: 0 }, vec![0, 0], gid.to_bytes().to_vec());
    engine.put(FileId::Index { index: 0 }, vec![9, 9, 9, 9], gid.to_bytes()[..6].to_vec());

    let mut short_payload = gid.to_bytes().to_vec();
    short_payload.extend_from_slice(&[0; 4]);
    engine.put(
        FileId::Index { index: 1 },
        table.index_key(&record, 1).expect("key"),
        short_payload,
    );

    let (_, findings) = run_default(&table, &engine);
    assert_finding(&findings, &format!("!{gid} ix 0 key size 2 < formed key 4"));
    assert_finding(&findings, &format!("!{gid} ix 0 key size mismatch expected 4 got 5"));
    assert_finding(&findings, "!ix 0 unexpected length 6");
    assert_finding(
        &findings,
        &format!("!{gid} ix 1 decimal payload wrong size expected 16 got 12"),
    );
}

#[test]
fn datacopy_indexes() {
    let table = FixtureTable::new(
        "t1",
        StripeLayout::new(1, 1),
        0,
        &[
            IndexDescriptor::unique().with_payload(IndexPayload::Datacopy { packed: false }),
            IndexDescriptor::unique().with_payload(IndexPayload::Datacopy { packed: true }),
        ],
    );
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(1), Some(2)]);
    table.insert(&engine, &record).expect("insert");

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert!(report.status.is_clean());

    let gid = record.genid;
    let mut copy = table.index_value(&record, 0).expect("value");
    let last = copy.len() - 1;
    copy[last] ^= 0xFF;
    engine.put(FileId::Index { index: 0 }, table.index_key(&record, 0).expect("key"), copy);
    let mut packed = table.index_value(&record, 1).expect("value");
    packed[8] = 0;
    engine.put(FileId::Index { index: 1 }, table.index_key(&record, 1).expect("key"), packed);

    let (_, findings) = run_default(&table, &engine);
    assert_finding(&findings, &format!("!{gid} ix 0 dtacpy data mismatch"));
    assert!(
        findings
            .iter()
            .any(|line| line.starts_with(&format!("!{gid} ix 1 dtacpy unpack rc "))),
        "{findings:#?}"
    );
}

#[test]
fn expression_indexes_reload_blobs() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 1), 1, &[IndexDescriptor::unique()])
        .expression();
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(4)])
        .with_blob(0, FixtureBlob::Stored(b"ab".to_vec()));
    table.insert(&engine, &record).expect("insert");

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert!(report.status.is_clean());

    let disabled = VerifyConfig {
        expression_indexes: false,
        ..VerifyConfig::default()
    };
    let (_, findings) = run(&table, &engine, &disabled);
    assert_eq!(findings, vec![format!("!{} ix 0 key mismatch", record.genid)]);
}

#[test]
fn legacy_records_translate_before_checks() {
    let table = blob_table();
    let engine = table.engine();
    let record = FixtureRecord::new(genid(1, 0), &[Some(7)])
        .with_blob(0, FixtureBlob::Stored(vec![3; 5]));
    table.insert(&engine, &record).expect("insert");
    engine.put_versioned(
        FileId::Data { stripe: 0 },
        record.genid.to_bytes(),
        table.encode_legacy(&record),
        LEGACY_VERSION,
    );

    let (report, findings) = run_default(&table, &engine);
    assert!(findings.is_empty(), "{findings:#?}");
    assert!(report.status.is_clean());
}

#[test]
fn unknown_record_version_is_a_finding() {
    let table = FixtureTable::new("t1", StripeLayout::new(1, 1), 0, &[IndexDescriptor::unique()]);
    let engine = table.engine();
    for stamp in 1..=3 {
        let record = FixtureRecord::new(genid(stamp, 0), &[Some(stamp as u32)]);
        table.insert(&engine, &record).expect("insert");
    }
    let bad = FixtureRecord::new(genid(2, 0), &[Some(2)]);
    engine.put_versioned(FileId::Data { stripe: 0 }, bad.genid.to_bytes(), table.encode(&bad), 7);

    let (report, findings) = run_default(&table, &engine);
    let line = format!("!{} vtag rc record format error: unknown record version 7", bad.genid);
    assert_eq!(findings, vec![line.clone(), line]);
    assert_eq!(report.status.code(), 1);
    assert_eq!(report.units_completed, 2);
    assert_eq!(report.units_failed, 0);
    assert_eq!(report.records_visited, 6);
    assert!(report.failures.is_empty());
}

#[test]
fn malformed_genids() {
    let table = blob_table();
    let engine = table.engine();
    engine.put(FileId::Data { stripe: 0 }, vec![1, 2, 3, 4], vec![0; 4]);
    let stray = Genid::compose(5, 0, 9);
    engine.put(FileId::Blob { column: 0, stripe: 0 }, stray.to_bytes(), b"x".to_vec());

    let (report, findings) = run_default(&table, &engine);
    assert_eq!(
        findings,
        vec!["!bad genid sz 4".to_owned(), format!("!{stray} unknown dtafile")]
    );
    assert_eq!(report.units_completed, report.units_total);
}

#[test]
fn report_serializes_findings() {
    let table = blob_table();
    let engine = table.engine();
    let gid = genid(3, 0);
    engine.put(FileId::Blob { column: 0, stripe: 0 }, gid.to_bytes(), b"z".to_vec());

    let (report, _) = run_default(&table, &engine);
    let json: serde_json::Value =
        serde_json::from_str(&report.to_json().expect("json")).expect("parse");
    assert_eq!(json["status"]["state"], "inconsistent");
    assert_eq!(json["status"]["code"], 1);
    assert_eq!(json["inconsistencies"][0]["kind"], "orphaned_blob");
    assert_eq!(json["units_total"], 3);
    assert_eq!(
        ProcessingUnit::enumerate(&table.schema).len() as u64,
        report.units_total
    );
}
