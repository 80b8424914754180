mod common;

use std::sync::Arc;

use ragdb_core::config::PartialFailurePolicy;
use ragdb_core::error::Error;
use ragdb_core::filter::Filter;
use ragdb_core::traits::{IndexMaintenance, VectorIndexer};
use ragdb_core::types::{CompactionStatus, IndexKind};
use ragdb_hybrid::{HybridIndex, ManagerConfig, RetryPolicy, WriteBatch};
use ragdb_text::SparseIndex;
use ragdb_vector::{DenseConfig, DenseIndex};

use common::{prepared, Faulty, DIM};

type Index = HybridIndex<Faulty<DenseIndex>, Faulty<SparseIndex>>;

fn index() -> Index {
    let settings = common::settings(PartialFailurePolicy::FailFast);
    HybridIndex::new(
        Faulty::new(DenseIndex::new(DenseConfig::new(DIM))),
        Faulty::new(SparseIndex::in_memory().unwrap()),
        ManagerConfig::from(&settings),
    )
}

fn counts(index: &Index) -> (usize, usize) {
    (index.count(IndexKind::Dense).unwrap(), index.count(IndexKind::Sparse).unwrap())
}

#[test]
fn upsert_and_delete_are_visible_in_both_indices() {
    let index = index();
    let report = index.upsert(prepared("doc", "doc:0", "solar panels on the roof")).unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(counts(&index), (1, 1));

    assert!(index.delete("doc:0").unwrap());
    assert_eq!(counts(&index), (0, 0));
    for kind in IndexKind::ALL {
        let maintenance: &dyn IndexMaintenance = match kind {
            IndexKind::Dense => index.dense().as_ref() as &dyn IndexMaintenance,
            IndexKind::Sparse => index.sparse().as_ref() as &dyn IndexMaintenance,
        };
        let entry = maintenance.entry_state("doc:0", index.epoch()).unwrap().unwrap();
        assert!(entry.tombstoned, "{kind} entry still live");
    }
    assert!(!index.delete("doc:0").unwrap());
    index.verify_integrity().unwrap();
}

#[test]
fn reupsert_replaces_entry_atomically() {
    let index = index();
    index.upsert(prepared("doc", "doc:0", "first revision")).unwrap();
    let pin = index.pin().unwrap();
    index.upsert(prepared("doc", "doc:0", "second revision")).unwrap();

    assert_eq!(counts(&index), (1, 1));
    let old = index.dense().entry_state("doc:0", pin.epoch()).unwrap().unwrap();
    let new = index.sparse().entry_state("doc:0", index.epoch()).unwrap().unwrap();
    assert_eq!(old.version, 1);
    assert!(!old.tombstoned);
    assert_eq!(new.version, 2);
}

#[test]
fn count_excludes_tombstones_before_and_after_compaction() {
    let index = index();
    let batch = (0..10).fold(WriteBatch::new(), |b, i| {
        b.upsert(prepared("bulk", &format!("bulk:{i}"), &format!("entry number {i} about gardens")))
    });
    index.commit(batch).unwrap();
    for i in 0..4 {
        index.delete(&format!("bulk:{i}")).unwrap();
    }

    assert_eq!(counts(&index), (6, 6));
    let stats = index.stats().unwrap();
    assert_eq!(stats.dense.tombstoned, 4);
    assert_eq!(stats.sparse.physical, 10);
    assert!(index.needs_compaction(IndexKind::Dense).unwrap());

    let reports = index.compact_if_needed().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.status == CompactionStatus::Completed && r.reclaimed == 4));
    assert_eq!(counts(&index), (6, 6));
    let stats = index.stats().unwrap();
    assert_eq!((stats.dense.physical, stats.dense.tombstoned), (6, 0));
    assert!(stats.sparse.last_compaction.is_some());
    assert!(!index.needs_compaction(IndexKind::Sparse).unwrap());
    index.verify_integrity().unwrap();
}

#[test]
fn compaction_keeps_entries_visible_to_pinned_readers() {
    let index = index();
    index.upsert(prepared("doc", "doc:0", "kept while pinned")).unwrap();
    let pin = index.pin().unwrap();
    index.delete("doc:0").unwrap();

    let reports = index.compact_all().unwrap();
    assert!(reports.iter().all(|r| r.reclaimed == 0 && r.retained == 1));
    let seen = index.dense().entry_state("doc:0", pin.epoch()).unwrap().unwrap();
    assert!(!seen.tombstoned);

    drop(pin);
    let reports = index.compact_all().unwrap();
    assert!(reports.iter().all(|r| r.reclaimed == 1 && r.retained == 0));
    assert_eq!(counts(&index), (0, 0));
}

#[test]
fn transient_backend_failures_are_retried() {
    let index = index();
    index.dense().fail_upserts(2);
    index.upsert(prepared("doc", "doc:0", "flaky but fine")).unwrap();
    assert_eq!(counts(&index), (1, 1));
    index.verify_integrity().unwrap();
}

#[test]
fn exhausted_retries_roll_back_both_indices() {
    let index = index();
    index.upsert(prepared("doc", "doc:a", "original text")).unwrap();
    let before = index.epoch();

    index.sparse().fail_upserts(10);
    let batch = WriteBatch::new()
        .upsert(prepared("doc", "doc:b", "brand new"))
        .upsert(prepared("doc", "doc:a", "rewritten text"));
    let err = index.commit(batch).unwrap_err();
    assert!(matches!(err, Error::IndexUnavailable { kind: IndexKind::Sparse, attempts: 3, .. }), "{err}");
    assert!(err.is_retryable());

    index.sparse().fail_upserts(0);
    assert_eq!(index.epoch(), before);
    assert_eq!(counts(&index), (1, 1));
    let a = index.dense().entry_state("doc:a", index.epoch() + 1).unwrap().unwrap();
    assert_eq!(a.version, 1);
    assert!(!a.tombstoned);
    assert!(index.dense().entry_state("doc:b", index.epoch() + 1).unwrap().is_none());
    index.verify_integrity().unwrap();

    // The aborted version number is reused by the next batch.
    let report = index.upsert(prepared("doc", "doc:b", "brand new")).unwrap();
    assert_eq!(report.version, before + 1);
    assert_eq!(counts(&index), (2, 2));
}

#[test]
fn rolled_back_reupsert_keeps_previous_entry_after_version_reuse() {
    let index = index();
    index.upsert(prepared("doc", "doc:a", "original text")).unwrap();

    index.sparse().fail_upserts(10);
    let err = index.upsert(prepared("doc", "doc:a", "rewritten text")).unwrap_err();
    assert!(matches!(err, Error::IndexUnavailable { kind: IndexKind::Sparse, .. }), "{err}");
    index.sparse().fail_upserts(0);

    let report = index.upsert(prepared("other", "other:0", "unrelated")).unwrap();
    assert_eq!(report.version, 2);
    for at in [1, 2] {
        let dense = index.dense().entry_state("doc:a", at).unwrap().unwrap();
        let sparse = index.sparse().entry_state("doc:a", at).unwrap().unwrap();
        assert_eq!((dense.version, dense.tombstoned), (1, false));
        assert_eq!(dense.version, sparse.version);
        assert!(!sparse.tombstoned);
    }
    assert_eq!(counts(&index), (2, 2));
    index.verify_integrity().unwrap();
}

#[test]
fn validation_errors_are_not_retried() {
    let index = HybridIndex::new(
        Faulty::new(DenseIndex::new(DenseConfig::new(DIM))),
        Faulty::new(SparseIndex::in_memory().unwrap()),
        ManagerConfig { retry: RetryPolicy::none(), ..ManagerConfig::default() },
    );
    let mut bad = prepared("doc", "doc:0", "text");
    bad.embedding.dense.truncate(3);
    assert!(matches!(index.upsert(bad), Err(Error::Validation(_))));

    let mut mismatched = prepared("doc", "doc:0", "text");
    mismatched.embedding.chunk_id = "other".into();
    assert!(matches!(index.upsert(mismatched), Err(Error::Validation(_))));
    assert_eq!(index.epoch(), 0);
}

#[test]
fn delete_by_filter_and_document() {
    let index = index();
    let mut tagged = prepared("manual", "manual:0", "pump maintenance");
    Arc::make_mut(&mut tagged.chunk).metadata.insert("lang".into(), "de".into());
    index
        .commit(
            WriteBatch::new()
                .upsert(tagged)
                .upsert(prepared("manual", "manual:1", "pump wiring"))
                .upsert(prepared("notes", "notes:0", "pump noises")),
        )
        .unwrap();

    assert_eq!(index.delete_by_filter(&Filter::parse("lang == 'de'").unwrap()).unwrap(), 1);
    assert_eq!(index.document_chunk_ids("manual").unwrap(), vec!["manual:1".to_string()]);
    assert_eq!(index.delete_document("manual").unwrap(), 1);
    assert_eq!(counts(&index), (1, 1));
    assert!(matches!(index.delete_by_filter(&Filter::new()), Err(Error::Validation(_))));
}

#[test]
fn replace_document_swaps_chunks_in_one_epoch() {
    let index = index();
    index
        .upsert_many(vec![prepared("d", "d:0", "one"), prepared("d", "d:1", "two"), prepared("d", "d:2", "three")])
        .unwrap();
    let report = index.replace_document("d", vec![prepared("d", "d:0", "uno")]).unwrap();
    assert_eq!(report.deleted, 3);
    assert_eq!(report.upserted, 1);
    assert_eq!(index.document_chunk_ids("d").unwrap(), vec!["d:0".to_string()]);

    let stray = index.replace_document("d", vec![prepared("e", "e:0", "elsewhere")]);
    assert!(matches!(stray, Err(Error::Validation(_))));
}

#[test]
fn integrity_check_reports_divergence() {
    let index = index();
    index.upsert(prepared("doc", "doc:0", "balanced")).unwrap();
    index.verify_integrity().unwrap();

    // Bypass the manager and write to one index only.
    let stray = prepared("doc", "doc:1", "dense only");
    index.dense().upsert(stray.chunk.clone(), &stray.embedding.dense, index.epoch()).unwrap();
    let err = index.verify_integrity().unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("doc:1 only in dense index"), "{err}");

    // Deleting it through the manager trips the same check.
    assert!(matches!(index.delete("doc:1"), Err(Error::InconsistentState(_))));
}

#[tokio::test]
async fn background_compaction_completes() {
    let index = Arc::new(index());
    index.upsert(prepared("doc", "doc:0", "short lived")).unwrap();
    index.delete("doc:0").unwrap();
    let report = index.spawn_compaction(IndexKind::Dense).await.unwrap().unwrap();
    assert_eq!(report.status, CompactionStatus::Completed);
    assert_eq!(report.reclaimed, 1);
    assert_eq!(index.stats().unwrap().dense.physical, 0);
    // The sparse side was not compacted and still holds the tombstone.
    assert_eq!(index.stats().unwrap().sparse.physical, 1);
}
