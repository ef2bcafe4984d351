//! Checkpoints, resume, and the fatal paths of a run

mod common;

use common::*;
use dataflow_common::{FieldType, FieldValue};
use dataflow_ingest::framework::{MemorySink, RunState};
use dataflow_ingest::merge::{FieldPolicy, MergeStrategy};
use dataflow_ingest::framework::PipelineSnapshot;
use dataflow_ingest::{CheckpointStore, ConfigError, Pipeline, PipelineConfig, ReportObserver, Stage};
use std::sync::{Arc, Mutex};

fn catalogue() -> Vec<dataflow_common::RawRecord> {
    (0..11)
        .map(|i| {
            product(
                &format!("SKU{}", i % 4),
                &format!("Part {}", i),
                &format!("{}.5", (i * 7) % 10),
                if i % 2 == 0 { "" } else { "stocked" },
            )
        })
        .collect()
}

fn strategy() -> MergeStrategy {
    field_rules(&[("price", FieldPolicy::KeepMax), ("desc", FieldPolicy::KeepLongest)])
}

#[tokio::test]
async fn test_resume_from_checkpoint_file_matches_uninterrupted_run() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    let config = product_config(strategy(), 3);

    let mut full = Pipeline::new(&config).unwrap();
    let expected = full.run(&products(catalogue()), &MemorySink::new()).await;
    assert!(expected.is_done());

    let first = Pipeline::new(&config).unwrap().with_checkpoint_store(store.clone());
    let token = first.cancellation_token();
    let mut first = first.with_observer(Arc::new(CancelAfter::new(2, token)));
    let stopped = first.run(&products(catalogue()), &MemorySink::new()).await;
    assert_eq!(stopped.state, RunState::Stopped);

    let checkpoint = store.load().unwrap().unwrap();
    assert_eq!(checkpoint.offset, 6);
    assert_eq!(checkpoint.chunk_index, 2);

    let mut resumed = Pipeline::from_checkpoint(&config, checkpoint).unwrap();
    assert_eq!(resumed.offset(), 6);
    let outcome = resumed.run(&products(catalogue()), &MemorySink::new()).await;

    assert!(outcome.is_done());
    assert_eq!(outcome.checkpoint.table, expected.checkpoint.table);
    assert_eq!(outcome.summary.counts, expected.summary.counts);
    assert_eq!(outcome.summary.run_id, stopped.summary.run_id);
}

/// Chunk index of the stored checkpoint after every commit
struct StoreWatcher {
    store: CheckpointStore,
    seen: Mutex<Vec<Option<u64>>>,
}

impl ReportObserver for StoreWatcher {
    fn on_chunk(&self, _snapshot: &PipelineSnapshot) {
        let saved = self.store.load().unwrap().map(|cp| cp.chunk_index);
        self.seen.lock().unwrap().push(saved);
    }
}

#[tokio::test]
async fn test_checkpoint_interval_saves_every_n_chunks_and_on_stop() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    let config = product_config(strategy(), 2).with_checkpoint_interval(2);

    let mut full = Pipeline::new(&config).unwrap();
    let expected = full.run(&products(catalogue()), &MemorySink::new()).await;

    let watcher = Arc::new(StoreWatcher {
        store: store.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let first = Pipeline::new(&config).unwrap().with_checkpoint_store(store.clone());
    let token = first.cancellation_token();
    let mut first = first
        .with_observer(watcher.clone())
        .with_observer(Arc::new(CancelAfter::new(3, token)));
    let stopped = first.run(&products(catalogue()), &MemorySink::new()).await;

    assert_eq!(stopped.state, RunState::Stopped);
    assert_eq!(*watcher.seen.lock().unwrap(), vec![None, Some(2), Some(2)]);

    let checkpoint = store.load().unwrap().unwrap();
    assert_eq!(checkpoint.chunk_index, 3);
    assert_eq!(checkpoint.offset, 6);

    let mut resumed = Pipeline::from_checkpoint(&config, checkpoint).unwrap();
    let outcome = resumed.run(&products(catalogue()), &MemorySink::new()).await;
    assert!(outcome.is_done());
    assert_eq!(outcome.checkpoint.table, expected.checkpoint.table);
    assert_eq!(outcome.summary.counts, expected.summary.counts);
}

#[tokio::test]
async fn test_resume_in_memory_at_every_split() {
    init_tracing();

    let config = product_config(strategy(), 2);
    let mut full = Pipeline::new(&config).unwrap();
    let expected = full.run(&products(catalogue()), &MemorySink::new()).await;

    for split in 1..=6 {
        let first = Pipeline::new(&config).unwrap();
        let token = first.cancellation_token();
        let mut first = first.with_observer(Arc::new(CancelAfter::new(split, token)));
        let stopped = first.run(&products(catalogue()), &MemorySink::new()).await;

        let mut resumed = Pipeline::from_checkpoint(&config, stopped.checkpoint).unwrap();
        let outcome = resumed.run(&products(catalogue()), &MemorySink::new()).await;

        assert!(outcome.is_done(), "split {}", split);
        assert_eq!(outcome.checkpoint.table, expected.checkpoint.table, "split {}", split);
        assert_eq!(outcome.summary.counts, expected.summary.counts, "split {}", split);
        assert_eq!(outcome.summary.errors, expected.summary.errors, "split {}", split);
    }
}

#[tokio::test]
async fn test_checkpoint_with_other_worker_count_is_rejected() {
    let config = product_config(strategy(), 3);
    let mut pipeline = Pipeline::new(&config).unwrap();
    let outcome = pipeline.run(&products(catalogue()), &MemorySink::new()).await;

    let result = Pipeline::from_checkpoint(&config.with_worker_concurrency(2), outcome.checkpoint);
    assert!(matches!(result, Err(ConfigError::Checkpoint(_))));
}

#[tokio::test]
async fn test_resume_with_changed_field_type_reports_merge_conflict() {
    init_tracing();

    let rows = || {
        products(vec![
            product("A1", "Hammer", "5", ""),
            product("A2", "Saw", "7", ""),
            product("A1", "Hammer", "9", ""),
            product("B1", "Drill", "3", ""),
        ])
    };
    let config = product_config(MergeStrategy::KeepLast, 2);
    let first = Pipeline::new(&config).unwrap();
    let token = first.cancellation_token();
    let mut first = first.with_observer(Arc::new(CancelAfter::new(1, token)));
    let stopped = first.run(&rows(), &MemorySink::new()).await;
    assert_eq!(stopped.state, RunState::Stopped);
    assert_eq!(stopped.checkpoint.offset, 2);

    // Same record type, but price is now read as text
    let mut type_config = product_type(MergeStrategy::KeepLast);
    for field in &mut type_config.fields {
        if field.name == "price" {
            field.field_type = FieldType::String;
        }
    }
    type_config.rules.retain(|rule| rule.id != "price-non-negative");
    let changed = PipelineConfig::default()
        .with_record_type("product", type_config)
        .with_chunk_size(2);

    let sink = MemorySink::new();
    let mut resumed = Pipeline::from_checkpoint(&changed, stopped.checkpoint).unwrap();
    let outcome = resumed.run(&rows(), &sink).await;

    assert!(outcome.is_done());
    let counts = outcome.summary.counts;
    assert_eq!(counts.merge_conflicts, 1);
    assert_eq!(counts.merged, 3);
    assert_eq!(counts.validated, counts.merged + counts.validation_rejected + counts.merge_conflicts);
    assert_eq!(outcome.summary.errors_by_stage.get(&Stage::Merge), Some(&1));

    let conflict = outcome
        .summary
        .errors
        .iter()
        .find(|e| e.stage == Stage::Merge)
        .unwrap();
    assert_eq!(conflict.offset, Some(2));
    assert_eq!(conflict.chunk_index, 1);
    assert_eq!(conflict.identity_key.as_deref(), Some("product|a1"));
    assert!(conflict.message.contains("price"));

    let hammer = resumed.resolved(&key("A1")).unwrap();
    assert_eq!(hammer.get("price"), Some(&FieldValue::Decimal(5.0)));
    assert_eq!(hammer.provenance.count, 1);

    let written = written_by_key(&sink);
    assert!(!written.contains_key("product|a1"));
    assert_eq!(written["product|b1"].len(), 1);
}

#[tokio::test]
async fn test_sink_rejecting_whole_chunk_rolls_back_and_aborts() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    let rows = vec![
        product("A1", "Hammer", "5", ""),
        product("A2", "Saw", "7", ""),
        product("B1", "Drill", "40", ""),
        product("B2", "Chisel", "4", ""),
    ];
    // Chunk 1 holds only A records, chunk 2 only B records
    let sink = RejectingSink::new(|record| record.key.to_string().starts_with("product|b"));
    let mut pipeline = Pipeline::new(&product_config(MergeStrategy::KeepLast, 2))
        .unwrap()
        .with_checkpoint_store(store.clone());

    let outcome = pipeline.run(&products(rows), &sink).await;

    assert!(matches!(outcome.state, RunState::Aborted { .. }));
    assert_eq!(outcome.checkpoint.offset, 2);
    assert_eq!(outcome.checkpoint.table.len(), 2);
    assert!(pipeline.resolved(&key("B1")).is_none());
    assert_eq!(outcome.checkpoint.report.counts.merged, 2);
    assert_eq!(outcome.checkpoint.report.counts.write_errors, 0);

    assert_eq!(outcome.summary.counts.write_errors, 2);
    assert_eq!(outcome.summary.counts.merged, 2);
    assert_eq!(outcome.summary.errors_by_stage.get(&Stage::Write), Some(&2));

    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.offset, 2);
    assert_eq!(saved.table, outcome.checkpoint.table);
    assert_eq!(sink.inner.records().len(), 2);
}

#[tokio::test]
async fn test_partial_write_failure_is_recorded() {
    init_tracing();

    let rows = vec![
        product("A1", "Hammer", "5", ""),
        product("A2", "Saw", "7", ""),
        product("A3", "Drill", "40", ""),
    ];
    let sink = RejectingSink::new(|record| record.key.to_string() == "product|a2");
    let mut pipeline = Pipeline::new(&product_config(MergeStrategy::KeepLast, 10)).unwrap();

    let outcome = pipeline.run(&products(rows), &sink).await;

    assert!(outcome.is_done());
    assert_eq!(outcome.summary.counts.emitted, 2);
    assert_eq!(outcome.summary.counts.write_errors, 1);
    assert_eq!(outcome.summary.counts.merged, 3);

    let write_error = outcome
        .summary
        .errors
        .iter()
        .find(|e| e.stage == Stage::Write)
        .unwrap();
    assert_eq!(write_error.identity_key.as_deref(), Some("product|a2"));
    assert_eq!(sink.inner.records().len(), 2);
}

#[tokio::test]
async fn test_changed_policy_retries_rejected_record_on_next_change() {
    init_tracing();

    let rows = vec![
        product("A1", "Hammer", "5", ""),
        product("A2", "Saw", "7", ""),
        product("A1", "Hammer", "6", ""),
    ];
    let sink = RejectingSink::new(|record| {
        record.key.to_string() == "product|a1" && record.provenance.count == 1
    });
    let mut pipeline = Pipeline::new(&product_config(MergeStrategy::KeepLast, 2)).unwrap();
    let outcome = pipeline.run(&products(rows), &sink).await;

    assert!(outcome.is_done());
    let written = written_by_key(&sink.inner);
    assert_eq!(written["product|a1"].len(), 1);
    assert_eq!(written["product|a1"][0].provenance.count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_source_read_is_retried() {
    init_tracing();

    let source = FlakySource::new(products(catalogue()), 2);
    let mut pipeline = Pipeline::new(&product_config(strategy(), 20)).unwrap();
    let outcome = pipeline.run(&source, &MemorySink::new()).await;

    assert!(outcome.is_done());
    assert_eq!(source.calls(), 3);
    assert_eq!(outcome.summary.counts.read, 11);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_source_aborts_after_retries() {
    init_tracing();

    let source = FlakySource::new(products(catalogue()), u32::MAX);
    let mut config = product_config(strategy(), 20);
    config.pipeline.source_retries = 2;
    let mut pipeline = Pipeline::new(&config).unwrap();
    let outcome = pipeline.run(&source, &MemorySink::new()).await;

    match &outcome.state {
        RunState::Aborted { reason } => assert!(reason.contains("connection reset")),
        other => panic!("expected abort, got {}", other),
    }
    assert_eq!(source.calls(), 3);
    assert_eq!(outcome.checkpoint.offset, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops() {
    init_tracing();

    let source = FlakySource::new(products(catalogue()), u32::MAX);
    let mut config = product_config(strategy(), 20);
    config.pipeline.source_retries = 100;
    config.pipeline.retry_backoff_ms = 1_000;
    let mut pipeline = Pipeline::new(&config).unwrap();
    let token = pipeline.cancellation_token();

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
        token.cancel();
    });
    let outcome = pipeline.run(&source, &MemorySink::new()).await;

    assert_eq!(outcome.state, RunState::Stopped);
    assert!(source.calls() < 100);
}
