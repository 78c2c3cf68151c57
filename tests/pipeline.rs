//! End-to-end pipeline tests over a scripted transport.

use async_trait::async_trait;
use mesh_cdc::common::{
    CdcError, DatabaseSpec, MemoryPositionStore, OperationKind, PersistedPosition,
    ReplicationPosition, SharedPositionStore,
};
use mesh_cdc::mysql::{
    BinlogSource, BinlogSourceConfig, BinlogTransport, ColumnDefinition, DataSourceKind, PollState,
    RawBatch, RawEntry, ResumeFrom, RowChange, RowData, TableDefinition, TableMetaCache,
    TransportFactory,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct ScriptedTransport {
    script: VecDeque<Option<RawBatch>>,
    acked: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl BinlogTransport for ScriptedTransport {
    async fn next_batch(&mut self, _hint: usize) -> mesh_cdc::Result<Option<RawBatch>> {
        Ok(self.script.pop_front().flatten())
    }

    async fn ack(&mut self, message_id: u64) -> mesh_cdc::Result<()> {
        self.acked.lock().unwrap().push(message_id);
        Ok(())
    }
}

struct ScriptedFactory {
    script: Mutex<VecDeque<Option<RawBatch>>>,
    acked: Arc<Mutex<Vec<u64>>>,
    resumes: Arc<Mutex<Vec<ResumeFrom>>>,
}

impl ScriptedFactory {
    fn new(script: Vec<Option<RawBatch>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            acked: Arc::new(Mutex::new(Vec::new())),
            resumes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(&self, resume: &ResumeFrom) -> mesh_cdc::Result<Box<dyn BinlogTransport>> {
        self.resumes.lock().unwrap().push(resume.clone());
        Ok(Box::new(ScriptedTransport {
            script: std::mem::take(&mut self.script.lock().unwrap()),
            acked: Arc::clone(&self.acked),
        }))
    }
}

fn config() -> BinlogSourceConfig {
    BinlogSourceConfig::new("db.example", "repl", "secret", "orders", "job-1")
        .with_database(DatabaseSpec::new("shop", &["orders"]))
        .with_batch_size(3)
        .with_batch_timeout_ms(0)
}

fn cache(config: &BinlogSourceConfig) -> Arc<TableMetaCache> {
    Arc::new(TableMetaCache::with_tables(
        config.table_filter().unwrap(),
        vec![TableDefinition {
            schema: "shop".into(),
            table: "orders".into(),
            columns: vec![
                ColumnDefinition {
                    name: "id".into(),
                    sql_type: "bigint".into(),
                    primary_key: true,
                },
                ColumnDefinition {
                    name: "status".into(),
                    sql_type: "varchar".into(),
                    primary_key: false,
                },
            ],
        }],
    ))
}

fn insert_entry(offset: u64, id: i64) -> RawEntry {
    RawEntry::row_data(
        "mysql-bin.000001",
        offset,
        1_700_000_000_000,
        "shop",
        "orders",
        OperationKind::Insert,
        &RowChange {
            rows: vec![RowData {
                before: None,
                after: Some(vec![json!(id), json!("new")]),
            }],
        },
    )
    .unwrap()
}

/// One transaction with `rows` inserts, committing at `commit_offset`.
fn transaction(start_offset: u64, commit_offset: u64, rows: usize) -> Vec<RawEntry> {
    let mut entries = vec![RawEntry::transaction_begin(
        "mysql-bin.000001",
        start_offset,
        0,
    )];
    for i in 0..rows {
        entries.push(insert_entry(start_offset + 20 * (i as u64 + 1), i as i64));
    }
    entries.push(RawEntry::transaction_end(
        "mysql-bin.000001",
        commit_offset,
        0,
    ));
    entries
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn build_source(
    factory: ScriptedFactory,
    store: SharedPositionStore,
) -> (BinlogSource, Arc<Mutex<Vec<u64>>>, Arc<Mutex<Vec<ResumeFrom>>>) {
    init_tracing();
    let acked = Arc::clone(&factory.acked);
    let resumes = Arc::clone(&factory.resumes);
    let config = config();
    let cache = cache(&config);
    let source = BinlogSource::build(
        config,
        store,
        Box::new(factory),
        cache,
        DataSourceKind::MySql,
    )
    .await
    .unwrap();
    (source, acked, resumes)
}

fn memory_store() -> SharedPositionStore {
    Arc::new(MemoryPositionStore::new("server-1"))
}

#[tokio::test]
async fn test_transaction_split_into_bounded_batches() {
    let unit = RawBatch::new(1, transaction(100, 300, 7));
    let factory = ScriptedFactory::new(vec![Some(unit)]);
    let (mut source, _, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let records = source.poll().await.unwrap();
    assert_eq!(records.len(), 3);
    let sizes: Vec<usize> = records.iter().map(|r| r.records().unwrap().len()).collect();
    assert_eq!(sizes, vec![3, 3, 1]);

    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.extensions.batch_index, i);
        assert_eq!(record.extensions.total_batches, 3);
        assert_eq!(record.offset.offset, 300);
        assert_eq!(record.partition.server_identity, "server-1");
        assert_eq!(record.partition.journal_name, "mysql-bin.000001");
    }
    source.commit().await.unwrap();
}

#[tokio::test]
async fn test_unit_acked_only_after_commit() {
    let unit = RawBatch::new(9, transaction(100, 200, 2));
    let factory = ScriptedFactory::new(vec![Some(unit)]);
    let (mut source, acked, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let records = source.poll().await.unwrap();
    assert!(!records.is_empty());
    assert!(acked.lock().unwrap().is_empty());
    assert_eq!(source.state(), PollState::Emitting);

    source.commit().await.unwrap();
    assert_eq!(*acked.lock().unwrap(), vec![9]);
    assert_eq!(source.state(), PollState::Idle);
}

#[tokio::test]
async fn test_poll_again_before_commit_fails() {
    let unit = RawBatch::new(1, transaction(100, 200, 1));
    let factory = ScriptedFactory::new(vec![Some(unit)]);
    let (mut source, _, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    source.poll().await.unwrap();
    let err = source.poll().await.unwrap_err();
    assert!(matches!(err, CdcError::InvalidState(_)));

    // Commit unblocks the cycle.
    source.commit().await.unwrap();
}

#[tokio::test]
async fn test_empty_and_dataless_units_are_skipped() {
    let heartbeat_unit = RawBatch::new(
        1,
        vec![RawEntry::heartbeat("mysql-bin.000001", 50, 0)],
    );
    let data_unit = RawBatch::new(2, transaction(100, 200, 1));
    let factory = ScriptedFactory::new(vec![None, Some(heartbeat_unit), None, Some(data_unit)]);
    let (mut source, acked, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let records = source.poll().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].extensions.message_id, 2);
    // The dataless unit was acknowledged inline; the data unit was not.
    assert_eq!(*acked.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_fresh_job_starts_at_head() {
    let factory = ScriptedFactory::new(vec![Some(RawBatch::new(1, transaction(100, 200, 1)))]);
    let (mut source, _, resumes) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();
    assert_eq!(*resumes.lock().unwrap(), vec![ResumeFrom::Head]);
}

#[tokio::test]
async fn test_stored_position_drives_resume() {
    let store = MemoryPositionStore::new("server-1");
    store
        .save(
            "job-1",
            ReplicationPosition::file_offset("server-1", "mysql-bin.000003", 6163),
        )
        .await;
    let factory = ScriptedFactory::new(vec![]);
    let (mut source, _, resumes) = build_source(factory, Arc::new(store)).await;
    source.start().await.unwrap();

    assert_eq!(
        *resumes.lock().unwrap(),
        vec![ResumeFrom::FileOffset {
            journal_file: "mysql-bin.000003".into(),
            byte_offset: 6163,
        }]
    );
}

#[tokio::test]
async fn test_configured_positions_used_when_store_is_empty() {
    init_tracing();
    let mut cfg = config();
    cfg.record_positions = vec![
        PersistedPosition {
            journal_name: "mysql-bin.000002".into(),
            position: 500,
            gtid: None,
            timestamp: 0,
        },
        PersistedPosition {
            journal_name: "mysql-bin.000002".into(),
            position: 120,
            gtid: None,
            timestamp: 0,
        },
    ];
    let factory = ScriptedFactory::new(vec![]);
    let resumes = Arc::clone(&factory.resumes);
    let cache = cache(&cfg);
    let mut source = BinlogSource::build(
        cfg,
        memory_store(),
        Box::new(factory),
        cache,
        DataSourceKind::MySql,
    )
    .await
    .unwrap();
    source.start().await.unwrap();

    // The earliest configured position wins (at-least-once).
    assert_eq!(
        *resumes.lock().unwrap(),
        vec![ResumeFrom::FileOffset {
            journal_file: "mysql-bin.000002".into(),
            byte_offset: 120,
        }]
    );
}

#[tokio::test]
async fn test_multiple_transactions_emitted_in_commit_order() {
    let mut entries = transaction(100, 200, 1);
    entries.extend(transaction(210, 300, 1));
    entries.extend(transaction(310, 400, 1));
    let factory = ScriptedFactory::new(vec![Some(RawBatch::new(1, entries))]);
    let (mut source, _, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let records = source.poll().await.unwrap();
    let offsets: Vec<u64> = records.iter().map(|r| r.offset.offset).collect();
    assert_eq!(offsets, vec![200, 300, 400]);
}

#[tokio::test]
async fn test_offsets_non_decreasing_across_units() {
    let unit1 = RawBatch::new(1, transaction(100, 200, 2));
    let unit2 = RawBatch::new(2, transaction(210, 400, 2));
    let factory = ScriptedFactory::new(vec![Some(unit1), Some(unit2)]);
    let (mut source, acked, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let mut offsets = Vec::new();
    for _ in 0..2 {
        for record in source.poll().await.unwrap() {
            offsets.push(record.offset.offset);
        }
        source.commit().await.unwrap();
    }

    assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*acked.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_cancelled_source_returns_empty_poll() {
    let factory = ScriptedFactory::new(vec![]);
    let (mut source, _, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    source.stop();
    let records = source.poll().await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_run_delivers_then_commits() {
    let unit = RawBatch::new(5, transaction(100, 300, 5));
    let factory = ScriptedFactory::new(vec![Some(unit)]);
    let (mut source, acked, _) = build_source(factory, memory_store()).await;
    source.start().await.unwrap();

    let cancel = source.cancellation_token();
    let (tx, mut rx) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        source.run(tx).await.unwrap();
    });

    // 5 rows at batch size 3 gives two records.
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.extensions.total_batches, 2);
    assert_eq!(second.extensions.batch_index, 1);

    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(*acked.lock().unwrap(), vec![5]);
}
