mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use linkage_harness::backend::BackendError;
use linkage_harness::{DatabaseApi, EmTrainingOptions, InputTable, LinkType, Linker, SqliteBackend, Table};
use tempfile::tempdir;

/// Delegates to SQLite, asks for blocked pairs to be materialised and tracks
/// which physical tables are alive. With `stall` set, every materialise
/// creates its table and then hangs, like a slow backend finishing late.
struct TrackingBackend {
    inner: SqliteBackend,
    live: Mutex<HashSet<String>>,
    stall: Option<Duration>,
}

impl TrackingBackend {
    fn new(inner: SqliteBackend) -> Self {
        Self {
            inner,
            live: Mutex::new(HashSet::new()),
            stall: None,
        }
    }

    fn stalling(inner: SqliteBackend, stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::new(inner)
        }
    }

    fn live_tables(&self) -> HashSet<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseApi for TrackingBackend {
    fn dialect_name(&self) -> &'static str {
        self.inner.dialect_name()
    }

    fn supports_repartition_after_blocking(&self) -> bool {
        true
    }

    async fn register_table(&self, physical_name: &str, table: &Table) -> Result<(), BackendError> {
        self.inner.register_table(physical_name, table).await?;
        self.live.lock().unwrap().insert(physical_name.to_string());
        Ok(())
    }

    async fn materialise(&self, sql: &str, physical_name: &str) -> Result<(), BackendError> {
        self.inner.materialise(sql, physical_name).await?;
        self.live.lock().unwrap().insert(physical_name.to_string());
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }

    async fn fetch(&self, physical_name: &str, limit: Option<usize>) -> Result<Table, BackendError> {
        self.inner.fetch(physical_name, limit).await
    }

    async fn drop_table(&self, physical_name: &str) -> Result<(), BackendError> {
        self.inner.drop_table(physical_name).await?;
        self.live.lock().unwrap().remove(physical_name);
        Ok(())
    }
}

async fn tracked_linker() -> (Linker, Arc<TrackingBackend>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let sqlite = SqliteBackend::open(dir.path().join("linkage.sqlite")).unwrap();
    assert!(sqlite.path().is_some());
    let backend = Arc::new(TrackingBackend::new(sqlite));
    let linker = Linker::new(
        vec![InputTable::new("people", common::people(150, 5))],
        common::settings(LinkType::DedupeOnly),
        backend.clone(),
    )
    .await
    .unwrap();
    (linker, backend, dir)
}

#[tokio::test]
async fn staged_tables_are_released_after_every_operation() {
    let (mut linker, backend, _dir) = tracked_linker().await;
    let inputs = backend.live_tables();
    assert_eq!(inputs.len(), 1);

    linker.count_num_comparisons_from_blocking_rule("l.surname = r.surname").await.unwrap();
    linker
        .cumulative_comparisons_generated_by_blocking_rules(&[], true, false)
        .await
        .unwrap();
    assert_eq!(backend.live_tables(), inputs);

    linker.estimate_u_using_random_sampling(1_000).await.unwrap();
    assert_eq!(backend.live_tables(), inputs);

    linker
        .estimate_parameters_using_expectation_maximisation("l.city = r.city", EmTrainingOptions::default())
        .await
        .unwrap();
    assert_eq!(backend.live_tables(), inputs);
}

#[tokio::test]
async fn staged_tables_are_released_when_training_fails() {
    let (mut linker, backend, _dir) = tracked_linker().await;
    let inputs = backend.live_tables();

    let err = linker
        .estimate_parameters_using_expectation_maximisation("1=0", EmTrainingOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "em_training_error");
    assert_eq!(backend.live_tables(), inputs);
}

#[tokio::test]
async fn generous_phase_timeout_does_not_interfere() {
    let records = common::people(50, 8);
    let mut settings = common::settings(LinkType::DedupeOnly);
    settings.phase_timeout_secs = Some(30);
    let linker = Linker::with_sqlite(vec![InputTable::new("people", records.clone())], settings)
        .await
        .unwrap();
    let count = linker.count_comparisons_from_blocking_rule_post_filters("1=1").await.unwrap();
    let n = records.len() as u64;
    assert_eq!(count, n * (n - 1) / 2);
}

#[tokio::test]
async fn timed_out_phase_drops_the_table_it_was_creating() {
    let dir = tempdir().unwrap();
    let sqlite = SqliteBackend::open(dir.path().join("linkage.sqlite")).unwrap();
    let backend = Arc::new(TrackingBackend::stalling(sqlite, Duration::from_secs(30)));
    let mut settings = common::settings(LinkType::DedupeOnly);
    settings.phase_timeout_secs = Some(1);
    let linker = Linker::new(
        vec![InputTable::new("people", common::people(50, 8))],
        settings,
        backend.clone(),
    )
    .await
    .unwrap();
    let inputs = backend.live_tables();

    let err = linker
        .count_comparisons_from_blocking_rule_post_filters("1=1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
    assert_eq!(backend.live_tables(), inputs);
}
