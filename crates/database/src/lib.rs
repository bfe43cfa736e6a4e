//! The storage and query engine of a vector database: ingest, background
//! compaction and index build, and fan-out query execution over segment
//! files tracked by a metadata catalog.
//!
//! [`Engine`] is the single entry point. It owns the in-memory insert
//! buffers ([`memory::MemoryManager`]), a handle to the catalog
//! ([`catalog::MetadataClient`]), and the two background loops
//! ([`compaction`], [`index_build`]) that move segment files through their
//! lifecycle. Everything is generic over [`runtime::Runtime`] so production
//! code runs against a real `tokio` executor and tests run against the
//! ambient one.

mod bg;
mod compaction;
mod config;
mod index_build;
mod memory;
mod metrics;
mod query;

use std::sync::Arc;

use catalog::{
    Date,
    MetadataClient,
    Metric,
    TableSchema,
};
use errors::EngineError;
use runtime::{
    Runtime,
    SpawnHandle,
};
use segment::SegmentSearchResult;

pub use crate::{
    bg::BgState,
    config::Config,
};
use crate::{
    index_build::IndexBuildLoop,
    memory::MemoryManager,
};

/// The storage and query engine. Cheap to clone (most state is behind
/// `Arc`); clones share the same background loops and catalog.
pub struct Engine<RT: Runtime> {
    catalog: Arc<dyn MetadataClient>,
    memory: Arc<MemoryManager>,
    config: Config,
    bg: Arc<BgState>,
    index_build: Arc<IndexBuildLoop<RT>>,
    runtime: RT,
    compaction_handle: parking_lot::Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> Engine<RT> {
    /// Construct the engine and start its compaction timer loop.
    pub fn new(catalog: Arc<dyn MetadataClient>, config: Config, runtime: RT) -> Self {
        let bg = BgState::new();
        let memory = Arc::new(MemoryManager::new());
        let index_build = Arc::new(IndexBuildLoop::new(
            catalog.clone(),
            config.minimum_trainable,
            bg.clone(),
            runtime.clone(),
        ));

        let handle = runtime.spawn("compaction-loop", run_compaction_loop(
            catalog.clone(),
            memory.clone(),
            config.clone(),
            bg.clone(),
            index_build.clone(),
            runtime.clone(),
        ));

        Self {
            catalog,
            memory,
            config,
            bg,
            index_build,
            runtime,
            compaction_handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    fn reject_if_shutting_down(&self) -> anyhow::Result<()> {
        if self.bg.is_shutting_down() {
            return Err(EngineError::shutting_down().into());
        }
        Ok(())
    }

    pub fn create_table(&self, table_id: &str, dim: usize, metric: Metric) -> anyhow::Result<()> {
        self.catalog.create_table(table_id, dim, metric)
    }

    pub fn has_table(&self, table_id: &str) -> anyhow::Result<bool> {
        self.catalog.has_table(table_id)
    }

    pub fn describe_table(&self, table_id: &str) -> anyhow::Result<TableSchema> {
        self.catalog.describe_table(table_id)
    }

    pub fn all_tables(&self) -> anyhow::Result<Vec<TableSchema>> {
        self.catalog.all_tables()
    }

    pub fn delete_table(&self, table_id: &str, dates: &[Date]) -> anyhow::Result<()> {
        self.catalog.delete_table(table_id, dates)
    }

    pub fn get_table_row_count(&self, table_id: &str) -> anyhow::Result<u64> {
        self.catalog.count_rows(table_id)
    }

    /// Append `vectors` (row-major, `vectors.len() / dim` rows) to
    /// `table_id`'s in-memory buffer and return the minted ids.
    pub fn insert_vectors(&self, table_id: &str, vectors: &[f32]) -> anyhow::Result<Vec<i64>> {
        self.reject_if_shutting_down()?;
        let schema = self.catalog.describe_table(table_id)?;
        self.memory.insert(table_id, schema.dim, vectors)
    }

    pub async fn query(
        &self,
        table_id: &str,
        k: usize,
        nq: usize,
        vectors: &[f32],
        dates: &[Date],
    ) -> anyhow::Result<SegmentSearchResult> {
        self.reject_if_shutting_down()?;
        query::query(
            self.catalog.as_ref(),
            table_id,
            k,
            nq,
            vectors,
            dates,
            self.config.fanout_parallelism,
        )
        .await
    }

    pub async fn query_explicit(
        &self,
        table_id: &str,
        file_ids: &[catalog::FileId],
        k: usize,
        nq: usize,
        vectors: &[f32],
    ) -> anyhow::Result<SegmentSearchResult> {
        self.reject_if_shutting_down()?;
        query::query_explicit(
            self.catalog.as_ref(),
            table_id,
            k,
            nq,
            vectors,
            file_ids,
            self.config.fanout_parallelism,
        )
        .await
    }

    pub fn drop_all(&self) -> anyhow::Result<()> {
        self.catalog.drop_all()
    }

    /// Approximate physical footprint in bytes: row count times per-row
    /// storage cost (an 8-byte id plus `dim` 4-byte floats), summed over
    /// every table's non-deleted files. The segment file layout is opaque
    /// to the engine, so this is an estimate from catalog-tracked row
    /// counts rather than a filesystem walk.
    pub fn size(&self) -> anyhow::Result<u64> {
        let mut total = 0u64;
        for table in self.catalog.all_tables()? {
            let rows = self.catalog.count_rows(&table.table_id)?;
            total += rows * (8 + table.dim as u64 * 4);
        }
        Ok(total)
    }

    /// Graceful shutdown: stop accepting new inserts/queries, let the
    /// compaction loop finish its current tick, await any in-flight index
    /// build, then flush remaining buffers so no acknowledged insert is
    /// lost. Matches the lifecycle supervisor's documented behavior of not
    /// recompacting after this final flush.
    pub async fn shutdown(&self) {
        self.bg.begin_shutdown();
        if let Some(mut handle) = self.compaction_handle.lock().take() {
            if let Err(e) = handle.join().await {
                tracing::warn!(error = %e, "compaction loop join reported an error");
            }
        }
        self.index_build.await_idle().await;
        if let Err(e) = self.memory.serialize(self.catalog.as_ref(), &today(&self.runtime)) {
            tracing::error!(error = %e, "final flush during shutdown failed");
        }
    }
}

/// Test-only hooks that drive the background loops' individual steps
/// synchronously, so integration tests can assert on intermediate catalog
/// state without racing the real timer loop.
#[cfg(any(test, feature = "testing"))]
impl<RT: Runtime> Engine<RT> {
    pub fn flush_for_test(&self, date: &Date) -> anyhow::Result<Vec<String>> {
        self.memory.serialize(self.catalog.as_ref(), date)
    }

    pub fn merge_for_test(&self, table_id: &str) -> anyhow::Result<()> {
        compaction::background_merge_files(self.catalog.as_ref(), &self.config, table_id)
    }

    pub fn files_to_merge_for_test(
        &self,
        table_id: &str,
    ) -> anyhow::Result<std::collections::BTreeMap<Date, Vec<catalog::FileDescriptor>>> {
        self.catalog.files_to_merge(table_id)
    }

    pub fn files_to_index_for_test(&self, table_id: &str) -> anyhow::Result<Vec<catalog::FileDescriptor>> {
        Ok(self
            .catalog
            .files_to_index()?
            .into_iter()
            .filter(|f| f.table_id == table_id)
            .collect())
    }

    /// Force every `Raw` file of `table_id` to `ToIndex`, bypassing the
    /// merge-triggered promotion, so a test can exercise the index build
    /// loop directly.
    pub fn mark_to_index_for_test(&self, table_id: &str) -> anyhow::Result<()> {
        let updates: Vec<catalog::FileUpdate> = self
            .catalog
            .files_to_merge(table_id)?
            .into_values()
            .flatten()
            .map(|f| catalog::FileUpdate::new(f.file_id, catalog::FileType::ToIndex))
            .collect();
        self.catalog.update_files(&updates)
    }

    pub fn start_index_build_for_test(&self) {
        self.index_build.try_build_index();
    }
}

fn today(runtime: &impl Runtime) -> Date {
    let now: chrono::DateTime<chrono::Utc> = runtime.system_time().into();
    Date::new(now.format("%Y-%m-%d").to_string())
}

async fn run_compaction_loop<RT: Runtime>(
    catalog: Arc<dyn MetadataClient>,
    memory: Arc<MemoryManager>,
    config: Config,
    bg: Arc<BgState>,
    index_build: Arc<IndexBuildLoop<RT>>,
    runtime: RT,
) {
    let interval = std::time::Duration::from_secs(config.memory_sync_interval_seconds);
    loop {
        if !bg::wait_or_shutdown(&runtime, &bg, interval).await {
            return;
        }
        compaction::tick(
            catalog.as_ref(),
            memory.as_ref(),
            &config,
            &bg,
            index_build.as_ref(),
            today(&runtime),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use catalog::SqliteMetadataClient;
    use runtime::testing::test_runtime;
    use tempfile::tempdir;

    use super::*;

    fn engine() -> (Engine<runtime::prod::TokioRuntime>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let catalog: Arc<dyn MetadataClient> =
            Arc::new(SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap());
        let config = Config {
            memory_sync_interval_seconds: 3600,
            ..Config::default()
        };
        (Engine::new(catalog, config, test_runtime()), dir)
    }

    #[tokio::test]
    async fn create_insert_query_round_trip() {
        let (engine, _dir) = engine();
        engine.create_table("widgets", 4, Metric::L2).unwrap();
        let ids = engine
            .insert_vectors("widgets", &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(ids, vec![1, 2]);

        let result = engine
            .query("widgets", 1, 1, &[1.0, 0.0, 0.0, 0.0], &[])
            .await
            .unwrap();
        // Buffered inserts are not visible until a flush; with no dates the
        // search set is empty and the result is all-sentinel.
        assert_eq!(result.ids, vec![segment::SENTINEL_ID]);
    }

    #[tokio::test]
    async fn query_sees_flushed_inserts() {
        let (engine, _dir) = engine();
        engine.create_table("widgets", 2, Metric::L2).unwrap();
        engine.insert_vectors("widgets", &[1.0, 0.0]).unwrap();
        let today = today(&engine.runtime);
        engine
            .memory
            .serialize(engine.catalog.as_ref(), &today)
            .unwrap();

        let result = engine
            .query("widgets", 1, 1, &[1.0, 0.0], &[today])
            .await
            .unwrap();
        assert_eq!(result.ids, vec![1]);
    }

    #[tokio::test]
    async fn insert_rejected_after_shutdown() {
        let (engine, _dir) = engine();
        engine.create_table("widgets", 2, Metric::L2).unwrap();
        engine.shutdown().await;
        let err = engine.insert_vectors("widgets", &[1.0, 0.0]).unwrap_err();
        assert!(errors::EngineErrorExt::is_shutting_down(&err));
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_inserts() {
        let (engine, _dir) = engine();
        engine.create_table("widgets", 2, Metric::L2).unwrap();
        engine.insert_vectors("widgets", &[1.0, 0.0]).unwrap();
        engine.shutdown().await;
        assert_eq!(engine.get_table_row_count("widgets").unwrap(), 1);
    }

    #[test]
    fn size_is_zero_for_a_fresh_engine() {
        let (engine, _dir) = engine();
        engine.create_table("widgets", 4, Metric::L2).unwrap();
        assert_eq!(engine.size().unwrap(), 0);
    }
}
