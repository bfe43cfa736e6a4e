use std::{
    path::PathBuf,
    sync::Arc,
};

use catalog::{
    FileType,
    FileUpdate,
    MetadataClient,
    NewFile,
};
use parking_lot::Mutex;
use runtime::Runtime;
use segment::{
    RawEngine,
    SegmentEngine,
    SegmentHandle,
};

use crate::{
    bg::BgState,
    metrics::INDEX_BUILDS_TOTAL,
};

/// At most one concurrent index-build pass, per the index build loop's
/// design: `try_build_index` is a guarded no-op while a pass is already
/// running or shutdown has started.
pub struct IndexBuildLoop<RT: Runtime> {
    catalog: Arc<dyn MetadataClient>,
    minimum_trainable: usize,
    bg: Arc<BgState>,
    runtime: RT,
    started: Arc<Mutex<bool>>,
}

impl<RT: Runtime> IndexBuildLoop<RT> {
    pub fn new(
        catalog: Arc<dyn MetadataClient>,
        minimum_trainable: usize,
        bg: Arc<BgState>,
        runtime: RT,
    ) -> Self {
        Self {
            catalog,
            minimum_trainable,
            bg,
            runtime,
            started: Arc::new(Mutex::new(false)),
        }
    }

    /// Start a pass in the background unless one is already running, or the
    /// engine is shutting down, or the background loops have already hit a
    /// sticky-fatal error. Never blocks the caller.
    pub fn try_build_index(&self) {
        if self.bg.is_shutting_down() || self.bg.has_error() {
            return;
        }
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;
        drop(started);

        let catalog = self.catalog.clone();
        let minimum_trainable = self.minimum_trainable;
        let bg = self.bg.clone();
        let started_flag = self.started.clone();
        self.runtime.spawn("index-build-pass", async move {
            if let Err(e) = run_pass(catalog.as_ref(), minimum_trainable) {
                tracing::error!(error = %e, "index build pass failed, suspending background loops");
                bg.set_error(e);
            }
            *started_flag.lock() = false;
        });
    }

    pub fn is_running(&self) -> bool {
        *self.started.lock()
    }

    /// Block until the in-flight pass (if any) has finished. Used by the
    /// lifecycle supervisor during shutdown.
    pub async fn await_idle(&self) {
        while self.is_running() {
            self.runtime.wait(crate::bg::SHUTDOWN_POLL_INTERVAL).await;
        }
    }
}

fn run_pass(catalog: &dyn MetadataClient, minimum_trainable: usize) -> anyhow::Result<()> {
    let files = catalog.files_to_index()?;
    for file in files {
        let mut engine = RawEngine::new(SegmentHandle::new(
            PathBuf::from(&file.location),
            file.dimension,
            catalog.describe_table(&file.table_id)?.metric,
        ));
        engine.load()?;

        let target = catalog.add_file(NewFile {
            table_id: file.table_id.clone(),
            date: file.date.clone(),
            dimension: file.dimension,
        })?;
        let built = engine.build_index(std::path::Path::new(&target.location), minimum_trainable)?;
        let row_count = built.size() as u64;

        catalog.update_files(&[
            FileUpdate::new(file.file_id, FileType::ToDelete),
            FileUpdate::new(target.file_id, FileType::Index).with_row_count(row_count),
        ])?;
        metrics::log_counter_with_labels(&INDEX_BUILDS_TOTAL, 1, vec![
            metrics::MetricLabel::STATUS_SUCCESS,
        ]);
        tracing::info!(
            table_id = %file.table_id,
            file_id = file.file_id,
            row_count,
            "promoted raw segment to an indexed one"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use catalog::{
        Date,
        Metric,
        SqliteMetadataClient,
    };
    use runtime::testing::test_runtime;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn try_build_index_is_a_noop_while_a_pass_is_running() {
        let dir = tempdir().unwrap();
        let catalog: Arc<dyn MetadataClient> =
            Arc::new(SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap());
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        let bg = BgState::new();
        let loop_ = IndexBuildLoop::new(catalog, 1, bg, test_runtime());

        loop_.try_build_index();
        assert!(loop_.is_running(), "started flag set before the worker is spawned");
        loop_.try_build_index();
        loop_.await_idle().await;
        assert!(!loop_.is_running());
    }

    #[tokio::test]
    async fn promotes_to_index_files_into_index_files() {
        let dir = tempdir().unwrap();
        let catalog: Arc<dyn MetadataClient> =
            Arc::new(SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap());
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        let file = catalog
            .add_file(NewFile {
                table_id: "widgets".into(),
                date: Date::from("2024-01-01"),
                dimension: 2,
            })
            .unwrap();
        let rows = (0..5).map(|i| (i as i64, vec![i as f32, 0.0])).collect();
        let mut raw = RawEngine::from_rows(
            SegmentHandle::new(PathBuf::from(&file.location), 2, Metric::L2),
            rows,
        );
        raw.serialize().unwrap();
        catalog
            .update_files(&[FileUpdate::new(file.file_id, FileType::ToIndex).with_row_count(5)])
            .unwrap();

        let bg = BgState::new();
        let loop_ = IndexBuildLoop::new(catalog.clone(), 1, bg.clone(), test_runtime());
        loop_.try_build_index();
        loop_.await_idle().await;

        assert!(!bg.has_error(), "{:?}", bg.error());
        assert!(catalog.files_to_index().unwrap().is_empty());
    }
}
