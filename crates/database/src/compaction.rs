use std::sync::Arc;

use catalog::{
    FileType,
    FileUpdate,
    MetadataClient,
};
use errors::EngineError;
use segment::{
    RawEngine,
    SegmentEngine,
    SegmentHandle,
};

use crate::{
    bg::BgState,
    config::Config,
    index_build::IndexBuildLoop,
    memory::MemoryManager,
    metrics::{
        log_compaction_tick_timer,
        FILES_MERGED_TOTAL,
    },
};

/// One compaction timer tick: flush buffers, merge eligible raw files,
/// nudge the index build loop, and reclaim expired `to_delete` files. A
/// tick never partially commits past a failing step — it records the
/// failure to `bg_state` and stops, per the sticky-fatal error policy.
pub async fn tick<RT: runtime::Runtime>(
    catalog: &dyn MetadataClient,
    memory: &MemoryManager,
    config: &Config,
    bg: &Arc<BgState>,
    index_build: &IndexBuildLoop<RT>,
    now: catalog::Date,
) {
    if bg.has_error() {
        return;
    }
    let timer = log_compaction_tick_timer();
    match run_tick(catalog, memory, config, &now).await {
        Ok(()) => {
            timer.finish();
            index_build.try_build_index();
            if let Err(e) = catalog.cleanup_ttl(config.ttl_seconds) {
                // TTL cleanup failure is logged and swallowed, not sticky.
                tracing::warn!(error = %e, "ttl cleanup failed this tick");
            }
        },
        Err(e) => {
            timer.finish_with("error");
            tracing::error!(error = %e, "compaction tick failed, suspending background loops");
            bg.set_error(e);
        },
    }
}

async fn run_tick(
    catalog: &dyn MetadataClient,
    memory: &MemoryManager,
    config: &Config,
    now: &catalog::Date,
) -> anyhow::Result<()> {
    let flushed_tables = memory.serialize(catalog, now)?;
    for table_id in flushed_tables {
        background_merge_files(catalog, config, &table_id)?;
    }
    Ok(())
}

/// Merge every (date) group of raw files for `table_id` whose size exceeds
/// `merge_trigger_number`, consuming inputs in ascending `file_id` order.
pub fn background_merge_files(
    catalog: &dyn MetadataClient,
    config: &Config,
    table_id: &str,
) -> anyhow::Result<()> {
    let schema = catalog.describe_table(table_id)?;
    let groups = catalog.files_to_merge(table_id)?;
    for (date, files) in groups {
        if files.len() <= config.merge_trigger_number {
            continue;
        }
        let target = catalog.add_file(catalog::NewFile {
            table_id: table_id.to_owned(),
            date,
            dimension: schema.dim,
        })?;
        let handle = SegmentHandle::new(
            std::path::PathBuf::from(&target.location),
            schema.dim,
            schema.metric,
        );
        let mut engine = RawEngine::new(handle);
        engine.load()?;

        let mut updated = Vec::with_capacity(files.len() + 1);
        for file in &files {
            engine
                .merge(std::path::Path::new(&file.location))
                .map_err(|e| {
                    EngineError::engine(format!(
                        "merging {} into target segment: {e}",
                        file.location
                    ))
                })?;
            updated.push(FileUpdate::new(file.file_id, FileType::ToDelete));
            metrics::log_counter(&FILES_MERGED_TOTAL, 1);
            if engine.size() >= config.index_trigger_size {
                break;
            }
        }

        engine.serialize()?;
        let row_count = engine.size() as u64;
        let target_type = if row_count as usize >= config.index_trigger_size {
            FileType::ToIndex
        } else {
            FileType::Raw
        };
        updated.push(FileUpdate::new(target.file_id, target_type).with_row_count(row_count));
        catalog.update_files(&updated)?;
        engine.cache();
        tracing::info!(
            table_id,
            files_merged = updated.len() - 1,
            row_count,
            target_type = %target_type,
            "merged raw segments"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use catalog::{
        Date,
        Metric,
        SqliteMetadataClient,
    };
    use tempfile::tempdir;

    use super::*;

    fn catalog_and_memory() -> (Arc<dyn MetadataClient>, MemoryManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(
            SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap(),
        ) as Arc<dyn MetadataClient>;
        (catalog, MemoryManager::new(), dir)
    }

    #[test]
    fn merge_consumes_files_once_the_trigger_is_exceeded() {
        let (catalog, memory, _dir) = catalog_and_memory();
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        let config = Config {
            merge_trigger_number: 1,
            ..Config::default()
        };

        for _ in 0..3 {
            memory.insert("widgets", 2, &[1.0, 0.0]).unwrap();
            memory
                .serialize(catalog.as_ref(), &Date::from("2024-01-01"))
                .unwrap();
        }

        let before = catalog.files_to_merge("widgets").unwrap();
        assert_eq!(before[&Date::from("2024-01-01")].len(), 3);

        background_merge_files(catalog.as_ref(), &config, "widgets").unwrap();

        let after = catalog.files_to_merge("widgets").unwrap();
        assert!(after.is_empty(), "all raw files should have merged into one target");
        assert_eq!(catalog.count_rows("widgets").unwrap(), 3);
    }

    #[test]
    fn merge_leaves_groups_at_or_under_the_trigger_alone() {
        let (catalog, memory, _dir) = catalog_and_memory();
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        let config = Config {
            merge_trigger_number: 4,
            ..Config::default()
        };
        memory.insert("widgets", 2, &[1.0, 0.0]).unwrap();
        memory
            .serialize(catalog.as_ref(), &Date::from("2024-01-01"))
            .unwrap();

        background_merge_files(catalog.as_ref(), &config, "widgets").unwrap();

        let after = catalog.files_to_merge("widgets").unwrap();
        assert_eq!(after[&Date::from("2024-01-01")].len(), 1);
    }
}
