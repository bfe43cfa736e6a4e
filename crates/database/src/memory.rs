use std::{
    collections::HashMap,
    path::PathBuf,
};

use catalog::{
    Date,
    FileType,
    FileUpdate,
    MetadataClient,
    NewFile,
};
use errors::EngineError;
use parking_lot::Mutex;
use segment::{
    RawEngine,
    SegmentEngine,
    SegmentHandle,
};

use crate::metrics::log_buffer_flushed;

struct TableBuffer {
    next_id: i64,
    rows: Vec<(i64, Vec<f32>)>,
}

impl Default for TableBuffer {
    fn default() -> Self {
        // Ids are minted starting at 1, matching the engine's documented
        // scenario of inserting two rows and expecting ids {1, 2}.
        Self {
            next_id: 1,
            rows: Vec::new(),
        }
    }
}

/// Per-table in-memory insert buffers. A single mutex guards the whole map
/// (the manager's own internal synchronization); insert and flush both take
/// it only for as long as it takes to touch one table's entry, so a flush
/// of table A never blocks an insert into table B for longer than that.
pub struct MemoryManager {
    state: Mutex<HashMap<String, TableBuffer>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Append `vectors` (row-major, `vectors.len() / dim` rows) to
    /// `table_id`'s buffer, minting monotonically increasing ids.
    pub fn insert(&self, table_id: &str, dim: usize, vectors: &[f32]) -> anyhow::Result<Vec<i64>> {
        if dim == 0 || vectors.len() % dim != 0 {
            return Err(EngineError::invalid_argument(
                "MisalignedVectorBuffer",
                format!(
                    "vector buffer of length {} is not a multiple of dim {dim}",
                    vectors.len()
                ),
            )
            .into());
        }
        let mut state = self.state.lock();
        let buffer = state.entry(table_id.to_owned()).or_default();
        let mut ids = Vec::with_capacity(vectors.len() / dim.max(1));
        for row in vectors.chunks_exact(dim) {
            let id = buffer.next_id;
            buffer.next_id += 1;
            buffer.rows.push((id, row.to_vec()));
            ids.push(id);
        }
        Ok(ids)
    }

    /// Flush every table with a non-empty buffer to a new RAW segment,
    /// registering it via `catalog`. Returns the tables that were flushed,
    /// so callers (the compaction loop) know which ones to merge.
    pub fn serialize(
        &self,
        catalog: &dyn MetadataClient,
        date: &Date,
    ) -> anyhow::Result<Vec<String>> {
        let drained: Vec<(String, Vec<(i64, Vec<f32>)>)> = {
            let mut state = self.state.lock();
            state
                .iter_mut()
                .filter(|(_, buffer)| !buffer.rows.is_empty())
                .map(|(table_id, buffer)| (table_id.clone(), std::mem::take(&mut buffer.rows)))
                .collect()
        };

        let mut flushed = Vec::with_capacity(drained.len());
        for (table_id, rows) in drained {
            let schema = catalog.describe_table(&table_id)?;
            let descriptor = catalog.add_file(NewFile {
                table_id: table_id.clone(),
                date: date.clone(),
                dimension: schema.dim,
            })?;
            let handle = SegmentHandle::new(PathBuf::from(&descriptor.location), schema.dim, schema.metric);
            let mut engine = RawEngine::from_rows(handle, rows);
            let row_count = engine.size() as u64;
            engine.serialize()?;
            catalog.update_files(&[
                FileUpdate::new(descriptor.file_id, FileType::Raw).with_row_count(row_count),
            ])?;
            log_buffer_flushed(row_count);
            tracing::info!(table_id = %table_id, row_count, "flushed memory buffer to raw segment");
            flushed.push(table_id);
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use catalog::{
        Metric,
        SqliteMetadataClient,
    };
    use tempfile::tempdir;

    use super::*;

    fn manager_and_catalog() -> (MemoryManager, Arc<dyn MetadataClient>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(
            SqliteMetadataClient::open_in_memory(dir.path().to_path_buf()).unwrap(),
        ) as Arc<dyn MetadataClient>;
        let manager = MemoryManager::new();
        (manager, catalog, dir)
    }

    #[test]
    fn insert_mints_strictly_increasing_ids_per_table() {
        let (manager, _catalog, _dir) = manager_and_catalog();
        let first = manager.insert("widgets", 2, &[1.0, 0.0, 0.0, 1.0]).unwrap();
        let second = manager.insert("widgets", 2, &[1.0, 1.0]).unwrap();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3]);
    }

    #[test]
    fn insert_rejects_vector_buffer_not_divisible_by_dim() {
        let (manager, _catalog, _dir) = manager_and_catalog();
        let err = manager.insert("widgets", 3, &[1.0, 0.0]).unwrap_err();
        assert!(errors::EngineErrorExt::is_invalid_argument(&err));
    }

    #[test]
    fn serialize_flushes_only_nonempty_buffers_and_drains_them() {
        let (manager, catalog, _dir) = manager_and_catalog();
        catalog.create_table("widgets", 2, Metric::L2).unwrap();
        manager.insert("widgets", 2, &[1.0, 0.0]).unwrap();

        let flushed = manager
            .serialize(catalog.as_ref(), &Date::from("2024-01-01"))
            .unwrap();
        assert_eq!(flushed, vec!["widgets".to_string()]);
        assert_eq!(catalog.count_rows("widgets").unwrap(), 1);

        let flushed_again = manager
            .serialize(catalog.as_ref(), &Date::from("2024-01-01"))
            .unwrap();
        assert!(flushed_again.is_empty(), "a drained buffer has nothing left to flush");
    }
}
