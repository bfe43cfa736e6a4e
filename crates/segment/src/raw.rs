use std::{
    fs,
    io::{
        Read,
        Write,
    },
    path::Path,
};

use errors::EngineError;

use crate::{
    engine::{
        SegmentEngine,
        SegmentHandle,
        SegmentSearchResult,
        SENTINEL_ID,
    },
    index::IndexEngine,
    metrics::log_engine_cached,
    reducer::select_top_k,
    Metric,
};

/// A flat, unindexed segment: vectors are kept as a plain `Vec` and searched
/// by brute force. This is the only engine variant that supports `merge` —
/// the compaction loop accumulates several RAW segments into one by
/// repeatedly calling it.
pub struct RawEngine {
    handle: SegmentHandle,
    rows: Vec<(i64, Vec<f32>)>,
    loaded: bool,
}

impl RawEngine {
    pub fn new(handle: SegmentHandle) -> Self {
        Self {
            handle,
            rows: Vec::new(),
            loaded: false,
        }
    }

    /// Build an already-loaded engine directly from rows held in memory,
    /// skipping a disk read. Used by the memory manager to flush a buffer
    /// straight to a new segment without a round trip through `load`.
    pub fn from_rows(handle: SegmentHandle, rows: Vec<(i64, Vec<f32>)>) -> Self {
        Self {
            handle,
            rows,
            loaded: true,
        }
    }

    fn require_loaded(&self) -> anyhow::Result<()> {
        if !self.loaded {
            return Err(EngineError::engine("segment not loaded").into());
        }
        Ok(())
    }

    fn read_rows(path: &Path, dim: usize) -> anyhow::Result<Vec<(i64, Vec<f32>)>> {
        let mut file = fs::File::open(path)
            .map_err(|e| EngineError::io(format!("opening segment {path:?}: {e}")))?;
        let mut header = [0u8; 12];
        file.read_exact(&mut header)
            .map_err(|e| EngineError::io(format!("reading segment header {path:?}: {e}")))?;
        let file_dim = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let count = u64::from_le_bytes(header[4..12].try_into().unwrap()) as usize;
        if file_dim != dim {
            return Err(EngineError::invalid_argument(
                "DimensionMismatch",
                format!("segment {path:?} has dimension {file_dim}, expected {dim}"),
            )
            .into());
        }
        let mut rows = Vec::with_capacity(count);
        let mut id_buf = [0u8; 8];
        let mut vec_buf = vec![0u8; dim * 4];
        for _ in 0..count {
            file.read_exact(&mut id_buf)
                .map_err(|e| EngineError::io(format!("reading segment row {path:?}: {e}")))?;
            file.read_exact(&mut vec_buf)
                .map_err(|e| EngineError::io(format!("reading segment row {path:?}: {e}")))?;
            let id = i64::from_le_bytes(id_buf);
            let vector = vec_buf
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            rows.push((id, vector));
        }
        Ok(rows)
    }
}

impl SegmentEngine for RawEngine {
    fn load(&mut self) -> anyhow::Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.rows = if self.handle.location.exists() {
            Self::read_rows(&self.handle.location, self.handle.dim)?
        } else {
            Vec::new()
        };
        self.loaded = true;
        Ok(())
    }

    fn search(&self, queries: &[f32], nq: usize, k: usize) -> anyhow::Result<SegmentSearchResult> {
        self.require_loaded()?;
        let dim = self.handle.dim;
        let metric = self.handle.metric;
        let mut ids = Vec::with_capacity(nq * k);
        let mut distances = Vec::with_capacity(nq * k);
        for q in 0..nq {
            let query = &queries[q * dim..(q + 1) * dim];
            let candidates = self
                .rows
                .iter()
                .map(|(id, vector)| (*id, metric.distance(query, vector)));
            let mut row = select_top_k(metric, candidates, k);
            row.resize(k, (SENTINEL_ID, sentinel_distance(metric)));
            for (id, distance) in row {
                ids.push(id);
                distances.push(distance);
            }
        }
        Ok(SegmentSearchResult { ids, distances })
    }

    fn merge(&mut self, other_location: &Path) -> anyhow::Result<()> {
        self.require_loaded()?;
        let other_rows = Self::read_rows(other_location, self.handle.dim)?;
        self.rows.extend(other_rows);
        Ok(())
    }

    fn size(&self) -> usize {
        self.rows.len()
    }

    fn physical_size(&self) -> f64 {
        let bytes = fs::metadata(&self.handle.location)
            .map(|m| m.len())
            .unwrap_or_else(|_| (12 + self.rows.len() * (8 + self.handle.dim * 4)) as u64);
        bytes as f64 / (1024.0 * 1024.0)
    }

    fn serialize(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.handle.location.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating segment directory: {e}")))?;
        }
        let mut file = fs::File::create(&self.handle.location)
            .map_err(|e| EngineError::io(format!("creating segment {:?}: {e}", self.handle.location)))?;
        file.write_all(&(self.handle.dim as u32).to_le_bytes())
            .and_then(|_| file.write_all(&(self.rows.len() as u64).to_le_bytes()))
            .map_err(|e| EngineError::io(format!("writing segment header: {e}")))?;
        for (id, vector) in &self.rows {
            file.write_all(&id.to_le_bytes())
                .map_err(|e| EngineError::io(format!("writing segment row: {e}")))?;
            for component in vector {
                file.write_all(&component.to_le_bytes())
                    .map_err(|e| EngineError::io(format!("writing segment row: {e}")))?;
            }
        }
        Ok(())
    }

    fn build_index(
        &self,
        target_location: &Path,
        minimum_trainable: usize,
    ) -> anyhow::Result<Box<dyn SegmentEngine>> {
        self.require_loaded()?;
        if self.rows.len() < minimum_trainable {
            return Err(EngineError::invalid_argument(
                "NotEnoughRowsToIndex",
                format!(
                    "segment has {} rows, fewer than minimum_trainable={minimum_trainable}",
                    self.rows.len()
                ),
            )
            .into());
        }
        let mut index = IndexEngine::build(
            SegmentHandle::new(target_location, self.handle.dim, self.handle.metric),
            &self.rows,
        )?;
        index.serialize()?;
        Ok(Box::new(index))
    }

    fn cache(&self) {
        log_engine_cached();
        tracing::debug!(location = ?self.handle.location, "cached raw segment engine");
    }
}

fn sentinel_distance(metric: Metric) -> f32 {
    match metric {
        Metric::L2 => f32::INFINITY,
        Metric::Ip => f32::NEG_INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn handle(dir: &Path, dim: usize, metric: Metric) -> SegmentHandle {
        SegmentHandle::new(dir.join("seg.bin"), dim, metric)
    }

    #[test]
    fn round_trips_through_serialize_and_load() {
        let dir = tempdir().unwrap();
        let mut engine = RawEngine::new(handle(dir.path(), 2, Metric::L2));
        engine.load().unwrap();
        engine.rows.push((1, vec![1.0, 0.0]));
        engine.rows.push((2, vec![0.0, 1.0]));
        engine.serialize().unwrap();

        let mut reloaded = RawEngine::new(handle(dir.path(), 2, Metric::L2));
        reloaded.load().unwrap();
        assert_eq!(reloaded.size(), 2);
    }

    #[test]
    fn search_returns_closest_point_first_under_l2() {
        let dir = tempdir().unwrap();
        let mut engine = RawEngine::new(handle(dir.path(), 2, Metric::L2));
        engine.load().unwrap();
        engine.rows.push((1, vec![1.0, 0.0]));
        engine.rows.push((2, vec![0.0, 1.0]));
        engine.rows.push((3, vec![5.0, 5.0]));

        let result = engine.search(&[1.0, 0.0], 1, 2).unwrap();
        assert_eq!(&result.ids[0..2], &[1, 2]);
    }

    #[test]
    fn search_pads_with_sentinel_when_fewer_rows_than_k() {
        let dir = tempdir().unwrap();
        let mut engine = RawEngine::new(handle(dir.path(), 2, Metric::L2));
        engine.load().unwrap();
        engine.rows.push((1, vec![1.0, 0.0]));

        let result = engine.search(&[1.0, 0.0], 1, 3).unwrap();
        assert_eq!(result.ids, vec![1, SENTINEL_ID, SENTINEL_ID]);
    }

    #[test]
    fn merge_appends_other_segments_rows() {
        let dir = tempdir().unwrap();
        let mut a = RawEngine::new(handle(dir.path(), 2, Metric::L2));
        a.load().unwrap();
        a.rows.push((1, vec![1.0, 0.0]));
        a.serialize().unwrap();

        let mut target = RawEngine::new(SegmentHandle::new(
            dir.path().join("target.bin"),
            2,
            Metric::L2,
        ));
        target.load().unwrap();
        target.merge(&dir.path().join("seg.bin")).unwrap();
        assert_eq!(target.size(), 1);
    }
}
