use std::{
    fs,
    io::{
        Read,
        Write,
    },
    path::Path,
};

use errors::EngineError;
use rand::seq::SliceRandom;

use crate::{
    engine::{
        SegmentEngine,
        SegmentHandle,
        SegmentSearchResult,
        SENTINEL_ID,
    },
    metrics::log_engine_cached,
    reducer::select_top_k,
    Metric,
};

/// Number of centroids to probe per query. A larger value trades recall for
/// latency; fixed here since the spec treats the ANN index as a black box.
const NPROBE: usize = 4;
/// Lloyd's-algorithm refinement passes when building the index.
const KMEANS_ITERATIONS: usize = 8;

/// A minimal IVF-flat index: vectors are partitioned into `nlist` clusters
/// by a k-means pass, and a query only scans the `NPROBE` clusters whose
/// centroids are closest to it rather than the whole segment, which is what
/// makes this an *approximate* nearest-neighbor search.
pub struct IndexEngine {
    handle: SegmentHandle,
    centroids: Vec<Vec<f32>>,
    postings: Vec<Vec<(i64, Vec<f32>)>>,
    loaded: bool,
}

impl IndexEngine {
    /// A handle over an existing on-disk index, not yet loaded. Used by the
    /// query planner to construct an engine for an `Index` file.
    pub fn new(handle: SegmentHandle) -> Self {
        Self {
            handle,
            centroids: Vec::new(),
            postings: Vec::new(),
            loaded: false,
        }
    }

    fn nlist_for(row_count: usize) -> usize {
        // A classic IVF heuristic: roughly sqrt(N) clusters, at least 1.
        ((row_count as f64).sqrt().ceil() as usize).max(1)
    }

    /// Build a fresh index from a raw segment's in-memory rows. Does not
    /// write anything to disk; call `serialize` afterwards.
    pub fn build(handle: SegmentHandle, rows: &[(i64, Vec<f32>)]) -> anyhow::Result<Self> {
        let nlist = Self::nlist_for(rows.len()).min(rows.len().max(1));
        let mut rng = rand::thread_rng();
        let mut centroids: Vec<Vec<f32>> = rows
            .choose_multiple(&mut rng, nlist)
            .map(|(_, v)| v.clone())
            .collect();

        for _ in 0..KMEANS_ITERATIONS {
            let mut sums = vec![vec![0f32; handle.dim]; centroids.len()];
            let mut counts = vec![0usize; centroids.len()];
            for (_, vector) in rows {
                let nearest = nearest_centroid(&centroids, vector, handle.metric);
                for (d, component) in vector.iter().enumerate() {
                    sums[nearest][d] += component;
                }
                counts[nearest] += 1;
            }
            for (centroid, (sum, count)) in centroids.iter_mut().zip(sums.into_iter().zip(counts))
            {
                if count > 0 {
                    for (c, s) in centroid.iter_mut().zip(sum) {
                        *c = s / count as f32;
                    }
                }
            }
        }

        let mut postings = vec![Vec::new(); centroids.len()];
        for (id, vector) in rows {
            let nearest = nearest_centroid(&centroids, vector, handle.metric);
            postings[nearest].push((*id, vector.clone()));
        }

        Ok(Self {
            handle,
            centroids,
            postings,
            loaded: true,
        })
    }

    fn require_loaded(&self) -> anyhow::Result<()> {
        if !self.loaded {
            return Err(EngineError::engine("index segment not loaded").into());
        }
        Ok(())
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32], metric: Metric) -> usize {
    let mut best = 0;
    let mut best_distance = metric.distance(vector, &centroids[0]);
    for (i, centroid) in centroids.iter().enumerate().skip(1) {
        let distance = metric.distance(vector, centroid);
        if metric.is_better(distance, best_distance) {
            best_distance = distance;
            best = i;
        }
    }
    best
}

impl SegmentEngine for IndexEngine {
    fn load(&mut self) -> anyhow::Result<()> {
        if self.loaded {
            return Ok(());
        }
        let mut file = fs::File::open(&self.handle.location)
            .map_err(|e| EngineError::io(format!("opening index {:?}: {e}", self.handle.location)))?;
        let dim = self.handle.dim;

        let mut header = [0u8; 4];
        file.read_exact(&mut header)
            .map_err(|e| EngineError::io(format!("reading index header: {e}")))?;
        let ncentroids = u32::from_le_bytes(header) as usize;

        let mut centroids = Vec::with_capacity(ncentroids);
        let mut postings = Vec::with_capacity(ncentroids);
        let mut vec_buf = vec![0u8; dim * 4];
        for _ in 0..ncentroids {
            file.read_exact(&mut vec_buf)
                .map_err(|e| EngineError::io(format!("reading centroid: {e}")))?;
            centroids.push(read_vector(&vec_buf));

            let mut count_buf = [0u8; 8];
            file.read_exact(&mut count_buf)
                .map_err(|e| EngineError::io(format!("reading posting list length: {e}")))?;
            let count = u64::from_le_bytes(count_buf) as usize;
            let mut rows = Vec::with_capacity(count);
            let mut id_buf = [0u8; 8];
            for _ in 0..count {
                file.read_exact(&mut id_buf)
                    .map_err(|e| EngineError::io(format!("reading posting row: {e}")))?;
                file.read_exact(&mut vec_buf)
                    .map_err(|e| EngineError::io(format!("reading posting row: {e}")))?;
                rows.push((i64::from_le_bytes(id_buf), read_vector(&vec_buf)));
            }
            postings.push(rows);
        }

        self.centroids = centroids;
        self.postings = postings;
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

            let mut ranked_centroids: Vec<(usize, f32)> = self
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, metric.distance(query, c)))
                .collect();
            ranked_centroids.sort_by(|a, b| {
                if metric.is_better(a.1, b.1) {
                    std::cmp::Ordering::Less
                } else if metric.is_better(b.1, a.1) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            });

            let candidates = ranked_centroids
                .into_iter()
                .take(NPROBE)
                .flat_map(|(cluster, _)| self.postings[cluster].iter())
                .map(|(id, vector)| (*id, metric.distance(query, vector)));
            let mut row = select_top_k(metric, candidates, k);
            row.resize(
                k,
                (
                    SENTINEL_ID,
                    match metric {
                        Metric::L2 => f32::INFINITY,
                        Metric::Ip => f32::NEG_INFINITY,
                    },
                ),
            );
            for (id, distance) in row {
                ids.push(id);
                distances.push(distance);
            }
        }
        Ok(SegmentSearchResult { ids, distances })
    }

    fn merge(&mut self, _other_location: &Path) -> anyhow::Result<()> {
        Err(EngineError::engine("an index segment cannot be merged into").into())
    }

    fn size(&self) -> usize {
        self.postings.iter().map(Vec::len).sum()
    }

    fn physical_size(&self) -> f64 {
        let bytes = fs::metadata(&self.handle.location)
            .map(|m| m.len())
            .unwrap_or_else(|_| {
                let dim = self.handle.dim;
                let centroid_bytes = self.centroids.len() * dim * 4;
                let row_bytes: usize = self.postings.iter().map(|p| p.len() * (8 + dim * 4)).sum();
                (4 + centroid_bytes + row_bytes) as u64
            });
        bytes as f64 / (1024.0 * 1024.0)
    }

    fn serialize(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.handle.location.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(format!("creating index directory: {e}")))?;
        }
        let mut file = fs::File::create(&self.handle.location)
            .map_err(|e| EngineError::io(format!("creating index {:?}: {e}", self.handle.location)))?;
        file.write_all(&(self.centroids.len() as u32).to_le_bytes())
            .map_err(|e| EngineError::io(format!("writing index header: {e}")))?;
        for (centroid, rows) in self.centroids.iter().zip(&self.postings) {
            write_vector(&mut file, centroid)?;
            file.write_all(&(rows.len() as u64).to_le_bytes())
                .map_err(|e| EngineError::io(format!("writing posting list length: {e}")))?;
            for (id, vector) in rows {
                file.write_all(&id.to_le_bytes())
                    .map_err(|e| EngineError::io(format!("writing posting row: {e}")))?;
                write_vector(&mut file, vector)?;
            }
        }
        Ok(())
    }

    fn build_index(
        &self,
        _target_location: &Path,
        _minimum_trainable: usize,
    ) -> anyhow::Result<Box<dyn SegmentEngine>> {
        Err(EngineError::engine("an index segment already has an index").into())
    }

    fn cache(&self) {
        log_engine_cached();
        tracing::debug!(location = ?self.handle.location, "cached index segment engine");
    }
}

fn read_vector(buf: &[u8]) -> Vec<f32> {
    buf.chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn write_vector(file: &mut fs::File, vector: &[f32]) -> anyhow::Result<()> {
    for component in vector {
        file.write_all(&component.to_le_bytes())
            .map_err(|e| EngineError::io(format!("writing vector component: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn sample_rows(n: usize, dim: usize) -> Vec<(i64, Vec<f32>)> {
        (0..n as i64)
            .map(|id| (id, (0..dim).map(|d| (id as f32) + d as f32).collect()))
            .collect()
    }

    #[test]
    fn build_then_search_finds_exact_match() {
        let dir = tempdir().unwrap();
        let handle = SegmentHandle::new(dir.path().join("idx.bin"), 4, Metric::L2);
        let rows = sample_rows(50, 4);
        let mut index = IndexEngine::build(handle, &rows).unwrap();
        index.serialize().unwrap();

        let query = rows[10].1.clone();
        let result = index.search(&query, 1, 1).unwrap();
        assert_eq!(result.ids[0], 10);
    }

    #[test]
    fn round_trips_through_serialize_and_load() {
        let dir = tempdir().unwrap();
        let handle = SegmentHandle::new(dir.path().join("idx.bin"), 4, Metric::L2);
        let rows = sample_rows(30, 4);
        let mut built = IndexEngine::build(handle.clone(), &rows).unwrap();
        built.serialize().unwrap();

        let mut reloaded = IndexEngine::new(handle);
        reloaded.load().unwrap();
        assert_eq!(reloaded.size(), 30);
    }

    #[test]
    fn merge_is_unsupported() {
        let dir = tempdir().unwrap();
        let handle = SegmentHandle::new(dir.path().join("idx.bin"), 4, Metric::L2);
        let rows = sample_rows(10, 4);
        let mut index = IndexEngine::build(handle, &rows).unwrap();
        assert!(index.merge(Path::new("anywhere")).is_err());
    }
}
