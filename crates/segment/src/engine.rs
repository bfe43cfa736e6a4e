use std::path::{
    Path,
    PathBuf,
};

use crate::Metric;

/// Sentinel id used to pad a segment's per-query result row when it has
/// fewer than `k` candidates. Dropped before top-k reduction.
pub const SENTINEL_ID: i64 = -1;

/// The row-major `nq * k` result of a per-segment search: row `i` holds the
/// top candidates for query `i`, padded with `SENTINEL_ID` / `f32::INFINITY`
/// (or `f32::NEG_INFINITY` for `Metric::Ip`) if the segment has fewer than
/// `k` vectors.
#[derive(Debug, Clone, Default)]
pub struct SegmentSearchResult {
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
}

/// The capability interface every segment variant implements, per the
/// engine's design: a segment handle is constructed on demand from a file
/// descriptor (location + dimension + metric) and is ephemeral — it owns no
/// durable state, only whatever it has loaded or built in memory.
pub trait SegmentEngine: Send {
    /// Bring the segment's vectors (and index, if any) into a searchable
    /// in-memory form. Idempotent: calling `load` twice is a no-op the
    /// second time.
    fn load(&mut self) -> anyhow::Result<()>;

    /// Per-segment top-k search for each of `nq` queries, `dim`-dimensional
    /// each, laid out row-major in `queries`. Fails if the segment has not
    /// been `load`ed.
    fn search(&self, queries: &[f32], nq: usize, k: usize) -> anyhow::Result<SegmentSearchResult>;

    /// Append the vectors of another RAW segment at `other_location` into
    /// this engine's working set. Only defined for RAW engines.
    fn merge(&mut self, other_location: &Path) -> anyhow::Result<()>;

    /// Current logical row count of the working set.
    fn size(&self) -> usize;

    /// On-disk footprint of the segment in MiB, once serialized.
    fn physical_size(&self) -> f64;

    /// Flush the working set to this engine's `location`.
    fn serialize(&mut self) -> anyhow::Result<()>;

    /// Build an ANN index over this segment's vectors and return a new
    /// engine handle over the indexed artifact at `target_location`. Fails
    /// if `size() < minimum_trainable`.
    fn build_index(
        &self,
        target_location: &Path,
        minimum_trainable: usize,
    ) -> anyhow::Result<Box<dyn SegmentEngine>>;

    /// Hint that this engine should be retained in the process-wide CPU
    /// cache. The engine never reads the cache's contents itself.
    fn cache(&self);
}

/// Common file-backed identity shared by every engine variant: where it
/// reads/writes from and what dimension/metric it was constructed with.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub location: PathBuf,
    pub dim: usize,
    pub metric: Metric,
}

impl SegmentHandle {
    pub fn new(location: impl Into<PathBuf>, dim: usize, metric: Metric) -> Self {
        Self {
            location: location.into(),
            dim,
            metric,
        }
    }
}
