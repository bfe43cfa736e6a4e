//! The segment engine: a polymorphic-over-metric capability interface for
//! loading, searching, merging, and indexing a single segment file, plus the
//! top-k reducer shared by per-segment search and cross-segment query
//! reduction.

mod engine;
mod index;
mod metric;
mod metrics;
mod raw;
mod reducer;

pub use crate::{
    engine::{
        SegmentEngine,
        SegmentHandle,
        SegmentSearchResult,
        SENTINEL_ID,
    },
    index::IndexEngine,
    metric::Metric,
    raw::RawEngine,
    reducer::select_top_k,
};
