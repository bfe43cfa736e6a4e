use metrics::{
    register_convex_counter,
    register_convex_histogram,
};

register_convex_counter!(
    pub SEGMENT_ENGINE_CACHED_TOTAL,
    "Count of segment engines hinted to be retained in the process-wide cache"
);

pub fn log_engine_cached() {
    metrics::log_counter(&SEGMENT_ENGINE_CACHED_TOTAL, 1);
}

register_convex_histogram!(
    pub SEGMENT_BUILD_INDEX_SECONDS,
    "Time to build an ANN index over one segment, labeled by status",
    &["status"]
);

pub fn log_build_index_timer() -> metrics::StatusTimer {
    metrics::StatusTimer::new(&SEGMENT_BUILD_INDEX_SECONDS)
}
