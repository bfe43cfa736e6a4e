use metrics::{
    register_convex_counter,
    register_convex_gauge,
    register_convex_histogram,
};

register_convex_counter!(
    pub BUFFER_FLUSHES_TOTAL,
    "Count of memory buffers flushed to a new raw segment"
);
register_convex_counter!(
    pub BUFFER_FLUSHED_ROWS_TOTAL,
    "Count of rows written across all buffer flushes"
);

pub fn log_buffer_flushed(row_count: u64) {
    metrics::log_counter(&BUFFER_FLUSHES_TOTAL, 1);
    metrics::log_counter(&BUFFER_FLUSHED_ROWS_TOTAL, row_count);
}

register_convex_counter!(
    pub COMPACTION_TICKS_TOTAL,
    "Count of compaction timer ticks, labeled by outcome",
    &["status"]
);
register_convex_counter!(
    pub FILES_MERGED_TOTAL,
    "Count of raw segment files consumed by background_merge_files"
);

register_convex_histogram!(
    pub COMPACTION_TICK_SECONDS,
    "Wall-clock time of one compaction tick, labeled by outcome",
    &["status"]
);

pub fn log_compaction_tick_timer() -> metrics::StatusTimer {
    metrics::StatusTimer::new(&COMPACTION_TICK_SECONDS)
}

register_convex_counter!(
    pub INDEX_BUILDS_TOTAL,
    "Count of segments promoted from raw to indexed, labeled by outcome",
    &["status"]
);

register_convex_gauge!(
    pub BG_ERROR_ACTIVE,
    "1 if the background loops have hit a sticky-fatal error and stopped, else 0"
);

pub fn log_bg_error_active(active: bool) {
    metrics::log_gauge(&BG_ERROR_ACTIVE, if active { 1.0 } else { 0.0 });
}

register_convex_histogram!(
    pub QUERY_SECONDS,
    "Wall-clock time of one query, labeled by outcome",
    &["status"]
);

pub fn log_query_timer() -> metrics::StatusTimer {
    metrics::StatusTimer::new(&QUERY_SECONDS)
}

register_convex_counter!(
    pub FILES_RECLAIMED_TOTAL,
    "Count of to_delete files reclaimed by a compaction tick's ttl cleanup"
);
