use metrics::register_convex_counter;

register_convex_counter!(
    pub CATALOG_FILES_RECLAIMED_TOTAL,
    "Count of segment files physically deleted by cleanup_ttl"
);

pub fn log_files_reclaimed(count: usize) {
    metrics::log_counter(&CATALOG_FILES_RECLAIMED_TOTAL, count as u64);
}
