use metrics::{
    log_counter_with_labels,
    register_convex_counter,
    MetricLabel,
};

register_convex_counter!(
    pub ENGINE_ERROR_TOTAL,
    "Count of errors surfaced from the segment engine, by kind",
    &["kind"]
);

pub fn log_error_kind(kind: &'static str) {
    log_counter_with_labels(
        &ENGINE_ERROR_TOTAL,
        1,
        vec![MetricLabel::new("kind", kind)],
    );
}
