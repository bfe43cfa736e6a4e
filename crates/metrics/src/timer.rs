use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::HistogramVec;

use crate::{
    get_desc,
    labels::StaticMetricLabel,
    log_distribution_with_labels,
};

/// A timer against a labeled histogram. Reports the elapsed wall time as a
/// distribution observation, tagged with whatever labels are attached at drop
/// time, when it goes out of scope.
struct LabeledTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: BTreeSet<StaticMetricLabel>,
}

impl LabeledTimer {
    fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: BTreeSet::new(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.insert(label);
    }

    fn replace_label(&mut self, old_label: StaticMetricLabel, new_label: StaticMetricLabel) {
        self.labels.remove(&old_label);
        self.labels.insert(new_label);
    }
}

impl Drop for LabeledTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let elapsed = elapsed_duration.as_secs_f64();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?} {:?}", self.labels);
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(self.histogram, elapsed, labels.into_iter().collect());
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct StatusTimer(LabeledTimer);

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = LabeledTimer::new(histogram);
        timer.add_label(StaticMetricLabel::STATUS_ERROR);
        Self(timer)
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.0.labels.insert(label);
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::STATUS_SUCCESS,
        );
        self.0.elapsed()
    }

    /// Finish the timer with developer error
    pub fn finish_developer_error(mut self) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::STATUS_DEVELOPER_ERROR,
        );
        self.0.elapsed()
    }

    /// Finish the timer with the given status
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_ERROR,
            StaticMetricLabel::new("status", status),
        );
        self.0.elapsed()
    }
}

/// Timer that defaults to CANCELED, but switches to ERROR/SUCCESS once you
/// call .finish().
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct CancelableTimer(LabeledTimer);

impl CancelableTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = LabeledTimer::new(histogram);
        timer.add_label(StaticMetricLabel::STATUS_CANCELED);
        Self(timer)
    }

    pub fn finish(mut self, is_ok: bool) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_CANCELED,
            StaticMetricLabel::status(is_ok),
        );
        self.0.elapsed()
    }

    /// Finish the timer with developer error
    pub fn finish_developer_error(mut self) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_CANCELED,
            StaticMetricLabel::STATUS_DEVELOPER_ERROR,
        );
        self.0.elapsed()
    }

    /// Finish the timer with the given status
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.0.replace_label(
            StaticMetricLabel::STATUS_CANCELED,
            StaticMetricLabel::new("status", status),
        );
        self.0.elapsed()
    }
}
