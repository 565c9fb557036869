use crate::models::{CompletionReport, Metric, MetricSet};

/// Ratio reported when a metric has no quota but something was achieved anyway.
///
/// Provisional product policy; the alternative would be to exclude such metrics
/// from the overall mean.
pub const UNDEFINED_QUOTA_REACHED: f64 = 100.0;

/// Per-metric completion percentage. Over-achievement is reported as-is.
pub fn metric_ratio(quota: f64, achieved: f64) -> f64 {
    if quota == 0.0 {
        if achieved == 0.0 {
            0.0
        } else {
            UNDEFINED_QUOTA_REACHED
        }
    } else {
        achieved / quota * 100.0
    }
}

pub fn completion(quota: &MetricSet, achieved: &MetricSet) -> CompletionReport {
    let per_metric = Metric::ALL.iter().fold(MetricSet::zero(), |ratios, metric| {
        ratios.with(*metric, metric_ratio(quota.get(*metric), achieved.get(*metric)))
    });
    let overall = Metric::ALL
        .iter()
        .map(|metric| per_metric.get(*metric))
        .sum::<f64>()
        / Metric::ALL.len() as f64;

    CompletionReport { per_metric, overall }
}
