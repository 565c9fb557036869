use crate::completion::completion;
use crate::errors::AppResult;
use crate::models::{
    CallerContext, Metric, MetricSet, QuarterMonthCheck, QuarterMonthWarning, QuarterView, SubjectType, Target,
    TargetCompletion,
};
use crate::period::{validate, PeriodInput, Quarter};
use crate::scope::SubjectRef;
use crate::service::TargetService;

const QUOTA_TOLERANCE: f64 = 1e-9;

/// Month quotas are entered independently of the quarter; a mismatch is reported,
/// never corrected.
pub fn quarter_month_warnings(quarter_quota: &MetricSet, months: &[Target]) -> Vec<QuarterMonthWarning> {
    if months.is_empty() {
        return Vec::new();
    }
    let mut months_quota = MetricSet::zero();
    for month in months {
        months_quota.add_assign(&month.quota);
    }
    Metric::ALL
        .iter()
        .filter(|metric| (months_quota.get(**metric) - quarter_quota.get(**metric)).abs() > QUOTA_TOLERANCE)
        .map(|metric| QuarterMonthWarning {
            metric: *metric,
            quarter_quota: quarter_quota.get(*metric),
            months_quota: months_quota.get(*metric),
            message: format!(
                "{} month quotas sum to {} but the quarter quota is {}",
                metric.as_str(),
                months_quota.get(*metric),
                quarter_quota.get(*metric)
            ),
        })
        .collect()
}

fn completion_of(target: &Target) -> TargetCompletion {
    TargetCompletion {
        target_id: target.id.clone(),
        quota: target.quota,
        achieved: target.achieved,
        completion: completion(&target.quota, &target.achieved),
    }
}

impl TargetService {
    /// A quarter target with the month targets inside it. Missing months are not created.
    pub fn quarter_view(
        &self,
        caller: &CallerContext,
        subject_type: SubjectType,
        subject_id: &str,
        year: i32,
        quarter: Quarter,
    ) -> AppResult<QuarterView> {
        let period = validate(&PeriodInput::quarterly(year, quarter), self.year_bounds()?)?;
        self.resolver().require_visible(
            caller,
            SubjectRef::for_subject(subject_type, subject_id),
            &format!("{} {}", subject_type.as_str(), subject_id),
        )?;

        let quarter_target = self.database().find_target(subject_type, subject_id, &period)?;
        let months = self
            .database()
            .list_month_targets(subject_type, subject_id, year, quarter)?;

        let warnings = match (&quarter_target, self.settings()?.quarter_month_check) {
            (Some(target), QuarterMonthCheck::Advisory) => quarter_month_warnings(&target.quota, &months),
            _ => Vec::new(),
        };

        let completions = quarter_target
            .iter()
            .chain(months.iter())
            .map(completion_of)
            .collect();

        Ok(QuarterView {
            subject_type,
            subject_id: subject_id.to_string(),
            year,
            quarter_of_year: quarter,
            quarter: quarter_target,
            months,
            completions,
            warnings,
        })
    }
}
