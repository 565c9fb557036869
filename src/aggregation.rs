use crate::errors::{AppError, AppResult};
use crate::models::{CallerContext, DistributorTarget, MetricSet, SubjectType, Target};
use crate::scope::{Mutation, SubjectRef};
use crate::service::TargetService;

/// Per-metric sum of achievement across distributor rows.
pub fn sum_achieved(rows: &[DistributorTarget]) -> MetricSet {
    rows.iter().fold(MetricSet::zero(), |mut total, row| {
        total.add_assign(&row.achieved);
        total
    })
}

impl TargetService {
    /// Recomputes a channel target's achieved set from its linked distributor rows.
    /// The stored set is replaced, so re-running converges after concurrent writes.
    pub fn aggregate(&self, caller: &CallerContext, channel_target_id: &str) -> AppResult<Target> {
        let channel = self.load_visible_target(caller, channel_target_id)?;
        if channel.subject_type != SubjectType::Channel {
            return Err(AppError::invalid("channelTargetId", "aggregation requires a channel target"));
        }
        self.resolver().require_write(
            caller,
            SubjectRef::of_target(&channel),
            Mutation::Achievement,
            &format!("Target {}", channel.id),
        )?;

        let rows = self.database().list_distributor_targets_for_channel(&channel.id)?;
        let achieved = sum_achieved(&rows);
        let updated = self
            .database()
            .set_target_achieved(&channel.id, &achieved, &caller.user_id)?
            .ok_or_else(|| AppError::NotFound(format!("Target {} not found", channel.id)))?;
        self.invalidate_statistics();

        tracing::info!(
            channel_target_id = %channel.id,
            distributor_rows = rows.len(),
            new_signing = achieved.new_signing,
            "channel achievement aggregated"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::sum_achieved;
    use crate::models::{DistributorTarget, Metric, MetricSet};
    use chrono::Utc;

    fn row(distributor_id: &str, achieved: MetricSet) -> DistributorTarget {
        let now = Utc::now();
        DistributorTarget {
            id: format!("dt-{}", distributor_id),
            channel_target_id: Some("ct-1".to_string()),
            distributor_id: distributor_id.to_string(),
            quota: MetricSet::zero(),
            achieved,
            created_by: "l1".to_string(),
            last_modified_by: "l1".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn sums_every_metric() {
        let rows = vec![
            row(
                "d-1",
                MetricSet::zero()
                    .with(Metric::NewSigning, 50.0)
                    .with(Metric::CoreOpportunity, 2.0),
            ),
            row(
                "d-2",
                MetricSet::zero()
                    .with(Metric::NewSigning, 20.0)
                    .with(Metric::HighValuePerformance, 3.5),
            ),
        ];
        let total = sum_achieved(&rows);
        assert_eq!(total.new_signing, 70.0);
        assert_eq!(total.core_opportunity, 2.0);
        assert_eq!(total.high_value_performance, 3.5);
        assert_eq!(total.core_performance, 0.0);
    }

    #[test]
    fn no_rows_sum_to_zero() {
        assert_eq!(sum_achieved(&[]), MetricSet::zero());
    }
}
