//! Top-down distribution of a channel target's quotas across distributors.

use crate::errors::{AppError, AppResult, FieldError};
use crate::models::{
    AllocatePayload, AllocationEntry, AllocationResult, AllocationWarning, CallerContext, DistributorTarget,
    Metric, MetricSet, OverAllocationPolicy, PartialMetricSet, Role, SubjectType,
};
use crate::scope::{Mutation, SubjectRef};
use crate::service::TargetService;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedChange {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedAllocation {
    pub quota: MetricSet,
    pub change: PlannedChange,
}

/// Resulting quota per distributor once a payload is applied over the rows
/// already linked to the channel target.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationPlan {
    pub entries: BTreeMap<String, PlannedAllocation>,
    pub totals: MetricSet,
}

impl AllocationPlan {
    /// Entries that need a write; unchanged rows are skipped.
    pub fn writes(&self) -> Vec<(String, MetricSet)> {
        self.entries
            .iter()
            .filter(|(_, planned)| planned.change != PlannedChange::Unchanged)
            .map(|(distributor_id, planned)| (distributor_id.clone(), planned.quota))
            .collect()
    }
}

/// Replace-by-key merge. Provided metrics overwrite, omitted ones keep the current
/// value (zero for a new row). Applying the same entries twice plans no writes the
/// second time.
pub fn plan_allocation(
    existing: &BTreeMap<String, MetricSet>,
    entries: &[AllocationEntry],
) -> AppResult<AllocationPlan> {
    let mut errors = Vec::new();
    let mut seen = BTreeMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let field = format!("allocations[{}]", index);
        if entry.distributor_id.trim().is_empty() {
            errors.push(FieldError::new(format!("{}.distributorId", field), "must not be empty"));
        } else if let Some(first) = seen.insert(entry.distributor_id.as_str(), index) {
            errors.push(FieldError::new(
                format!("{}.distributorId", field),
                format!("duplicates allocations[{}]", first),
            ));
        }
        errors.extend(entry.quota.validate(&format!("{}.quota", field)));
    }
    if !errors.is_empty() {
        return Err(AppError::Validation(errors));
    }

    let mut planned: BTreeMap<String, PlannedAllocation> = existing
        .iter()
        .map(|(distributor_id, quota)| {
            (
                distributor_id.clone(),
                PlannedAllocation {
                    quota: *quota,
                    change: PlannedChange::Unchanged,
                },
            )
        })
        .collect();

    for entry in entries {
        let current = existing.get(&entry.distributor_id);
        let mut quota = current.copied().unwrap_or_default();
        entry.quota.apply_to(&mut quota);
        let change = match current {
            None => PlannedChange::Created,
            Some(current) if *current != quota => PlannedChange::Updated,
            Some(_) => PlannedChange::Unchanged,
        };
        planned.insert(entry.distributor_id.clone(), PlannedAllocation { quota, change });
    }

    let mut totals = MetricSet::zero();
    for allocation in planned.values() {
        totals.add_assign(&allocation.quota);
    }

    Ok(AllocationPlan {
        entries: planned,
        totals,
    })
}

pub fn over_allocation_warnings(allocated: &MetricSet, channel_quota: &MetricSet) -> Vec<AllocationWarning> {
    Metric::ALL
        .iter()
        .filter(|metric| allocated.get(**metric) > channel_quota.get(**metric))
        .map(|metric| AllocationWarning {
            metric: *metric,
            allocated: allocated.get(*metric),
            quota: channel_quota.get(*metric),
            message: format!(
                "{} allocated across distributors ({}) exceeds the channel quota ({})",
                metric.as_str(),
                allocated.get(*metric),
                channel_quota.get(*metric)
            ),
        })
        .collect()
}

impl TargetService {
    pub fn allocate(&self, caller: &CallerContext, payload: &AllocatePayload) -> AppResult<AllocationResult> {
        if payload.allocations.is_empty() {
            return Err(AppError::invalid("allocations", "provide at least one allocation"));
        }

        let channel = self.load_visible_target(caller, &payload.channel_target_id)?;
        if channel.subject_type != SubjectType::Channel {
            return Err(AppError::invalid("channelTargetId", "allocation requires a channel target"));
        }
        self.resolver().require_write(
            caller,
            SubjectRef::of_target(&channel),
            Mutation::Allocate,
            &format!("Target {}", channel.id),
        )?;

        let existing: BTreeMap<String, MetricSet> = self
            .database()
            .list_distributor_targets_for_channel(&channel.id)?
            .into_iter()
            .map(|row| (row.distributor_id, row.quota))
            .collect();
        let plan = plan_allocation(&existing, &payload.allocations)?;

        self.require_allocatable_distributors(caller, &payload.allocations)?;

        let warnings = over_allocation_warnings(&plan.totals, &channel.quota);
        if !warnings.is_empty()
            && self.settings()?.over_allocation_policy == OverAllocationPolicy::Reject
        {
            return Err(AppError::Validation(
                warnings
                    .iter()
                    .map(|warning| FieldError::new(format!("allocations.{}", warning.metric.as_str()), &warning.message))
                    .collect(),
            ));
        }

        let writes = plan.writes();
        let distributor_targets = if writes.is_empty() {
            self.database().list_distributor_targets_for_channel(&channel.id)?
        } else {
            self.database()
                .upsert_allocations(&channel.id, &writes, &caller.user_id)?
        };

        for warning in &warnings {
            tracing::warn!(
                channel_target_id = %channel.id,
                metric = warning.metric.as_str(),
                allocated = warning.allocated,
                quota = warning.quota,
                "allocation exceeds channel quota"
            );
        }
        tracing::info!(
            channel_target_id = %channel.id,
            written = writes.len(),
            linked = distributor_targets.len(),
            allocated_by = %caller.user_id,
            "allocation applied"
        );

        Ok(AllocationResult {
            channel_target_id: channel.id,
            distributor_targets,
            warnings,
        })
    }

    fn require_allocatable_distributors(&self, caller: &CallerContext, entries: &[AllocationEntry]) -> AppResult<()> {
        let accessible = self.resolver().accessible_distributor_ids(caller)?;
        let mut errors = Vec::new();
        // A distributor outside the caller's scope reads exactly like a missing one.
        for (index, entry) in entries.iter().enumerate() {
            if !accessible.contains(&entry.distributor_id) {
                errors.push(FieldError::new(
                    format!("allocations[{}].distributorId", index),
                    format!("unknown distributor '{}'", entry.distributor_id),
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors))
        }
    }

    /// Bottom-up entry point: an unlinked distributor-level target.
    pub fn create_for_distributor(
        &self,
        caller: &CallerContext,
        distributor_id: &str,
        quota: MetricSet,
    ) -> AppResult<DistributorTarget> {
        let errors = quota.validate("quota");
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }
        let label = format!("Distributor {}", distributor_id);
        if self.database().get_distributor(distributor_id)?.is_none() {
            return Err(AppError::NotFound(format!("{} not found", label)));
        }
        self.resolver()
            .require_visible(caller, SubjectRef::Distributor(distributor_id), &label)?;

        let created = self
            .database()
            .insert_distributor_target(None, distributor_id, &quota, &caller.user_id)?;
        tracing::info!(
            distributor_target_id = %created.id,
            distributor_id = %distributor_id,
            created_by = %caller.user_id,
            "distributor target proposed"
        );
        Ok(created)
    }

    /// Links an unattached distributor target to a channel target.
    pub fn attach_to_channel(
        &self,
        caller: &CallerContext,
        id: &str,
        channel_target_id: &str,
    ) -> AppResult<DistributorTarget> {
        let row = self.load_visible_distributor_target(caller, id)?;
        let channel = self.load_visible_target(caller, channel_target_id)?;
        if channel.subject_type != SubjectType::Channel {
            return Err(AppError::invalid("channelTargetId", "allocation requires a channel target"));
        }
        self.resolver().require_write(
            caller,
            SubjectRef::of_target(&channel),
            Mutation::Allocate,
            &format!("Target {}", channel.id),
        )?;

        match row.channel_target_id.as_deref() {
            Some(current) if current == channel.id => return Ok(row),
            Some(_) => {
                return Err(AppError::invalid(
                    "channelTargetId",
                    "distributor target is already linked to another channel target",
                ))
            }
            None => {}
        }

        let attached = self
            .database()
            .attach_distributor_target(id, &channel.id, &caller.user_id)?
            .ok_or_else(|| AppError::Conflict(format!("Distributor target {} was linked concurrently", id)))?;
        tracing::info!(
            distributor_target_id = %id,
            channel_target_id = %channel.id,
            "distributor target attached"
        );
        Ok(attached)
    }

    pub(crate) fn load_visible_distributor_target(
        &self,
        caller: &CallerContext,
        id: &str,
    ) -> AppResult<DistributorTarget> {
        let label = format!("Distributor target {}", id);
        let row = self
            .database()
            .get_distributor_target(id)?
            .ok_or_else(|| AppError::NotFound(format!("{} not found", label)))?;
        self.resolver()
            .require_visible(caller, SubjectRef::of_distributor_target(&row), &label)?;
        Ok(row)
    }

    /// Rows under a visible channel target, narrowed to distributors in scope.
    pub fn list_by_channel(&self, caller: &CallerContext, channel_target_id: &str) -> AppResult<Vec<DistributorTarget>> {
        let channel = self.load_visible_target(caller, channel_target_id)?;
        let rows = self.database().list_distributor_targets_for_channel(&channel.id)?;
        if caller.role == Role::Admin {
            return Ok(rows);
        }
        let accessible = self.resolver().accessible_distributor_ids(caller)?;
        Ok(rows
            .into_iter()
            .filter(|row| accessible.contains(&row.distributor_id))
            .collect())
    }

    pub fn list_by_distributor(&self, caller: &CallerContext, distributor_id: &str) -> AppResult<Vec<DistributorTarget>> {
        let label = format!("Distributor {}", distributor_id);
        if self.database().get_distributor(distributor_id)?.is_none() {
            return Err(AppError::NotFound(format!("{} not found", label)));
        }
        self.resolver()
            .require_visible(caller, SubjectRef::Distributor(distributor_id), &label)?;
        self.database().list_distributor_targets_for_distributor(distributor_id)
    }

    pub fn get_distributor_target(&self, caller: &CallerContext, id: &str) -> AppResult<DistributorTarget> {
        self.load_visible_distributor_target(caller, id)
    }

    /// Records distributor achievement. The channel roll-up is left to `aggregate`.
    pub fn update_distributor_completion(
        &self,
        caller: &CallerContext,
        id: &str,
        achieved: PartialMetricSet,
    ) -> AppResult<DistributorTarget> {
        if achieved.is_empty() {
            return Err(AppError::invalid("achieved", "provide at least one metric"));
        }
        let errors = achieved.validate("achieved");
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let row = self.load_visible_distributor_target(caller, id)?;
        self.resolver().require_write(
            caller,
            SubjectRef::of_distributor_target(&row),
            Mutation::Achievement,
            &format!("Distributor target {}", id),
        )?;

        let updated = self
            .database()
            .set_distributor_target_achieved(id, &achieved, &caller.user_id)?
            .ok_or_else(|| AppError::NotFound(format!("Distributor target {} not found", id)))?;
        tracing::debug!(distributor_target_id = %id, modified_by = %caller.user_id, "distributor achievement recorded");
        Ok(updated)
    }

    pub fn delete_distributor_target(&self, caller: &CallerContext, id: &str) -> AppResult<()> {
        let row = self.load_visible_distributor_target(caller, id)?;
        self.resolver().require_write(
            caller,
            SubjectRef::of_distributor_target(&row),
            Mutation::Delete,
            &format!("Distributor target {}", id),
        )?;
        if !self.database().delete_distributor_target(id)? {
            return Err(AppError::NotFound(format!("Distributor target {} not found", id)));
        }
        tracing::info!(distributor_target_id = %id, deleted_by = %caller.user_id, "distributor target deleted");
        Ok(())
    }
}
