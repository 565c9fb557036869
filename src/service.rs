use crate::cache::{BestEffortCache, CacheBackend, STATISTICS_PREFIX};
use crate::completion::completion;
use crate::db::{Database, SubjectScope};
use crate::errors::{AppError, AppResult, FieldError};
use crate::models::{
    CallerContext, ChannelRecord, CreateTargetPayload, DistributorRecord, LeaderScope, ListTargetsFilters,
    MetricSet, PartialMetricSet, Role, SubjectType, Target, TargetCompletion, TargetSettings, TargetStatistics,
    UpdateTargetPayload, UserRecord,
};
use crate::period::{validate, Quarter, TargetKind, YearBounds};
use crate::scope::{Mutation, ScopeResolver, SubjectRef};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DATABASE_FILE: &str = "targets.db";

/// Subject ids a caller may see, `None` meaning unrestricted.
pub(crate) type VisibleSubjects = Option<BTreeSet<String>>;

pub struct TargetService {
    db: Arc<Database>,
    cache: BestEffortCache,
}

impl TargetService {
    pub fn new(data_dir: &Path) -> AppResult<Self> {
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);
        Self::from_database(db)
    }

    pub fn from_database(db: Arc<Database>) -> AppResult<Self> {
        let ttl = Duration::from_secs(db.get_settings()?.statistics_cache_ttl_seconds);
        Ok(Self {
            db,
            cache: BestEffortCache::in_memory(ttl),
        })
    }

    pub fn with_cache_backend(db: Arc<Database>, backend: Box<dyn CacheBackend>) -> AppResult<Self> {
        let ttl = Duration::from_secs(db.get_settings()?.statistics_cache_ttl_seconds);
        Ok(Self {
            db,
            cache: BestEffortCache::new(backend, ttl),
        })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn resolver(&self) -> ScopeResolver<'_, Database> {
        ScopeResolver::new(self.db.as_ref())
    }

    pub(crate) fn visible_subjects(&self, caller: &CallerContext) -> AppResult<VisibleSubjects> {
        if caller.role == Role::Admin {
            return Ok(None);
        }
        Ok(Some(self.resolver().accessible_subject_ids(caller)?))
    }

    pub(crate) fn invalidate_statistics(&self) {
        self.cache.invalidate(STATISTICS_PREFIX);
    }

    pub(crate) fn year_bounds(&self) -> AppResult<YearBounds> {
        let settings = self.db.get_settings()?;
        Ok(YearBounds::new(settings.min_year, settings.max_year))
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn settings(&self) -> AppResult<TargetSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, caller: &CallerContext, update: serde_json::Value) -> AppResult<TargetSettings> {
        if caller.role != Role::Admin {
            return Err(AppError::Forbidden("only admins may change target settings".to_string()));
        }
        let settings = self.db.update_settings(update)?;
        tracing::info!(user_id = %caller.user_id, "target settings updated");
        Ok(settings)
    }

    // ─── Subject directory (account sync) ───────────────────────────────────

    pub fn sync_user(&self, id: &str, name: &str, role: Role) -> AppResult<UserRecord> {
        let user = self.db.upsert_user(id, name, role)?;
        self.invalidate_statistics();
        Ok(user)
    }

    pub fn sync_channel(&self, id: &str, name: &str, owner_id: &str) -> AppResult<ChannelRecord> {
        let channel = self.db.upsert_channel(id, name, owner_id)?;
        self.invalidate_statistics();
        Ok(channel)
    }

    pub fn sync_distributor(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
        channel_id: Option<&str>,
    ) -> AppResult<DistributorRecord> {
        self.db.upsert_distributor(id, name, owner_id, channel_id)
    }

    // ─── Targets ────────────────────────────────────────────────────────────

    pub fn create_target(&self, caller: &CallerContext, payload: CreateTargetPayload) -> AppResult<Target> {
        let period = validate(&payload.period, self.year_bounds()?)?;

        let mut errors = payload.quota.validate("quota");
        let subject_id = payload.subject_id.trim();
        if subject_id.is_empty() {
            errors.push(FieldError::new("subjectId", "must not be empty"));
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let known = match payload.subject_type {
            SubjectType::Person => self.db.get_user(subject_id)?.is_some(),
            SubjectType::Channel => self.db.get_channel(subject_id)?.is_some(),
        };
        if !known {
            return Err(AppError::invalid(
                "subjectId",
                format!("unknown {} '{}'", payload.subject_type.as_str(), subject_id),
            ));
        }

        let subject = SubjectRef::for_subject(payload.subject_type, subject_id);
        let allowed = if caller.role.manages_quotas() {
            self.resolver().can_access(caller, subject)?
        } else {
            payload.subject_type == SubjectType::Person
                && subject_id == caller.user_id
                && period.kind() != TargetKind::Yearly
        };
        if !allowed {
            return Err(AppError::Forbidden(format!(
                "{} may not create a {} target for {}",
                caller.role.as_str(),
                payload.subject_type.as_str(),
                subject_id
            )));
        }

        let notes = payload.notes.as_deref().map(str::trim).filter(|notes| !notes.is_empty());
        let target = self.db.insert_target(
            payload.subject_type,
            subject_id,
            &period,
            &payload.quota,
            notes,
            &caller.user_id,
        )?;
        self.invalidate_statistics();
        tracing::info!(
            target_id = %target.id,
            subject_type = target.subject_type.as_str(),
            subject_id = %target.subject_id,
            period = %target.period.key(),
            created_by = %caller.user_id,
            "target created"
        );
        Ok(target)
    }

    /// Loads a target the caller can see; anything else reads as missing.
    pub(crate) fn load_visible_target(&self, caller: &CallerContext, id: &str) -> AppResult<Target> {
        let label = format!("Target {}", id);
        let target = self
            .db
            .get_target(id)?
            .ok_or_else(|| AppError::NotFound(format!("{} not found", label)))?;
        self.resolver()
            .require_visible(caller, SubjectRef::of_target(&target), &label)?;
        Ok(target)
    }

    pub fn get_target(&self, caller: &CallerContext, id: &str) -> AppResult<Target> {
        self.load_visible_target(caller, id)
    }

    pub fn update_target(&self, caller: &CallerContext, id: &str, patch: UpdateTargetPayload) -> AppResult<Target> {
        if patch.quota.is_none() && patch.achieved.is_none() && patch.notes.is_none() {
            return Err(AppError::invalid("patch", "provide at least one of quota, achieved or notes"));
        }
        let mut errors = Vec::new();
        if let Some(quota) = &patch.quota {
            errors.extend(quota.validate("quota"));
        }
        if let Some(achieved) = &patch.achieved {
            errors.extend(achieved.validate("achieved"));
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let target = self.load_visible_target(caller, id)?;
        let mutation = if patch.quota.is_some() || patch.notes.is_some() {
            Mutation::Quota
        } else {
            Mutation::Achievement
        };
        self.resolver().require_write(
            caller,
            SubjectRef::of_target(&target),
            mutation,
            &format!("Target {}", id),
        )?;

        // Columns absent from the patch are left to the store.
        let notes = patch.notes.as_deref().map(|notes| Some(notes.trim()).filter(|notes| !notes.is_empty()));
        let updated = self
            .db
            .update_target(
                id,
                &patch.quota.unwrap_or_default(),
                &patch.achieved.unwrap_or_default(),
                notes,
                &caller.user_id,
            )?
            .ok_or_else(|| AppError::NotFound(format!("Target {} not found", id)))?;
        self.invalidate_statistics();
        tracing::debug!(target_id = %id, modified_by = %caller.user_id, "target updated");
        Ok(updated)
    }

    pub fn update_achievement(
        &self,
        caller: &CallerContext,
        id: &str,
        achieved: PartialMetricSet,
    ) -> AppResult<Target> {
        if achieved.is_empty() {
            return Err(AppError::invalid("achieved", "provide at least one metric"));
        }
        self.update_target(
            caller,
            id,
            UpdateTargetPayload {
                achieved: Some(achieved),
                ..UpdateTargetPayload::default()
            },
        )
    }

    pub fn delete_target(&self, caller: &CallerContext, id: &str) -> AppResult<()> {
        let target = self.load_visible_target(caller, id)?;
        self.resolver().require_write(
            caller,
            SubjectRef::of_target(&target),
            Mutation::Delete,
            &format!("Target {}", id),
        )?;
        if !self.db.delete_target(id)? {
            return Err(AppError::NotFound(format!("Target {} not found", id)));
        }
        self.invalidate_statistics();
        tracing::info!(target_id = %id, deleted_by = %caller.user_id, "target deleted");
        Ok(())
    }

    pub fn list_targets(&self, caller: &CallerContext, filters: &ListTargetsFilters) -> AppResult<Vec<Target>> {
        if let Some(month) = filters.month {
            if Quarter::of_month(month).is_none() {
                return Err(AppError::invalid("month", format!("month {} is outside 1..=12", month)));
            }
        }
        let settings = self.db.get_settings()?;
        let limit = filters
            .limit
            .unwrap_or(settings.default_list_limit)
            .clamp(1, settings.max_list_limit.max(1));
        let offset = filters.offset.unwrap_or(0);

        let visible = self.visible_subjects(caller)?;
        self.db
            .list_targets(filters, subject_scope(&visible), limit, offset)
    }

    pub fn target_completion(&self, caller: &CallerContext, id: &str) -> AppResult<TargetCompletion> {
        let target = self.load_visible_target(caller, id)?;
        Ok(TargetCompletion {
            target_id: target.id,
            quota: target.quota,
            achieved: target.achieved,
            completion: completion(&target.quota, &target.achieved),
        })
    }

    /// Organization-wide roll-up over the caller's visible targets. See
    /// [`Database::list_rollup_targets`] for which targets take part.
    pub fn statistics(
        &self,
        caller: &CallerContext,
        year: i32,
        quarter: Option<Quarter>,
    ) -> AppResult<TargetStatistics> {
        let bounds = self.year_bounds()?;
        if year < bounds.min || year > bounds.max {
            return Err(AppError::invalid(
                "year",
                format!("year {} is outside {}..={}", year, bounds.min, bounds.max),
            ));
        }

        let cache_key = format!(
            "{}{}:{}:{}:{}",
            STATISTICS_PREFIX,
            caller.role.as_str(),
            caller.user_id,
            year,
            quarter.map(|quarter| quarter.to_string()).unwrap_or_default()
        );
        if let Some(cached) = self.cache.get_json::<TargetStatistics>(&cache_key) {
            return Ok(cached);
        }
        let generation = self.cache.generation();

        let visible = self.visible_subjects(caller)?;
        let targets = self
            .db
            .list_rollup_targets(year, quarter, subject_scope(&visible))?;

        let mut quota = MetricSet::zero();
        let mut achieved = MetricSet::zero();
        let mut person_target_count = 0_u32;
        let mut channel_target_count = 0_u32;
        for target in &targets {
            quota.add_assign(&target.quota);
            achieved.add_assign(&target.achieved);
            match target.subject_type {
                SubjectType::Person => person_target_count += 1,
                SubjectType::Channel => channel_target_count += 1,
            }
        }

        let statistics = TargetStatistics {
            year,
            quarter,
            target_count: person_target_count + channel_target_count,
            person_target_count,
            channel_target_count,
            quota,
            achieved,
            completion: completion(&quota, &achieved),
        };
        self.cache.put_json(&cache_key, &statistics, generation);
        Ok(statistics)
    }

    // ─── Leader scope ───────────────────────────────────────────────────────

    pub fn get_leader_scope(&self, caller: &CallerContext, leader_id: &str) -> AppResult<LeaderScope> {
        if caller.role != Role::Admin && !(caller.role == Role::Leader && caller.user_id == leader_id) {
            return Err(AppError::Forbidden(format!(
                "{} may not read the scope of {}",
                caller.role.as_str(),
                leader_id
            )));
        }
        self.require_leader(leader_id)?;
        let salesperson_ids = self
            .db
            .list_scope_grants(leader_id)?
            .into_iter()
            .map(|grant| grant.salesperson_id)
            .collect();
        Ok(LeaderScope {
            leader_id: leader_id.to_string(),
            salesperson_ids,
        })
    }

    /// Replaces the leader's grant set wholesale. Duplicate ids collapse.
    pub fn set_leader_scope(
        &self,
        caller: &CallerContext,
        leader_id: &str,
        salesperson_ids: &[String],
    ) -> AppResult<LeaderScope> {
        if caller.role != Role::Admin {
            return Err(AppError::Forbidden("only admins may change leader scope".to_string()));
        }
        self.require_leader(leader_id)?;

        let mut errors = Vec::new();
        let mut unique = BTreeSet::new();
        for (index, salesperson_id) in salesperson_ids.iter().enumerate() {
            let field = format!("salespersonIds[{}]", index);
            match self.db.get_user(salesperson_id)? {
                Some(user) if user.role == Role::Salesperson => {
                    unique.insert(salesperson_id.clone());
                }
                Some(_) => errors.push(FieldError::new(field, format!("{} is not a salesperson", salesperson_id))),
                None => errors.push(FieldError::new(field, format!("unknown user '{}'", salesperson_id))),
            }
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let grants = self.db.replace_scope_grants(leader_id, &unique)?;
        self.invalidate_statistics();
        tracing::info!(
            leader_id = %leader_id,
            granted = grants.len(),
            changed_by = %caller.user_id,
            "leader scope replaced"
        );
        Ok(LeaderScope {
            leader_id: leader_id.to_string(),
            salesperson_ids: grants.into_iter().map(|grant| grant.salesperson_id).collect(),
        })
    }

    fn require_leader(&self, leader_id: &str) -> AppResult<()> {
        match self.db.get_user(leader_id)? {
            Some(user) if user.role == Role::Leader => Ok(()),
            Some(_) => Err(AppError::invalid("leaderId", format!("{} is not a leader", leader_id))),
            None => Err(AppError::NotFound(format!("User {} not found", leader_id))),
        }
    }
}

pub(crate) fn subject_scope(visible: &VisibleSubjects) -> SubjectScope<'_> {
    match visible {
        Some(ids) => SubjectScope::Users(ids),
        None => SubjectScope::Everything,
    }
}

#[cfg(test)]
mod tests {
    use super::TargetService;
    use crate::errors::AppError;
    use crate::models::{
        CallerContext, CreateTargetPayload, ListTargetsFilters, Metric, MetricSet, PartialMetricSet, Role,
        SubjectType, UpdateTargetPayload,
    };
    use crate::period::{PeriodInput, Quarter};
    use std::sync::Arc;

    fn service(dir: &tempfile::TempDir) -> TargetService {
        let service = TargetService::new(dir.path()).expect("service");
        service.sync_user("admin", "Ada", Role::Admin).expect("user");
        service.sync_user("l1", "Lee", Role::Leader).expect("user");
        service.sync_user("l2", "Liu", Role::Leader).expect("user");
        service.sync_user("s1", "Sam", Role::Salesperson).expect("user");
        service.sync_user("s2", "Sia", Role::Salesperson).expect("user");
        service
            .set_leader_scope(&CallerContext::admin("admin"), "l1", &["s1".to_string()])
            .expect("grant");
        service
    }

    fn person_quarter(subject_id: &str, quarter: Quarter, new_signing: f64) -> CreateTargetPayload {
        CreateTargetPayload {
            subject_type: SubjectType::Person,
            subject_id: subject_id.to_string(),
            period: PeriodInput::quarterly(2025, quarter),
            quota: MetricSet::zero().with(Metric::NewSigning, new_signing),
            notes: None,
        }
    }

    #[test]
    fn leader_creates_and_salesperson_records_achievement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let l1 = CallerContext::leader("l1");
        let s1 = CallerContext::salesperson("s1");

        let target = service
            .create_target(&l1, person_quarter("s1", Quarter::Q2, 100.0))
            .expect("create");
        assert_eq!(target.created_by, "l1");

        let updated = service
            .update_achievement(&s1, &target.id, PartialMetricSet::default().with(Metric::NewSigning, 40.0))
            .expect("record achievement");
        assert_eq!(updated.achieved.new_signing, 40.0);
        assert_eq!(updated.quota.new_signing, 100.0);
        assert_eq!(updated.last_modified_by, "s1");

        let error = service
            .update_target(
                &s1,
                &target.id,
                UpdateTargetPayload {
                    quota: Some(PartialMetricSet::default().with(Metric::NewSigning, 1.0)),
                    ..UpdateTargetPayload::default()
                },
            )
            .expect_err("salesperson cannot change quota");
        assert!(matches!(error, AppError::Forbidden(_)));
    }

    #[test]
    fn salesperson_may_only_create_own_sub_year_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let s1 = CallerContext::salesperson("s1");

        service
            .create_target(&s1, person_quarter("s1", Quarter::Q1, 10.0))
            .expect("own quarterly target");

        let mut yearly = person_quarter("s1", Quarter::Q1, 10.0);
        yearly.period = PeriodInput::yearly(2025);
        assert!(matches!(service.create_target(&s1, yearly), Err(AppError::Forbidden(_))));
        assert!(matches!(
            service.create_target(&s1, person_quarter("s2", Quarter::Q1, 10.0)),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn create_rejects_bad_input_and_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let admin = CallerContext::admin("admin");

        let mut negative = person_quarter("s1", Quarter::Q2, -5.0);
        negative.notes = Some("bad".to_string());
        assert!(matches!(service.create_target(&admin, negative), Err(AppError::Validation(_))));

        let mut out_of_range = person_quarter("s1", Quarter::Q2, 5.0);
        out_of_range.period = PeriodInput::quarterly(1999, Quarter::Q2);
        assert!(matches!(service.create_target(&admin, out_of_range), Err(AppError::Validation(_))));

        assert!(matches!(
            service.create_target(&admin, person_quarter("ghost", Quarter::Q2, 5.0)),
            Err(AppError::Validation(_))
        ));

        service
            .create_target(&admin, person_quarter("s1", Quarter::Q2, 5.0))
            .expect("first");
        assert!(matches!(
            service.create_target(&admin, person_quarter("s1", Quarter::Q2, 6.0)),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn out_of_scope_reads_are_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let target = service
            .create_target(&CallerContext::admin("admin"), person_quarter("s1", Quarter::Q2, 10.0))
            .expect("create");

        for caller in [CallerContext::leader("l2"), CallerContext::salesperson("s2")] {
            assert!(matches!(service.get_target(&caller, &target.id), Err(AppError::NotFound(_))));
            assert!(matches!(service.delete_target(&caller, &target.id), Err(AppError::NotFound(_))));
        }
        assert!(matches!(
            service.delete_target(&CallerContext::salesperson("s1"), &target.id),
            Err(AppError::Forbidden(_))
        ));
        service
            .delete_target(&CallerContext::leader("l1"), &target.id)
            .expect("granted leader deletes");
    }

    #[test]
    fn listing_is_intersected_with_scope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let admin = CallerContext::admin("admin");
        for subject in ["s1", "s2", "l2"] {
            service
                .create_target(&admin, person_quarter(subject, Quarter::Q3, 10.0))
                .expect("create");
        }

        let listed = service
            .list_targets(&CallerContext::leader("l1"), &ListTargetsFilters::default())
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject_id, "s1");

        let everything = service.list_targets(&admin, &ListTargetsFilters::default()).expect("list");
        assert_eq!(everything.len(), 3);

        let paged = service
            .list_targets(
                &admin,
                &ListTargetsFilters {
                    limit: Some(2),
                    ..ListTargetsFilters::default()
                },
            )
            .expect("list");
        assert_eq!(paged.len(), 2);
    }

    #[test]
    fn statistics_reflect_writes_after_caching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let admin = CallerContext::admin("admin");
        let target = service
            .create_target(&admin, person_quarter("s1", Quarter::Q2, 100.0))
            .expect("create");

        let before = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
        assert_eq!(before.target_count, 1);
        assert_eq!(before.completion.per_metric.new_signing, 0.0);

        service
            .update_achievement(&admin, &target.id, PartialMetricSet::default().with(Metric::NewSigning, 50.0))
            .expect("achievement");
        let after = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
        assert_eq!(after.achieved.new_signing, 50.0);
        assert_eq!(after.completion.per_metric.new_signing, 50.0);

        let other_quarter = service.statistics(&admin, 2025, Some(Quarter::Q3)).expect("stats");
        assert_eq!(other_quarter.target_count, 0);
    }

    #[test]
    fn quota_edit_keeps_achievement_recorded_in_between() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let l1 = CallerContext::leader("l1");
        let target = service
            .create_target(&l1, person_quarter("s1", Quarter::Q2, 100.0))
            .expect("create");
        let snapshot = service.get_target(&l1, &target.id).expect("snapshot");
        assert_eq!(snapshot.achieved.new_signing, 0.0);

        service
            .update_achievement(
                &CallerContext::salesperson("s1"),
                &target.id,
                PartialMetricSet::default().with(Metric::NewSigning, 40.0),
            )
            .expect("achievement");
        let edited = service
            .update_target(
                &l1,
                &target.id,
                UpdateTargetPayload {
                    quota: Some(PartialMetricSet::default().with(Metric::NewSigning, 120.0)),
                    notes: Some("  raised  ".to_string()),
                    ..UpdateTargetPayload::default()
                },
            )
            .expect("quota edit");

        assert_eq!(edited.quota.new_signing, 120.0);
        assert_eq!(edited.achieved.new_signing, 40.0);
        assert_eq!(edited.notes.as_deref(), Some("raised"));

        let cleared = service
            .update_target(
                &l1,
                &target.id,
                UpdateTargetPayload {
                    notes: Some(" ".to_string()),
                    ..UpdateTargetPayload::default()
                },
            )
            .expect("clear notes");
        assert_eq!(cleared.notes, None);
        assert_eq!(cleared.quota.new_signing, 120.0);
    }

    #[test]
    fn huge_cache_ttl_does_not_break_statistics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let admin = CallerContext::admin("admin");
        let target_id = {
            let service = service(&dir);
            service
                .update_settings(&admin, serde_json::json!({ "statisticsCacheTtlSeconds": u64::MAX }))
                .expect("settings");
            service
                .create_target(&admin, person_quarter("s1", Quarter::Q2, 100.0))
                .expect("create")
                .id
        };

        let db = Arc::new(crate::db::Database::new(&dir.path().join("targets.db")).expect("db"));
        let service = TargetService::from_database(db).expect("service");
        let first = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
        assert_eq!(first.target_count, 1);

        service
            .update_achievement(&admin, &target_id, PartialMetricSet::default().with(Metric::NewSigning, 25.0))
            .expect("achievement");
        let second = service.statistics(&admin, 2025, Some(Quarter::Q2)).expect("stats");
        assert_eq!(second.achieved.new_signing, 25.0);
    }

    #[test]
    fn leader_scope_administration() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(&dir);
        let admin = CallerContext::admin("admin");

        let scope = service
            .set_leader_scope(&admin, "l2", &["s2".to_string(), "s2".to_string(), "s1".to_string()])
            .expect("replace");
        assert_eq!(scope.salesperson_ids, vec!["s1".to_string(), "s2".to_string()]);

        let own = service
            .get_leader_scope(&CallerContext::leader("l2"), "l2")
            .expect("leader reads own scope");
        assert_eq!(own.salesperson_ids.len(), 2);

        assert!(matches!(
            service.get_leader_scope(&CallerContext::leader("l1"), "l2"),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            service.set_leader_scope(&CallerContext::leader("l2"), "l2", &[]),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            service.set_leader_scope(&admin, "l2", &["l1".to_string()]),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            service.set_leader_scope(&admin, "s1", &[]),
            Err(AppError::Validation(_))
        ));
    }
}
