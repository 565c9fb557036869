use crate::errors::{AppError, AppResult};
use crate::models::{
    ChannelRecord, DistributorRecord, DistributorTarget, ListTargetsFilters, MetricSet, PartialMetricSet, Role,
    ScopeGrant, SubjectType, Target, TargetSettings, UserRecord,
};
use crate::period::{Period, PeriodSlot, Quarter};
use crate::scope::ScopeSource;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SETTINGS_KEY: &str = "targets";

const TARGET_COLUMNS: &str = "id, subject_type, subject_id, year, kind, quarter, month,
     quota_new_signing, quota_core_opportunity, quota_core_performance,
     quota_high_value_opportunity, quota_high_value_performance,
     achieved_new_signing, achieved_core_opportunity, achieved_core_performance,
     achieved_high_value_opportunity, achieved_high_value_performance,
     notes, created_by, last_modified_by, created_at, updated_at";

const DISTRIBUTOR_TARGET_COLUMNS: &str = "id, channel_target_id, distributor_id,
     quota_new_signing, quota_core_opportunity, quota_core_performance,
     quota_high_value_opportunity, quota_high_value_performance,
     achieved_new_signing, achieved_core_opportunity, achieved_core_performance,
     achieved_high_value_opportunity, achieved_high_value_performance,
     created_by, last_modified_by, created_at, updated_at";

/// Which subjects a query may return. `Users` restricts person targets to the
/// listed ids and channel targets to channels owned by them.
#[derive(Debug, Clone, Copy)]
pub enum SubjectScope<'a> {
    Everything,
    Users(&'a BTreeSet<String>),
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<TargetSettings> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<TargetSettings>(&raw).unwrap_or_else(|error| {
                tracing::warn!(error = %error, "stored target settings are unreadable; using defaults");
                TargetSettings::default()
            })),
            None => Ok(TargetSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<TargetSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: TargetSettings =
            serde_json::from_value(merged).map_err(|error| AppError::invalid("settings", error.to_string()))?;
        if settings.min_year > settings.max_year {
            return Err(AppError::invalid("settings.minYear", "must not exceed maxYear"));
        }

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    /// Merges a YAML override file (camelCase keys, same shape as the JSON settings).
    pub fn apply_settings_file(&self, path: &Path) -> AppResult<TargetSettings> {
        let raw = fs::read_to_string(path)?;
        let overrides: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let overrides = serde_json::to_value(overrides)?;
        if overrides.is_null() {
            return self.get_settings();
        }
        self.update_settings(overrides)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SETTINGS_KEY,
                    serde_json::to_string(&TargetSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    // ─── Subject directory ──────────────────────────────────────────────────

    pub fn upsert_user(&self, id: &str, name: &str, role: Role) -> AppResult<UserRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (id, name, role, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, role = excluded.role, updated_at = excluded.updated_at",
            params![id, name, role.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(UserRecord {
            id: id.to_string(),
            name: name.to_string(),
            role,
        })
    }

    pub fn get_user(&self, id: &str) -> AppResult<Option<UserRecord>> {
        let conn = self.conn()?;
        conn.query_row("SELECT id, name, role FROM users WHERE id = ?1", [id], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                role: parse_role(&row.get::<_, String>(2)?)?,
            })
        })
        .optional()
        .map_err(AppError::from)
    }

    pub fn upsert_channel(&self, id: &str, name: &str, owner_id: &str) -> AppResult<ChannelRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO channels (id, name, owner_id, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, owner_id = excluded.owner_id, updated_at = excluded.updated_at",
            params![id, name, owner_id, Utc::now().to_rfc3339()],
        )?;
        Ok(ChannelRecord {
            id: id.to_string(),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
        })
    }

    pub fn get_channel(&self, id: &str) -> AppResult<Option<ChannelRecord>> {
        let conn = self.conn()?;
        conn.query_row("SELECT id, name, owner_id FROM channels WHERE id = ?1", [id], |row| {
            Ok(ChannelRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                owner_id: row.get(2)?,
            })
        })
        .optional()
        .map_err(AppError::from)
    }

    pub fn upsert_distributor(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
        channel_id: Option<&str>,
    ) -> AppResult<DistributorRecord> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO distributors (id, name, owner_id, channel_id, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, owner_id = excluded.owner_id,
               channel_id = excluded.channel_id, updated_at = excluded.updated_at",
            params![id, name, owner_id, channel_id, Utc::now().to_rfc3339()],
        )?;
        Ok(DistributorRecord {
            id: id.to_string(),
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            channel_id: channel_id.map(ToString::to_string),
        })
    }

    pub fn get_distributor(&self, id: &str) -> AppResult<Option<DistributorRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, owner_id, channel_id FROM distributors WHERE id = ?1",
            [id],
            |row| {
                Ok(DistributorRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    owner_id: row.get(2)?,
                    channel_id: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(AppError::from)
    }

    // ─── Scope grants ───────────────────────────────────────────────────────

    pub fn list_scope_grants(&self, leader_id: &str) -> AppResult<Vec<ScopeGrant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT leader_id, salesperson_id FROM scope_grants WHERE leader_id = ?1 ORDER BY salesperson_id ASC",
        )?;
        let rows = stmt
            .query_map([leader_id], |row| {
                Ok(ScopeGrant {
                    leader_id: row.get(0)?,
                    salesperson_id: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replaces the leader's whole grant set in one transaction.
    pub fn replace_scope_grants(
        &self,
        leader_id: &str,
        salesperson_ids: &BTreeSet<String>,
    ) -> AppResult<Vec<ScopeGrant>> {
        let now = Utc::now().to_rfc3339();
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM scope_grants WHERE leader_id = ?1", [leader_id])?;
            for salesperson_id in salesperson_ids {
                tx.execute(
                    "INSERT INTO scope_grants (leader_id, salesperson_id, granted_at) VALUES (?1, ?2, ?3)",
                    params![leader_id, salesperson_id, now],
                )?;
            }
            tx.commit()?;
        }
        self.list_scope_grants(leader_id)
    }

    // ─── Targets ────────────────────────────────────────────────────────────

    pub fn insert_target(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        period: &Period,
        quota: &MetricSet,
        notes: Option<&str>,
        created_by: &str,
    ) -> AppResult<Target> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO targets (
               id, subject_type, subject_id, year, kind, quarter, month, period_key,
               quota_new_signing, quota_core_opportunity, quota_core_performance,
               quota_high_value_opportunity, quota_high_value_performance,
               notes, created_by, last_modified_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, ?16, ?16)",
            params![
                id,
                subject_type.as_str(),
                subject_id,
                period.year,
                period.kind().as_str(),
                period.quarter().map(Quarter::number),
                period.month(),
                period.key(),
                quota.new_signing,
                quota.core_opportunity,
                quota.core_performance,
                quota.high_value_opportunity,
                quota.high_value_performance,
                notes,
                created_by,
                now.to_rfc3339(),
            ],
        );
        match inserted {
            Err(error) if is_unique_violation(&error) => {
                return Err(AppError::Conflict(format!(
                    "A {} target for {} already exists for period {}",
                    subject_type.as_str(),
                    subject_id,
                    period.key()
                )));
            }
            other => {
                other?;
            }
        }

        Ok(Target {
            id,
            subject_type,
            subject_id: subject_id.to_string(),
            period: *period,
            quota: *quota,
            achieved: MetricSet::zero(),
            notes: notes.map(ToString::to_string),
            created_by: created_by.to_string(),
            last_modified_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_target(&self, id: &str) -> AppResult<Option<Target>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            [id],
            parse_target_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn find_target(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        period: &Period,
    ) -> AppResult<Option<Target>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM targets WHERE subject_type = ?1 AND subject_id = ?2 AND period_key = ?3",
                TARGET_COLUMNS
            ),
            params![subject_type.as_str(), subject_id, period.key()],
            parse_target_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Applies a patch in one statement. Metrics left out of `quota` or `achieved`
    /// keep their stored value; `notes: None` leaves notes alone and `Some(None)` clears them.
    pub fn update_target(
        &self,
        id: &str,
        quota: &PartialMetricSet,
        achieved: &PartialMetricSet,
        notes: Option<Option<&str>>,
        modified_by: &str,
    ) -> AppResult<Option<Target>> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE targets SET
                   quota_new_signing = COALESCE(?1, quota_new_signing),
                   quota_core_opportunity = COALESCE(?2, quota_core_opportunity),
                   quota_core_performance = COALESCE(?3, quota_core_performance),
                   quota_high_value_opportunity = COALESCE(?4, quota_high_value_opportunity),
                   quota_high_value_performance = COALESCE(?5, quota_high_value_performance),
                   achieved_new_signing = COALESCE(?6, achieved_new_signing),
                   achieved_core_opportunity = COALESCE(?7, achieved_core_opportunity),
                   achieved_core_performance = COALESCE(?8, achieved_core_performance),
                   achieved_high_value_opportunity = COALESCE(?9, achieved_high_value_opportunity),
                   achieved_high_value_performance = COALESCE(?10, achieved_high_value_performance),
                   notes = CASE WHEN ?11 THEN ?12 ELSE notes END,
                   last_modified_by = ?13, updated_at = ?14
                 WHERE id = ?15",
                params![
                    quota.new_signing,
                    quota.core_opportunity,
                    quota.core_performance,
                    quota.high_value_opportunity,
                    quota.high_value_performance,
                    achieved.new_signing,
                    achieved.core_opportunity,
                    achieved.core_performance,
                    achieved.high_value_opportunity,
                    achieved.high_value_performance,
                    notes.is_some(),
                    notes.flatten(),
                    modified_by,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_target(id)
    }

    /// Overwrites only the achieved columns, leaving concurrent quota edits intact.
    pub fn set_target_achieved(&self, id: &str, achieved: &MetricSet, modified_by: &str) -> AppResult<Option<Target>> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE targets SET
                   achieved_new_signing = ?1, achieved_core_opportunity = ?2, achieved_core_performance = ?3,
                   achieved_high_value_opportunity = ?4, achieved_high_value_performance = ?5,
                   last_modified_by = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    achieved.new_signing,
                    achieved.core_opportunity,
                    achieved.core_performance,
                    achieved.high_value_opportunity,
                    achieved.high_value_performance,
                    modified_by,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_target(id)
    }

    /// Deletes the target; linked distributor targets go with it.
    pub fn delete_target(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM targets WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn list_targets(
        &self,
        filters: &ListTargetsFilters,
        scope: SubjectScope<'_>,
        limit: u32,
        offset: u32,
    ) -> AppResult<Vec<Target>> {
        let mut query = format!("SELECT {} FROM targets WHERE 1 = 1", TARGET_COLUMNS);
        let mut values: Vec<Value> = Vec::new();

        if let Some(subject_type) = filters.subject_type {
            query.push_str(" AND subject_type = ?");
            values.push(Value::Text(subject_type.as_str().to_string()));
        }
        if let Some(subject_id) = &filters.subject_id {
            query.push_str(" AND subject_id = ?");
            values.push(Value::Text(subject_id.clone()));
        }
        if let Some(year) = filters.year {
            query.push_str(" AND year = ?");
            values.push(Value::Integer(i64::from(year)));
        }
        if let Some(kind) = filters.kind {
            query.push_str(" AND kind = ?");
            values.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(quarter) = filters.quarter {
            query.push_str(" AND quarter = ?");
            values.push(Value::Integer(i64::from(quarter.number())));
        }
        if let Some(month) = filters.month {
            query.push_str(" AND month = ?");
            values.push(Value::Integer(i64::from(month)));
        }
        push_scope_clause(&mut query, &mut values, scope);

        query.push_str(" ORDER BY year DESC, period_key ASC, subject_type ASC, subject_id ASC LIMIT ? OFFSET ?");
        values.push(Value::Integer(i64::from(limit)));
        values.push(Value::Integer(i64::from(offset)));

        let conn = self.conn()?;
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(params_from_iter(values), parse_target_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Targets a roll-up sums over: the quarter's quarterly targets, or the year's
    /// yearly targets when no quarter is given. Monthly targets are breakdowns and
    /// would double count.
    pub fn list_rollup_targets(
        &self,
        year: i32,
        quarter: Option<Quarter>,
        scope: SubjectScope<'_>,
    ) -> AppResult<Vec<Target>> {
        let mut query = format!("SELECT {} FROM targets WHERE year = ?", TARGET_COLUMNS);
        let mut values = vec![Value::Integer(i64::from(year))];
        match quarter {
            Some(quarter) => {
                query.push_str(" AND kind = 'quarterly' AND quarter = ?");
                values.push(Value::Integer(i64::from(quarter.number())));
            }
            None => query.push_str(" AND kind = 'yearly'"),
        }
        push_scope_clause(&mut query, &mut values, scope);
        query.push_str(" ORDER BY subject_type ASC, subject_id ASC");

        let conn = self.conn()?;
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(params_from_iter(values), parse_target_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_month_targets(
        &self,
        subject_type: SubjectType,
        subject_id: &str,
        year: i32,
        quarter: Quarter,
    ) -> AppResult<Vec<Target>> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM targets
             WHERE subject_type = ?1 AND subject_id = ?2 AND year = ?3 AND kind = 'monthly' AND quarter = ?4
             ORDER BY month ASC",
            TARGET_COLUMNS
        ))?;
        let rows = statement
            .query_map(
                params![subject_type.as_str(), subject_id, year, quarter.number()],
                parse_target_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Distributor targets ────────────────────────────────────────────────

    pub fn get_distributor_target(&self, id: &str) -> AppResult<Option<DistributorTarget>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM distributor_targets WHERE id = ?1", DISTRIBUTOR_TARGET_COLUMNS),
            [id],
            parse_distributor_target_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_distributor_targets_for_channel(&self, channel_target_id: &str) -> AppResult<Vec<DistributorTarget>> {
        let conn = self.conn()?;
        select_distributor_targets(
            &conn,
            "channel_target_id = ?1 ORDER BY distributor_id ASC",
            channel_target_id,
        )
    }

    pub fn list_distributor_targets_for_distributor(&self, distributor_id: &str) -> AppResult<Vec<DistributorTarget>> {
        let conn = self.conn()?;
        select_distributor_targets(
            &conn,
            "distributor_id = ?1 ORDER BY created_at ASC, id ASC",
            distributor_id,
        )
    }

    /// Keyed upsert of quotas under one channel target; achieved values of existing
    /// rows are kept. Returns every row linked to the channel afterwards.
    pub fn upsert_allocations(
        &self,
        channel_target_id: &str,
        quotas: &[(String, MetricSet)],
        modified_by: &str,
    ) -> AppResult<Vec<DistributorTarget>> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (distributor_id, quota) in quotas {
            tx.execute(
                "INSERT INTO distributor_targets (
                   id, channel_target_id, distributor_id,
                   quota_new_signing, quota_core_opportunity, quota_core_performance,
                   quota_high_value_opportunity, quota_high_value_performance,
                   created_by, last_modified_by, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?10)
                 ON CONFLICT(channel_target_id, distributor_id) DO UPDATE SET
                   quota_new_signing = excluded.quota_new_signing,
                   quota_core_opportunity = excluded.quota_core_opportunity,
                   quota_core_performance = excluded.quota_core_performance,
                   quota_high_value_opportunity = excluded.quota_high_value_opportunity,
                   quota_high_value_performance = excluded.quota_high_value_performance,
                   last_modified_by = excluded.last_modified_by,
                   updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    channel_target_id,
                    distributor_id,
                    quota.new_signing,
                    quota.core_opportunity,
                    quota.core_performance,
                    quota.high_value_opportunity,
                    quota.high_value_performance,
                    modified_by,
                    now,
                ],
            )?;
        }
        tx.commit()?;

        select_distributor_targets(
            &conn,
            "channel_target_id = ?1 ORDER BY distributor_id ASC",
            channel_target_id,
        )
    }

    pub fn insert_distributor_target(
        &self,
        channel_target_id: Option<&str>,
        distributor_id: &str,
        quota: &MetricSet,
        created_by: &str,
    ) -> AppResult<DistributorTarget> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO distributor_targets (
               id, channel_target_id, distributor_id,
               quota_new_signing, quota_core_opportunity, quota_core_performance,
               quota_high_value_opportunity, quota_high_value_performance,
               created_by, last_modified_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?10, ?10)",
            params![
                id,
                channel_target_id,
                distributor_id,
                quota.new_signing,
                quota.core_opportunity,
                quota.core_performance,
                quota.high_value_opportunity,
                quota.high_value_performance,
                created_by,
                now.to_rfc3339(),
            ],
        );
        match inserted {
            Err(error) if is_unique_violation(&error) => {
                return Err(AppError::Conflict(format!(
                    "Distributor {} already has a target under this channel target",
                    distributor_id
                )));
            }
            other => {
                other?;
            }
        }

        Ok(DistributorTarget {
            id,
            channel_target_id: channel_target_id.map(ToString::to_string),
            distributor_id: distributor_id.to_string(),
            quota: *quota,
            achieved: MetricSet::zero(),
            created_by: created_by.to_string(),
            last_modified_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Links an unattached distributor target to a channel target.
    pub fn attach_distributor_target(
        &self,
        id: &str,
        channel_target_id: &str,
        modified_by: &str,
    ) -> AppResult<Option<DistributorTarget>> {
        let changed = {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE distributor_targets SET channel_target_id = ?1, last_modified_by = ?2, updated_at = ?3
                 WHERE id = ?4 AND channel_target_id IS NULL",
                params![channel_target_id, modified_by, Utc::now().to_rfc3339(), id],
            );
            match updated {
                Err(error) if is_unique_violation(&error) => {
                    return Err(AppError::Conflict(format!(
                        "Channel target {} already has an allocation for this distributor",
                        channel_target_id
                    )));
                }
                other => other?,
            }
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_distributor_target(id)
    }

    /// Writes only the metrics present in `achieved`.
    pub fn set_distributor_target_achieved(
        &self,
        id: &str,
        achieved: &PartialMetricSet,
        modified_by: &str,
    ) -> AppResult<Option<DistributorTarget>> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE distributor_targets SET
                   achieved_new_signing = COALESCE(?1, achieved_new_signing),
                   achieved_core_opportunity = COALESCE(?2, achieved_core_opportunity),
                   achieved_core_performance = COALESCE(?3, achieved_core_performance),
                   achieved_high_value_opportunity = COALESCE(?4, achieved_high_value_opportunity),
                   achieved_high_value_performance = COALESCE(?5, achieved_high_value_performance),
                   last_modified_by = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    achieved.new_signing,
                    achieved.core_opportunity,
                    achieved.core_performance,
                    achieved.high_value_opportunity,
                    achieved.high_value_performance,
                    modified_by,
                    Utc::now().to_rfc3339(),
                    id,
                ],
            )?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_distributor_target(id)
    }

    pub fn delete_distributor_target(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM distributor_targets WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

impl ScopeSource for Database {
    fn all_user_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn granted_salesperson_ids(&self, leader_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .list_scope_grants(leader_id)?
            .into_iter()
            .map(|grant| grant.salesperson_id)
            .collect())
    }

    fn has_grant(&self, leader_id: &str, salesperson_id: &str) -> AppResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM scope_grants WHERE leader_id = ?1 AND salesperson_id = ?2",
            params![leader_id, salesperson_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn channel_owner(&self, channel_id: &str) -> AppResult<Option<String>> {
        Ok(self.get_channel(channel_id)?.map(|channel| channel.owner_id))
    }

    fn distributor_owner(&self, distributor_id: &str) -> AppResult<Option<String>> {
        Ok(self.get_distributor(distributor_id)?.map(|distributor| distributor.owner_id))
    }

    fn distributor_ids_owned_by(&self, owner_ids: &BTreeSet<String>) -> AppResult<Vec<String>> {
        if owner_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; owner_ids.len()].join(", ");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM distributors WHERE owner_id IN ({}) ORDER BY id ASC",
            placeholders
        ))?;
        let rows = stmt
            .query_map(params_from_iter(owner_ids.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn all_distributor_ids(&self) -> AppResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM distributors ORDER BY id ASC")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn push_scope_clause(query: &mut String, values: &mut Vec<Value>, scope: SubjectScope<'_>) {
    let SubjectScope::Users(user_ids) = scope else {
        return;
    };
    if user_ids.is_empty() {
        query.push_str(" AND 0 = 1");
        return;
    }
    let placeholders = vec!["?"; user_ids.len()].join(", ");
    query.push_str(&format!(
        " AND ((subject_type = 'person' AND subject_id IN ({p}))
           OR (subject_type = 'channel' AND subject_id IN (SELECT id FROM channels WHERE owner_id IN ({p}))))",
        p = placeholders
    ));
    for _ in 0..2 {
        values.extend(user_ids.iter().map(|id| Value::Text(id.clone())));
    }
}

fn select_distributor_targets(conn: &Connection, clause: &str, key: &str) -> AppResult<Vec<DistributorTarget>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM distributor_targets WHERE {}",
        DISTRIBUTOR_TARGET_COLUMNS, clause
    ))?;
    let rows = stmt
        .query_map([key], parse_distributor_target_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn parse_target_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        id: row.get(0)?,
        subject_type: parse_subject_type(&row.get::<_, String>(1)?)?,
        subject_id: row.get(2)?,
        period: parse_period(row.get(3)?, &row.get::<_, String>(4)?, row.get(5)?, row.get(6)?)?,
        quota: read_metrics(row, 7)?,
        achieved: read_metrics(row, 12)?,
        notes: row.get(17)?,
        created_by: row.get(18)?,
        last_modified_by: row.get(19)?,
        created_at: parse_time(&row.get::<_, String>(20)?)?,
        updated_at: parse_time(&row.get::<_, String>(21)?)?,
    })
}

fn parse_distributor_target_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DistributorTarget> {
    Ok(DistributorTarget {
        id: row.get(0)?,
        channel_target_id: row.get(1)?,
        distributor_id: row.get(2)?,
        quota: read_metrics(row, 3)?,
        achieved: read_metrics(row, 8)?,
        created_by: row.get(13)?,
        last_modified_by: row.get(14)?,
        created_at: parse_time(&row.get::<_, String>(15)?)?,
        updated_at: parse_time(&row.get::<_, String>(16)?)?,
    })
}

fn read_metrics(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<MetricSet> {
    Ok(MetricSet {
        new_signing: row.get(start)?,
        core_opportunity: row.get(start + 1)?,
        core_performance: row.get(start + 2)?,
        high_value_opportunity: row.get(start + 3)?,
        high_value_performance: row.get(start + 4)?,
    })
}

fn invalid_column(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    match raw {
        "admin" => Ok(Role::Admin),
        "leader" => Ok(Role::Leader),
        "salesperson" => Ok(Role::Salesperson),
        other => Err(invalid_column(format!("Unknown role '{}'", other))),
    }
}

fn parse_subject_type(raw: &str) -> rusqlite::Result<SubjectType> {
    match raw {
        "person" => Ok(SubjectType::Person),
        "channel" => Ok(SubjectType::Channel),
        other => Err(invalid_column(format!("Unknown subject type '{}'", other))),
    }
}

fn parse_period(year: i32, kind: &str, quarter: Option<u32>, month: Option<u32>) -> rusqlite::Result<Period> {
    let slot = match (kind, quarter, month) {
        ("yearly", _, _) => Some(PeriodSlot::Yearly),
        ("quarterly", Some(quarter), _) => Quarter::from_number(quarter).map(PeriodSlot::Quarterly),
        ("monthly", _, Some(month)) => Quarter::of_month(month).map(|_| PeriodSlot::Monthly(month)),
        _ => None,
    };
    slot.map(|slot| Period { year, slot }).ok_or_else(|| {
        invalid_column(format!(
            "Malformed period (kind={}, quarter={:?}, month={:?})",
            kind, quarter, month
        ))
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| invalid_column(error.to_string()))
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Database, SubjectScope};
    use crate::errors::AppError;
    use crate::models::{
        ListTargetsFilters, Metric, MetricSet, OverAllocationPolicy, PartialMetricSet, Role, SubjectType,
    };
    use crate::period::{validate, PeriodInput, Quarter, YearBounds};
    use std::collections::BTreeSet;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("targets.db")).expect("db")
    }

    fn quarter(year: i32, quarter: Quarter) -> crate::period::Period {
        validate(&PeriodInput::quarterly(year, quarter), YearBounds::default()).expect("period")
    }

    #[test]
    fn database_can_insert_and_read_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let quota = MetricSet::zero().with(Metric::NewSigning, 100.0);

        let created = db
            .insert_target(SubjectType::Person, "s1", &quarter(2025, Quarter::Q2), &quota, Some("first"), "l1")
            .expect("insert target");
        let loaded = db.get_target(&created.id).expect("get").expect("target exists");

        assert_eq!(loaded.subject_id, "s1");
        assert_eq!(loaded.period.key(), "2025-Q2");
        assert_eq!(loaded.quota.new_signing, 100.0);
        assert_eq!(loaded.achieved, MetricSet::zero());
        assert_eq!(loaded.notes.as_deref(), Some("first"));
        assert_eq!(loaded.last_modified_by, "l1");
    }

    #[test]
    fn partial_updates_leave_other_columns_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let target = db
            .insert_target(
                SubjectType::Person,
                "s1",
                &quarter(2025, Quarter::Q2),
                &MetricSet::zero().with(Metric::NewSigning, 100.0),
                Some("keep"),
                "l1",
            )
            .expect("insert target");
        let untouched = PartialMetricSet::default();

        db.update_target(&target.id, &untouched, &PartialMetricSet::default().with(Metric::NewSigning, 40.0), None, "s1")
            .expect("achievement")
            .expect("row exists");
        let edited = db
            .update_target(
                &target.id,
                &PartialMetricSet::default().with(Metric::CorePerformance, 8.0),
                &untouched,
                None,
                "l1",
            )
            .expect("quota")
            .expect("row exists");

        assert_eq!(edited.achieved.new_signing, 40.0);
        assert_eq!(edited.quota.new_signing, 100.0);
        assert_eq!(edited.quota.core_performance, 8.0);
        assert_eq!(edited.notes.as_deref(), Some("keep"));

        let cleared = db
            .update_target(&target.id, &untouched, &untouched, Some(None), "l1")
            .expect("notes")
            .expect("row exists");
        assert_eq!(cleared.notes, None);
        assert!(db
            .update_target("missing", &untouched, &untouched, None, "l1")
            .expect("update")
            .is_none());
    }

    #[test]
    fn duplicate_period_key_is_a_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let period = quarter(2025, Quarter::Q3);
        db.insert_target(SubjectType::Channel, "ch-1", &period, &MetricSet::zero(), None, "admin")
            .expect("first insert");

        let error = db
            .insert_target(SubjectType::Channel, "ch-1", &period, &MetricSet::zero(), None, "admin")
            .expect_err("duplicate");
        assert!(matches!(error, AppError::Conflict(_)));

        db.insert_target(SubjectType::Person, "ch-1", &period, &MetricSet::zero(), None, "admin")
            .expect("same id under another subject type is a different key");
    }

    #[test]
    fn deleting_channel_target_cascades_to_allocations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let channel = db
            .insert_target(SubjectType::Channel, "ch-1", &quarter(2025, Quarter::Q2), &MetricSet::zero(), None, "admin")
            .expect("channel target");
        let rows = db
            .upsert_allocations(
                &channel.id,
                &[
                    ("d-1".to_string(), MetricSet::zero().with(Metric::NewSigning, 60.0)),
                    ("d-2".to_string(), MetricSet::zero().with(Metric::NewSigning, 40.0)),
                ],
                "admin",
            )
            .expect("allocate");
        assert_eq!(rows.len(), 2);

        assert!(db.delete_target(&channel.id).expect("delete"));
        assert!(db.get_distributor_target(&rows[0].id).expect("lookup").is_none());
        assert!(db.list_distributor_targets_for_distributor("d-2").expect("list").is_empty());
    }

    #[test]
    fn upsert_allocations_keeps_achieved_and_row_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let channel = db
            .insert_target(SubjectType::Channel, "ch-1", &quarter(2025, Quarter::Q1), &MetricSet::zero(), None, "admin")
            .expect("channel target");
        let first = db
            .upsert_allocations(&channel.id, &[("d-1".to_string(), MetricSet::zero().with(Metric::NewSigning, 10.0))], "admin")
            .expect("allocate");
        db.set_distributor_target_achieved(&first[0].id, &PartialMetricSet::default().with(Metric::NewSigning, 4.0), "s1")
            .expect("achieved")
            .expect("row exists");

        let second = db
            .upsert_allocations(&channel.id, &[("d-1".to_string(), MetricSet::zero().with(Metric::NewSigning, 12.0))], "l1")
            .expect("reallocate");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].quota.new_signing, 12.0);
        assert_eq!(second[0].achieved.new_signing, 4.0);
        assert_eq!(second[0].last_modified_by, "l1");

        let other_metric = db
            .set_distributor_target_achieved(&first[0].id, &PartialMetricSet::default().with(Metric::CoreOpportunity, 2.0), "s1")
            .expect("achieved")
            .expect("row exists");
        assert_eq!(other_metric.achieved.new_signing, 4.0);
        assert_eq!(other_metric.achieved.core_opportunity, 2.0);
    }

    #[test]
    fn scoped_listing_covers_people_and_owned_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.upsert_channel("ch-1", "North", "s1").expect("channel");
        db.upsert_channel("ch-2", "South", "s2").expect("channel");
        let period = quarter(2025, Quarter::Q2);
        for (subject_type, subject_id) in [
            (SubjectType::Person, "s1"),
            (SubjectType::Person, "s2"),
            (SubjectType::Channel, "ch-1"),
            (SubjectType::Channel, "ch-2"),
        ] {
            db.insert_target(subject_type, subject_id, &period, &MetricSet::zero(), None, "admin")
                .expect("insert");
        }

        let visible = BTreeSet::from(["s1".to_string()]);
        let listed = db
            .list_targets(&ListTargetsFilters::default(), SubjectScope::Users(&visible), 100, 0)
            .expect("list");
        let mut subjects: Vec<_> = listed.iter().map(|target| target.subject_id.as_str()).collect();
        subjects.sort_unstable();
        assert_eq!(subjects, vec!["ch-1", "s1"]);

        let nobody = BTreeSet::new();
        assert!(db
            .list_targets(&ListTargetsFilters::default(), SubjectScope::Users(&nobody), 100, 0)
            .expect("list")
            .is_empty());
        assert_eq!(
            db.list_targets(&ListTargetsFilters::default(), SubjectScope::Everything, 100, 0)
                .expect("list")
                .len(),
            4
        );
    }

    #[test]
    fn quarter_filter_includes_months_inside_the_quarter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let may = validate(&PeriodInput::monthly(2025, 5), YearBounds::default()).expect("period");
        let july = validate(&PeriodInput::monthly(2025, 7), YearBounds::default()).expect("period");
        db.insert_target(SubjectType::Person, "s1", &may, &MetricSet::zero(), None, "admin")
            .expect("may");
        db.insert_target(SubjectType::Person, "s1", &july, &MetricSet::zero(), None, "admin")
            .expect("july");

        let filters = ListTargetsFilters {
            quarter: Some(Quarter::Q2),
            ..ListTargetsFilters::default()
        };
        let listed = db
            .list_targets(&filters, SubjectScope::Everything, 100, 0)
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].period.month(), Some(5));

        let months = db
            .list_month_targets(SubjectType::Person, "s1", 2025, Quarter::Q3)
            .expect("months");
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].period.key(), "2025-M07");
    }

    #[test]
    fn replacing_scope_grants_is_a_full_replace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.upsert_user("l1", "Lee", Role::Leader).expect("user");

        let first = BTreeSet::from(["s1".to_string(), "s2".to_string()]);
        db.replace_scope_grants("l1", &first).expect("grant");
        let second = BTreeSet::from(["s3".to_string()]);
        let grants = db.replace_scope_grants("l1", &second).expect("replace");

        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].salesperson_id, "s3");
    }

    #[test]
    fn settings_merge_and_yaml_override() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        assert_eq!(db.get_settings().expect("settings").max_year, 2100);

        let updated = db
            .update_settings(serde_json::json!({ "overAllocationPolicy": "reject" }))
            .expect("update");
        assert_eq!(updated.over_allocation_policy, OverAllocationPolicy::Reject);
        assert_eq!(updated.min_year, 2000);

        let file = dir.path().join("targets.yaml");
        std::fs::write(&file, "minYear: 2020\nmaxYear: 2030\n").expect("write yaml");
        let overridden = db.apply_settings_file(&file).expect("apply file");
        assert_eq!(overridden.min_year, 2020);
        assert_eq!(overridden.max_year, 2030);
        assert_eq!(overridden.over_allocation_policy, OverAllocationPolicy::Reject);

        let error = db
            .update_settings(serde_json::json!({ "minYear": 2040 }))
            .expect_err("min above max");
        assert!(matches!(error, AppError::Validation(_)));
    }
}
