use crate::errors::FieldError;
use crate::period::{Period, PeriodInput, Quarter, TargetKind, DEFAULT_MAX_YEAR, DEFAULT_MIN_YEAR};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    Leader,
    Salesperson,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Leader => "leader",
            Self::Salesperson => "salesperson",
        }
    }

    /// Leaders and admins may set quotas and allocate.
    pub fn manages_quotas(self) -> bool {
        matches!(self, Self::Admin | Self::Leader)
    }
}

/// Authenticated identity of the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub user_id: String,
    pub role: Role,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Admin)
    }

    pub fn leader(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Leader)
    }

    pub fn salesperson(user_id: impl Into<String>) -> Self {
        Self::new(user_id, Role::Salesperson)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubjectType {
    Person,
    Channel,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    NewSigning,
    CoreOpportunity,
    CorePerformance,
    HighValueOpportunity,
    HighValuePerformance,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::NewSigning,
        Metric::CoreOpportunity,
        Metric::CorePerformance,
        Metric::HighValueOpportunity,
        Metric::HighValuePerformance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewSigning => "newSigning",
            Self::CoreOpportunity => "coreOpportunity",
            Self::CorePerformance => "corePerformance",
            Self::HighValueOpportunity => "highValueOpportunity",
            Self::HighValuePerformance => "highValuePerformance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricSet {
    pub new_signing: f64,
    pub core_opportunity: f64,
    pub core_performance: f64,
    pub high_value_opportunity: f64,
    pub high_value_performance: f64,
}

impl MetricSet {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::NewSigning => self.new_signing,
            Metric::CoreOpportunity => self.core_opportunity,
            Metric::CorePerformance => self.core_performance,
            Metric::HighValueOpportunity => self.high_value_opportunity,
            Metric::HighValuePerformance => self.high_value_performance,
        }
    }

    pub fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::NewSigning => self.new_signing = value,
            Metric::CoreOpportunity => self.core_opportunity = value,
            Metric::CorePerformance => self.core_performance = value,
            Metric::HighValueOpportunity => self.high_value_opportunity = value,
            Metric::HighValuePerformance => self.high_value_performance = value,
        }
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        self.set(metric, value);
        self
    }

    pub fn add_assign(&mut self, other: &MetricSet) {
        for metric in Metric::ALL {
            self.set(metric, self.get(metric) + other.get(metric));
        }
    }

    /// Rejects negative, NaN and infinite values, reporting `<prefix>.<metric>`.
    pub fn validate(&self, prefix: &str) -> Vec<FieldError> {
        Metric::ALL
            .iter()
            .filter_map(|metric| check_metric_value(prefix, *metric, self.get(*metric)))
            .collect()
    }
}

fn check_metric_value(prefix: &str, metric: Metric, value: f64) -> Option<FieldError> {
    let field = format!("{}.{}", prefix, metric.as_str());
    if !value.is_finite() {
        Some(FieldError::new(field, "must be a finite number"))
    } else if value < 0.0 {
        Some(FieldError::new(field, "must not be negative"))
    } else {
        None
    }
}

/// Metric patch: absent fields leave the current value untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PartialMetricSet {
    pub new_signing: Option<f64>,
    pub core_opportunity: Option<f64>,
    pub core_performance: Option<f64>,
    pub high_value_opportunity: Option<f64>,
    pub high_value_performance: Option<f64>,
}

impl PartialMetricSet {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::NewSigning => self.new_signing,
            Metric::CoreOpportunity => self.core_opportunity,
            Metric::CorePerformance => self.core_performance,
            Metric::HighValueOpportunity => self.high_value_opportunity,
            Metric::HighValuePerformance => self.high_value_performance,
        }
    }

    pub fn with(mut self, metric: Metric, value: f64) -> Self {
        let slot = match metric {
            Metric::NewSigning => &mut self.new_signing,
            Metric::CoreOpportunity => &mut self.core_opportunity,
            Metric::CorePerformance => &mut self.core_performance,
            Metric::HighValueOpportunity => &mut self.high_value_opportunity,
            Metric::HighValuePerformance => &mut self.high_value_performance,
        };
        *slot = Some(value);
        self
    }

    pub fn is_empty(&self) -> bool {
        Metric::ALL.iter().all(|metric| self.get(*metric).is_none())
    }

    pub fn apply_to(&self, target: &mut MetricSet) {
        for metric in Metric::ALL {
            if let Some(value) = self.get(metric) {
                target.set(metric, value);
            }
        }
    }

    pub fn validate(&self, prefix: &str) -> Vec<FieldError> {
        Metric::ALL
            .iter()
            .filter_map(|metric| {
                self.get(*metric)
                    .and_then(|value| check_metric_value(prefix, *metric, value))
            })
            .collect()
    }
}

impl From<MetricSet> for PartialMetricSet {
    fn from(value: MetricSet) -> Self {
        Metric::ALL
            .iter()
            .fold(Self::default(), |patch, metric| patch.with(*metric, value.get(*metric)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub period: Period,
    pub quota: MetricSet,
    pub achieved: MetricSet,
    pub notes: Option<String>,
    pub created_by: String,
    pub last_modified_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorTarget {
    pub id: String,
    pub channel_target_id: Option<String>,
    pub distributor_id: String,
    pub quota: MetricSet,
    pub achieved: MetricSet,
    pub created_by: String,
    pub last_modified_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGrant {
    pub leader_id: String,
    pub salesperson_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderScope {
    pub leader_id: String,
    pub salesperson_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorRecord {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetPayload {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub period: PeriodInput,
    #[serde(default)]
    pub quota: MetricSet,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTargetPayload {
    pub quota: Option<PartialMetricSet>,
    pub achieved: Option<PartialMetricSet>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListTargetsFilters {
    pub subject_type: Option<SubjectType>,
    pub subject_id: Option<String>,
    pub year: Option<i32>,
    pub kind: Option<TargetKind>,
    pub quarter: Option<Quarter>,
    pub month: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub year: i32,
    pub quarter: Option<Quarter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterViewQuery {
    #[serde(alias = "target_type")]
    pub target_type: SubjectType,
    #[serde(alias = "target_id")]
    pub target_id: String,
    pub year: i32,
    pub quarter: Quarter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEntry {
    pub distributor_id: String,
    #[serde(default)]
    pub quota: PartialMetricSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatePayload {
    pub channel_target_id: String,
    pub allocations: Vec<AllocationEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationWarning {
    pub metric: Metric,
    pub allocated: f64,
    pub quota: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    pub channel_target_id: String,
    pub distributor_targets: Vec<DistributorTarget>,
    pub warnings: Vec<AllocationWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDistributorTargetPayload {
    pub channel_target_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub per_metric: MetricSet,
    pub overall: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCompletion {
    pub target_id: String,
    pub quota: MetricSet,
    pub achieved: MetricSet,
    pub completion: CompletionReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterMonthWarning {
    pub metric: Metric,
    pub quarter_quota: f64,
    pub months_quota: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarterView {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub year: i32,
    pub quarter_of_year: Quarter,
    pub quarter: Option<Target>,
    pub months: Vec<Target>,
    pub completions: Vec<TargetCompletion>,
    pub warnings: Vec<QuarterMonthWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatistics {
    pub year: i32,
    pub quarter: Option<Quarter>,
    pub target_count: u32,
    pub person_target_count: u32,
    pub channel_target_count: u32,
    pub quota: MetricSet,
    pub achieved: MetricSet,
    pub completion: CompletionReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverAllocationPolicy {
    Advisory,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuarterMonthCheck {
    Advisory,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetSettings {
    pub min_year: i32,
    pub max_year: i32,
    pub over_allocation_policy: OverAllocationPolicy,
    pub quarter_month_check: QuarterMonthCheck,
    pub statistics_cache_ttl_seconds: u64,
    pub default_list_limit: u32,
    pub max_list_limit: u32,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            min_year: DEFAULT_MIN_YEAR,
            max_year: DEFAULT_MAX_YEAR,
            over_allocation_policy: OverAllocationPolicy::Advisory,
            quarter_month_check: QuarterMonthCheck::Advisory,
            statistics_cache_ttl_seconds: 300,
            default_list_limit: 100,
            max_list_limit: 1_000,
        }
    }
}
