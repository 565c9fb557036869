//! Request-shaped entry points, one per endpoint of the targets API. A transport
//! layer deserializes the request, resolves the caller and forwards here.

use crate::errors::{AppError, AppResult, FieldError};
use crate::models::{
    AllocatePayload, AllocationResult, AttachDistributorTargetPayload, BooleanResponse, CallerContext,
    CreateTargetPayload, DistributorTarget, LeaderScope, ListTargetsFilters, MetricSet, PartialMetricSet,
    QuarterView, QuarterViewQuery, StatisticsQuery, Target, TargetCompletion, TargetStatistics,
    UpdateTargetPayload,
};
use crate::service::TargetService;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub targets: Arc<TargetService>,
}

impl AppState {
    pub fn new(targets: TargetService) -> Self {
        Self {
            targets: Arc::new(targets),
        }
    }
}

/// Error shape returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
}

impl From<AppError> for ClientError {
    fn from(error: AppError) -> Self {
        let field_errors = match &error {
            AppError::Validation(fields) => fields.clone(),
            _ => Vec::new(),
        };
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            field_errors,
        }
    }
}

pub type CommandResult<T> = Result<T, ClientError>;

fn to_client_error(error: AppError) -> ClientError {
    if matches!(error, AppError::Internal(_) | AppError::Io(_)) {
        tracing::error!(error = %error, "command failed");
    }
    ClientError::from(error)
}

fn require_confirmation(confirm: bool) -> AppResult<()> {
    if confirm {
        Ok(())
    } else {
        Err(AppError::invalid(
            "confirm",
            "destructive operations require explicit confirmation",
        ))
    }
}

// ─── /targets and /unified-targets ──────────────────────────────────────────

pub fn create_target(state: &AppState, caller: &CallerContext, payload: CreateTargetPayload) -> CommandResult<Target> {
    state.targets.create_target(caller, payload).map_err(to_client_error)
}

pub fn list_targets(
    state: &AppState,
    caller: &CallerContext,
    filters: ListTargetsFilters,
) -> CommandResult<Vec<Target>> {
    state.targets.list_targets(caller, &filters).map_err(to_client_error)
}

pub fn get_target(state: &AppState, caller: &CallerContext, target_id: String) -> CommandResult<Target> {
    state.targets.get_target(caller, &target_id).map_err(to_client_error)
}

pub fn update_target(
    state: &AppState,
    caller: &CallerContext,
    target_id: String,
    payload: UpdateTargetPayload,
) -> CommandResult<Target> {
    state
        .targets
        .update_target(caller, &target_id, payload)
        .map_err(to_client_error)
}

pub fn update_target_achievement(
    state: &AppState,
    caller: &CallerContext,
    target_id: String,
    achieved: PartialMetricSet,
) -> CommandResult<Target> {
    state
        .targets
        .update_achievement(caller, &target_id, achieved)
        .map_err(to_client_error)
}

pub fn delete_target(
    state: &AppState,
    caller: &CallerContext,
    target_id: String,
    confirm: bool,
) -> CommandResult<BooleanResponse> {
    require_confirmation(confirm)
        .and_then(|_| state.targets.delete_target(caller, &target_id))
        .map(|_| BooleanResponse { success: true })
        .map_err(to_client_error)
}

pub fn get_target_completion(
    state: &AppState,
    caller: &CallerContext,
    target_id: String,
) -> CommandResult<TargetCompletion> {
    state
        .targets
        .target_completion(caller, &target_id)
        .map_err(to_client_error)
}

pub fn get_target_statistics(
    state: &AppState,
    caller: &CallerContext,
    query: StatisticsQuery,
) -> CommandResult<TargetStatistics> {
    state
        .targets
        .statistics(caller, query.year, query.quarter)
        .map_err(to_client_error)
}

pub fn get_quarter_view(state: &AppState, caller: &CallerContext, query: QuarterViewQuery) -> CommandResult<QuarterView> {
    state
        .targets
        .quarter_view(caller, query.target_type, &query.target_id, query.year, query.quarter)
        .map_err(to_client_error)
}

// ─── /distributor-targets ───────────────────────────────────────────────────

pub fn allocate_distributor_targets(
    state: &AppState,
    caller: &CallerContext,
    payload: AllocatePayload,
) -> CommandResult<AllocationResult> {
    state.targets.allocate(caller, &payload).map_err(to_client_error)
}

pub fn list_channel_distributor_targets(
    state: &AppState,
    caller: &CallerContext,
    channel_target_id: String,
) -> CommandResult<Vec<DistributorTarget>> {
    state
        .targets
        .list_by_channel(caller, &channel_target_id)
        .map_err(to_client_error)
}

pub fn list_distributor_targets(
    state: &AppState,
    caller: &CallerContext,
    distributor_id: String,
) -> CommandResult<Vec<DistributorTarget>> {
    state
        .targets
        .list_by_distributor(caller, &distributor_id)
        .map_err(to_client_error)
}

pub fn aggregate_channel_target(
    state: &AppState,
    caller: &CallerContext,
    channel_target_id: String,
) -> CommandResult<Target> {
    state
        .targets
        .aggregate(caller, &channel_target_id)
        .map_err(to_client_error)
}

pub fn get_distributor_target(
    state: &AppState,
    caller: &CallerContext,
    distributor_target_id: String,
) -> CommandResult<DistributorTarget> {
    state
        .targets
        .get_distributor_target(caller, &distributor_target_id)
        .map_err(to_client_error)
}

pub fn update_distributor_target_completion(
    state: &AppState,
    caller: &CallerContext,
    distributor_target_id: String,
    achieved: PartialMetricSet,
) -> CommandResult<DistributorTarget> {
    state
        .targets
        .update_distributor_completion(caller, &distributor_target_id, achieved)
        .map_err(to_client_error)
}

pub fn delete_distributor_target(
    state: &AppState,
    caller: &CallerContext,
    distributor_target_id: String,
    confirm: bool,
) -> CommandResult<BooleanResponse> {
    require_confirmation(confirm)
        .and_then(|_| state.targets.delete_distributor_target(caller, &distributor_target_id))
        .map(|_| BooleanResponse { success: true })
        .map_err(to_client_error)
}

pub fn create_distributor_target(
    state: &AppState,
    caller: &CallerContext,
    distributor_id: String,
    quota: MetricSet,
) -> CommandResult<DistributorTarget> {
    state
        .targets
        .create_for_distributor(caller, &distributor_id, quota)
        .map_err(to_client_error)
}

pub fn attach_distributor_target(
    state: &AppState,
    caller: &CallerContext,
    distributor_target_id: String,
    payload: AttachDistributorTargetPayload,
) -> CommandResult<DistributorTarget> {
    state
        .targets
        .attach_to_channel(caller, &distributor_target_id, &payload.channel_target_id)
        .map_err(to_client_error)
}

// ─── /admin/users/:id/scope ─────────────────────────────────────────────────

pub fn get_leader_scope(state: &AppState, caller: &CallerContext, leader_id: String) -> CommandResult<LeaderScope> {
    state
        .targets
        .get_leader_scope(caller, &leader_id)
        .map_err(to_client_error)
}

pub fn set_leader_scope(
    state: &AppState,
    caller: &CallerContext,
    leader_id: String,
    salesperson_ids: Vec<String>,
) -> CommandResult<LeaderScope> {
    state
        .targets
        .set_leader_scope(caller, &leader_id, &salesperson_ids)
        .map_err(to_client_error)
}
