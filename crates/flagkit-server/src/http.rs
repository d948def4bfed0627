//! HTTP endpoint handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use flagkit_core::{
    ActionState, BulkOutcome, CascadeReport, FlagCount, FlagDefinition, FlagError, Flagging,
    FlaggingId, FlaggingPatch, LinkAction, OwnerKey, RenderedAction, TargetRef, UserId,
    ADMINISTER_FLAGGINGS,
};

use crate::auth::ActingUser;
use crate::AppState;

/// Error returned by every handler
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Flag(#[from] FlagError),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Flag(err) => match err {
                FlagError::UnknownFlagDefinition(_) | FlagError::FlaggingNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                FlagError::InvariantViolation { .. } | FlagError::AlreadyRegistered(_) => {
                    StatusCode::CONFLICT
                }
                FlagError::PersistenceTimeout(_) | FlagError::PersistenceConflict(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                FlagError::ImmutableRelationViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                FlagError::TargetTypeMismatch { .. }
                | FlagError::BundleNotAllowed { .. }
                | FlagError::InvalidDefinition { .. } => StatusCode::BAD_REQUEST,
                FlagError::Storage(_) | FlagError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, ApiError::Flag(err) if err.is_retryable())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "retryable": self.retryable(),
        }));
        if self.retryable() {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Run ledger work off the async executor; SQLite calls may wait on locks.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

fn require_admin(state: &AppState, user: UserId) -> Result<(), ApiError> {
    if state.gate.has_permission(user, ADMINISTER_FLAGGINGS) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "'{}' permission required",
            ADMINISTER_FLAGGINGS
        )))
    }
}

/// Administrators may always act. Everyone else needs the flag's
/// permission for the action, an enabled flag and a real account.
fn authorize(state: &AppState, user: UserId, flag_id: &str, action: LinkAction) -> Result<(), ApiError> {
    let flag = state.definition(flag_id)?;
    if state.gate.has_permission(user, ADMINISTER_FLAGGINGS) {
        return Ok(());
    }
    let permission = match action {
        LinkAction::Flag => flag.flag_permission(),
        LinkAction::Unflag => flag.unflag_permission(),
    };
    if user == flagkit_core::ANONYMOUS || !flag.enabled || !state.gate.has_permission(user, &permission) {
        return Err(ApiError::Forbidden(format!(
            "user {} may not {} with '{}'",
            user, action, flag_id
        )));
    }
    Ok(())
}

fn parse_flagging_id(id: &str) -> Result<FlaggingId, ApiError> {
    FlaggingId::parse(id).map_err(|e| ApiError::BadRequest(format!("invalid flagging id: {}", e)))
}

// ==================== System ====================

/// Health check
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ==================== Flag definitions ====================

/// Summary of a flag for listing
#[derive(Debug, Serialize, Deserialize)]
pub struct FlagSummary {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    pub scope: flagkit_core::FlagScope,
    pub enabled: bool,
}

/// List all flags
pub async fn list_flags(State(state): State<Arc<AppState>>) -> Result<Json<Vec<FlagSummary>>, ApiError> {
    let registry = state
        .registry()
        .read()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let flags = registry
        .list()
        .into_iter()
        .map(|f| FlagSummary {
            id: f.id.clone(),
            label: f.label.clone(),
            entity_type: f.entity_type.clone(),
            scope: f.scope,
            enabled: f.enabled,
        })
        .collect();
    Ok(Json(flags))
}

/// Get a flag definition
pub async fn get_flag(
    State(state): State<Arc<AppState>>,
    Path(flag_id): Path<String>,
) -> Result<Json<FlagDefinition>, ApiError> {
    Ok(Json(state.definition(&flag_id)?))
}

/// Create or replace a flag definition
pub async fn put_flag(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(flag_id): Path<String>,
    Json(flag): Json<FlagDefinition>,
) -> Result<(StatusCode, Json<FlagDefinition>), ApiError> {
    require_admin(&state, user.0)?;
    if flag.id != flag_id {
        return Err(ApiError::BadRequest(format!(
            "flag id '{}' does not match path '{}'",
            flag.id, flag_id
        )));
    }
    // Written to the definitions directory, if one is configured.
    blocking(move || {
        let created = state
            .registry()
            .write()
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .save(flag.clone())?;
        tracing::info!(flag_id = %flag_id, created, user = user.0, "saved flag definition");
        let status = if created { StatusCode::CREATED } else { StatusCode::OK };
        Ok((status, Json(flag)))
    })
    .await
}

/// Delete a flag definition and all of its flaggings
pub async fn delete_flag(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(flag_id): Path<String>,
) -> Result<Json<CascadeReport>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || Ok(state.cascade.on_flag_deleted(&flag_id)?))
        .await
        .map(Json)
}

/// Response for a count rebuild
#[derive(Debug, Serialize, Deserialize)]
pub struct RebuildResponse {
    pub flag_id: String,
    pub counts: usize,
}

/// Rebuild a flag's counts from the ledger
pub async fn rebuild_counts(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(flag_id): Path<String>,
) -> Result<Json<RebuildResponse>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || {
        let counts = state.ledger.counter().rebuild(&flag_id)?;
        Ok(Json(RebuildResponse { flag_id, counts }))
    })
    .await
}

// ==================== Flag actions ====================

/// Bundle of the target, when the host knows it
#[derive(Debug, Default, Deserialize)]
pub struct BundleQuery {
    pub bundle: Option<String>,
}

/// Optional body for a flag action
#[derive(Debug, Default, Deserialize)]
pub struct FlagRequest {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Response for a flag action
#[derive(Debug, Serialize, Deserialize)]
pub struct FlagResponse {
    pub flagging: Flagging,
    pub count: u64,
}

/// Flag a target
pub async fn flag_target(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path((flag_id, entity_type, entity_id)): Path<(String, String, String)>,
    Query(query): Query<BundleQuery>,
    body: Bytes,
) -> Result<Json<FlagResponse>, ApiError> {
    let request: FlagRequest = if body.is_empty() {
        FlagRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("invalid body: {}", e)))?
    };

    blocking(move || {
        authorize(&state, user.0, &flag_id, LinkAction::Flag)?;
        let target = TargetRef::new(entity_type, entity_id);
        let flagging = state
            .ledger
            .flag_with_fields(&flag_id, &target, query.bundle.as_deref(), user.0, request.fields)?;
        let count = state.ledger.counter().get_count(&flag_id, &target)?;
        Ok(Json(FlagResponse { flagging, count }))
    })
    .await
}

/// Unflag a target
pub async fn unflag_target(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path((flag_id, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    blocking(move || {
        authorize(&state, user.0, &flag_id, LinkAction::Unflag)?;
        let target = TargetRef::new(entity_type, entity_id);
        state.ledger.unflag(&flag_id, &target, user.0)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Get the count for a target
pub async fn get_count(
    State(state): State<Arc<AppState>>,
    Path((flag_id, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<Json<FlagCount>, ApiError> {
    blocking(move || {
        let target = TargetRef::new(entity_type, entity_id);
        let count = state.ledger.counter().get_count(&flag_id, &target)?;
        Ok(Json(FlagCount {
            flag_id,
            target,
            count,
        }))
    })
    .await
}

/// Flag state and affordance for the acting user
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub flag_id: String,
    pub target: TargetRef,
    pub user: UserId,
    #[serde(flatten)]
    pub state: ActionState,
    pub count: u64,
    pub action: RenderedAction,
}

/// Get the flag status of a target for the acting user
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path((flag_id, entity_type, entity_id)): Path<(String, String, String)>,
    Query(query): Query<BundleQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    blocking(move || {
        let target = TargetRef::new(entity_type, entity_id);
        let (action_state, action) = state
            .gate
            .status(user.0, &flag_id, &target, query.bundle.as_deref())?;
        let count = state.ledger.counter().get_count(&flag_id, &target)?;
        Ok(Json(StatusResponse {
            flag_id,
            target,
            user: user.0,
            state: action_state,
            count,
            action,
        }))
    })
    .await
}

/// List the flaggings of a flag on a target
pub async fn list_flaggings(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path((flag_id, entity_type, entity_id)): Path<(String, String, String)>,
) -> Result<Json<Vec<Flagging>>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || {
        let target = TargetRef::new(entity_type, entity_id);
        Ok(Json(state.ledger.list_flaggings(&flag_id, &target)?))
    })
    .await
}

// ==================== Flaggings ====================

/// Owners may read and edit their own personal flaggings.
fn owns(flagging: &Flagging, user: UserId) -> bool {
    user != flagkit_core::ANONYMOUS && flagging.owner == OwnerKey::User(user)
}

/// Get a flagging
pub async fn get_flagging(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(id): Path<String>,
) -> Result<Json<Flagging>, ApiError> {
    let id = parse_flagging_id(&id)?;
    blocking(move || {
        let flagging = state.ledger.get(id)?;
        if !owns(&flagging, user.0) {
            require_admin(&state, user.0)?;
        }
        Ok(Json(flagging))
    })
    .await
}

/// Edit a flagging's fields
pub async fn update_flagging(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(id): Path<String>,
    Json(patch): Json<FlaggingPatch>,
) -> Result<Json<Flagging>, ApiError> {
    let id = parse_flagging_id(&id)?;
    blocking(move || {
        let flagging = state.ledger.get(id)?;
        if !owns(&flagging, user.0) {
            require_admin(&state, user.0)?;
        }
        Ok(Json(state.ledger.update_flagging(id, patch)?))
    })
    .await
}

/// Delete a flagging
pub async fn delete_flagging(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, user.0)?;
    let id = parse_flagging_id(&id)?;
    blocking(move || {
        state.ledger.delete_by_id(id)?;
        Ok(StatusCode::NO_CONTENT)
    })
    .await
}

/// Request to delete several flaggings
#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<FlaggingId>,
}

/// Delete several flaggings; each row commits on its own
pub async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<Json<BulkOutcome>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || Ok(Json(state.ledger.delete_many(&request.ids)))).await
}

// ==================== Host lifecycle events ====================

/// A user account was deleted
pub async fn user_deleted(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path(deleted): Path<UserId>,
) -> Result<Json<CascadeReport>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || Ok(Json(state.cascade.on_user_deleted(deleted)?))).await
}

/// An entity was deleted
pub async fn entity_deleted(
    State(state): State<Arc<AppState>>,
    user: ActingUser,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<CascadeReport>, ApiError> {
    require_admin(&state, user.0)?;
    blocking(move || {
        let target = TargetRef::new(entity_type, entity_id);
        Ok(Json(state.cascade.on_entity_deleted(&target)?))
    })
    .await
}
