//! Dispatcher (debug API): state extraction, typed request/response
//! bodies, `Result<impl IntoResponse, ApiError>` handlers.

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    models::{AuthContext, Command, CommandType, scopes},
};

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub cluster_id: String,
    pub ttl: Option<u64>,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub cluster_id: String,
    pub ttl_deadline: chrono::DateTime<Utc>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    require_scope(&auth, scopes::DEBUG_READ)?;
    if req.cluster_id.trim().is_empty() {
        return Err(ApiError::InvalidArgument("cluster_id must not be empty".into()));
    }
    let session = state
        .sessions
        .create_session(&req.cluster_id, &auth.identity, req.ttl)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.session_id,
            cluster_id: session.cluster_id,
            ttl_deadline: session.ttl_deadline,
        }),
    ))
}

pub async fn close_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    require_scope(&auth, scopes::DEBUG_READ)?;
    state.sessions.close_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub session_id: Uuid,
    pub cluster_id: String,
    pub command_type: CommandType,
    pub args: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

pub async fn execute(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<impl IntoResponse> {
    require_scope(&auth, scopes::DEBUG_EXECUTE)?;
    validate_args(req.command_type, &req.args)?;

    // (I4) touching the session both refreshes its TTL and fails
    // `NotFound` if it has already expired, so an expired session cannot
    // accept new commands.
    state.sessions.touch(req.session_id).await?;

    let timeout_seconds = req
        .timeout_seconds
        .unwrap_or(state.args.dispatch_timeout_seconds);
    let timeout_ms = timeout_seconds.saturating_mul(1000);

    let command = Command {
        command_id: Uuid::new_v4(),
        cluster_id: req.cluster_id,
        session_id: Some(req.session_id),
        command_type: req.command_type,
        args: req.args,
        timeout_ms,
        enqueued_at: Utc::now(),
    };

    state.queue.enqueue(&command).await?;
    let result = state
        .queue
        .await_result(command.command_id, timeout_ms, &state.shutdown)
        .await?;

    Ok(Json(result))
}

pub async fn list_clusters(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<impl IntoResponse> {
    require_scope(&auth, scopes::DEBUG_READ)?;
    let mut clusters: Vec<String> = state.executors.connected_clusters().await?.into_iter().collect();
    clusters.sort();
    Ok(Json(serde_json::json!({ "clusters": clusters })))
}

fn require_scope(auth: &AuthContext, scope: &str) -> ApiResult<()> {
    if auth.has_scope(scope) {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied(format!(
            "identity {} lacks scope {scope}",
            auth.identity
        )))
    }
}

/// kubectl verbs that mutate cluster state or grant arbitrary execution.
/// `command_type` already restricts the operation to one of five read
/// subcommands (get/describe/logs/events/top); this is the defense in
/// depth guard against one of these verbs being smuggled in as `args[0]`
/// (e.g. `command_type="get", args=["delete","pods","--all"]`).
const MUTATING_VERBS: &[&str] = &[
    "delete", "apply", "create", "edit", "patch", "replace", "scale", "cordon", "uncordon",
    "drain", "exec", "attach", "port-forward", "proxy", "run", "label", "annotate", "set",
    "expose", "rollout", "taint", "cp", "autoscale", "restart",
];

/// `args` is a whitelisted, ordered sequence; the first element must not
/// be a mutating verb. Empty args or a mutating first verb are both
/// rejected as `InvalidArgument`.
fn validate_args(command_type: CommandType, args: &[String]) -> ApiResult<()> {
    let Some(first) = args.first() else {
        return Err(ApiError::InvalidArgument("args must not be empty".into()));
    };
    if MUTATING_VERBS.contains(&first.to_ascii_lowercase().as_str()) {
        return Err(ApiError::InvalidArgument(format!(
            "'{first}' is a mutating verb and is not permitted for command_type '{}'",
            command_type.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_is_invalid() {
        assert!(validate_args(CommandType::Get, &[]).is_err());
    }

    #[test]
    fn mutating_verb_is_rejected() {
        let args = vec!["delete".to_string(), "pod/foo".to_string()];
        assert!(validate_args(CommandType::Get, &args).is_err());
    }

    #[test]
    fn resource_noun_is_accepted() {
        let args = vec!["pods".to_string(), "-A".to_string()];
        assert!(validate_args(CommandType::Get, &args).is_ok());
    }

    #[test]
    fn pod_name_is_accepted_for_logs() {
        let args = vec!["my-pod-abc123".to_string(), "-n".to_string(), "default".to_string()];
        assert!(validate_args(CommandType::Logs, &args).is_ok());
    }
}
