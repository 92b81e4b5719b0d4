//! Executor result sink: receives a `CommandResult` posted by an executor
//! and wakes the matching waiter registered in the command queue.

use axum::{Extension, Json, extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    executor_stream::cluster_id_header,
    models::{AuthContext, AuthMethod, CommandResult},
};

/// `POST /executor/results` — bearer token + `X-Cluster-ID`. Idempotent:
/// a duplicate Result for an already-delivered `command_id` is a no-op
/// (enforced by `CommandQueue::deliver`, P1).
pub async fn post_result(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
    Json(result): Json<CommandResult>,
) -> ApiResult<impl IntoResponse> {
    if auth.method != AuthMethod::BearerToken {
        return Err(ApiError::Unauthenticated(
            "executor result submission requires a bearer token".into(),
        ));
    }
    let posting_cluster = cluster_id_header(&headers)?;

    match state.queue.owner_cluster(result.command_id).await? {
        None => {
            // Already delivered, tombstoned/expired, or never enqueued by
            // this control-plane instance — either way there is nothing
            // left to validate the poster's cluster against. Let
            // `deliver` decide: a duplicate is a no-op, an unknown id is
            // logged and dropped.
            state.queue.deliver(result).await?;
        }
        Some(owner_cluster) if owner_cluster != posting_cluster => {
            return Err(ApiError::PermissionDenied(format!(
                "command belongs to cluster {owner_cluster}, not {posting_cluster}"
            )));
        }
        Some(_) => {
            state.queue.deliver(result).await?;
        }
    }

    Ok(StatusCode::OK)
}
