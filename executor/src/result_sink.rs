//! Posts a `CommandResult` back to `{api_url}/executor/results`, retrying
//! transient network errors with a full-jitter exponential backoff: a
//! 10s request timeout, a 10s backoff cap, and 3 attempts total.

use kubently_control_plane::models::CommandResult;
use tokio_util::sync::CancellationToken;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(10);
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

pub async fn post_result(
    http: &reqwest::Client,
    api_url: &str,
    token: &str,
    cluster_id: &str,
    result: &CommandResult,
    cancel: &CancellationToken,
) {
    let url = format!("{}/executor/results", api_url.trim_end_matches('/'));

    for attempt in 0..MAX_ATTEMPTS {
        let outcome = http
            .post(&url)
            .bearer_auth(token)
            .header("X-Cluster-ID", cluster_id)
            .timeout(REQUEST_TIMEOUT)
            .json(result)
            .send()
            .await;

        match outcome {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => {
                tracing::error!(command_id = %result.command_id, status = %resp.status(), "result submission rejected");
                return; // not a transient failure — retrying won't help
            }
            Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                tracing::warn!(command_id = %result.command_id, attempt, error = %e, "result submission failed, retrying");
                kubently_common::wait::wait_with_backoff(cancel, attempt, BACKOFF_CAP).await;
            }
            Err(e) => {
                tracing::error!(command_id = %result.command_id, error = %e, "result submission failed, giving up");
            }
        }
    }
}
