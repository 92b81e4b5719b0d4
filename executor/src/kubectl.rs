//! Subprocess runner for `kubectl`: combined stdout+stderr, a 30s
//! wall-clock timeout, and the SUCCESS/FAILED/TIMEOUT/ERROR status
//! vocabulary.

use std::time::{Duration, Instant};

use kubently_control_plane::models::{CommandResult, ResultStatus};
use uuid::Uuid;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(command_id: Uuid, kubectl_path: &str, args: &[String]) -> CommandResult {
    let started = Instant::now();
    let executed_at = chrono::Utc::now();

    let child = match tokio::process::Command::new(kubectl_path)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        // dropping the future on timeout must kill the subprocess, not
        // just stop waiting on it
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            return error_result(command_id, executed_at, started.elapsed(), format!("failed to spawn kubectl: {e}"));
        }
    };

    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return error_result(command_id, executed_at, started.elapsed(), format!("kubectl execution failed: {e}"));
        }
        Err(_) => {
            return CommandResult {
                command_id,
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                output: String::new(),
                return_code: -1,
                status: ResultStatus::Timeout,
                executed_at,
                execution_time_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let return_code = output.status.code().unwrap_or(-1);
    let success = output.status.success();

    CommandResult {
        command_id,
        success,
        output: CommandResult::combine_output(&stdout, &stderr),
        stdout,
        stderr,
        return_code,
        status: if success { ResultStatus::Success } else { ResultStatus::Failed },
        executed_at,
        execution_time_ms: started.elapsed().as_millis() as u64,
    }
}

fn error_result(command_id: Uuid, executed_at: chrono::DateTime<chrono::Utc>, elapsed: Duration, message: String) -> CommandResult {
    tracing::error!(%command_id, error = %message, "kubectl invocation failed");
    CommandResult {
        command_id,
        success: false,
        stdout: String::new(),
        stderr: message,
        output: String::new(),
        return_code: -1,
        status: ResultStatus::Error,
        executed_at,
        execution_time_ms: elapsed.as_millis() as u64,
    }
}
