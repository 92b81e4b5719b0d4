//! Executor stream endpoint: a long-lived server-push channel delivering
//! commands to a connected executor.
//!
//! The wire format is Server-Sent Events (`event:`/`data:` framing, named
//! events `connected`/`command`/`keepalive`), handled by an Axum SSE
//! handler (`axum::response::sse`). The task shape — a dedicated sender
//! task, a bounded in-flight window, requeue on write failure — keeps
//! `kubectl` subprocess latency on the executor side from ever blocking
//! this endpoint's own event loop.

use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Extension,
    extract::State,
    http::HeaderMap,
    response::sse::{Event, Sse},
};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::{
    app::AppState,
    error::{ApiError, ApiResult},
    models::{AuthContext, AuthMethod, Command},
};

/// How often a `keepalive` event is emitted while the queue is idle.
/// Must be comfortably inside the idle timeout a reverse proxy or load
/// balancer typically enforces on a long-lived connection.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// How long a single `pop_next` long-poll waits before the producer loop
/// re-checks for a keepalive / disconnect.
const POP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Opening,
    Connected,
    Draining,
    Idle,
    Closing,
    Closed,
}

pub(crate) fn cluster_id_header(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get("x-cluster-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::InvalidArgument("missing X-Cluster-ID header".into()))
}

pub async fn stream(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
) -> ApiResult<Sse<ReceiverStream<Result<Event, Infallible>>>> {
    if auth.method != AuthMethod::BearerToken {
        return Err(ApiError::Unauthenticated(
            "executor connections require a bearer token".into(),
        ));
    }
    let cluster_id = cluster_id_header(&headers)?;

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(connection_task(state, cluster_id, tx));
    Ok(Sse::new(ReceiverStream::new(rx)))
}

#[derive(Serialize)]
struct Connected {
    cluster_id: String,
    server_id: String,
    now: chrono::DateTime<Utc>,
    /// Advisory only (I6 / spec §4.2): a hint the executor MAY use to pick
    /// a faster polling/backoff strategy. Dispatch correctness never
    /// depends on it.
    hot: bool,
}

#[derive(Serialize)]
struct Keepalive {
    now: chrono::DateTime<Utc>,
}

fn json_event(name: &'static str, payload: impl Serialize) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event(name)
        .data(serde_json::to_string(&payload).unwrap_or_default()))
}

async fn connection_task(state: AppState, cluster_id: String, tx: mpsc::Sender<Result<Event, Infallible>>) {
    let mut conn_state = ConnState::Opening;
    let server_id = std::env::var("SERVER_ID").unwrap_or_else(|_| "kubently-control-plane".into());

    if let Err(e) = state.executors.mark_connected(&cluster_id).await {
        tracing::warn!(%cluster_id, error = %e, "failed to record executor connection");
    }
    let hot = state.sessions.is_hot(&cluster_id).await.unwrap_or(false);

    if tx
        .send(json_event(
            "connected",
            Connected {
                cluster_id: cluster_id.clone(),
                server_id,
                now: Utc::now(),
                hot,
            },
        ))
        .await
        .is_err()
    {
        return; // client gone before we even said hello
    }
    conn_state = ConnState::Connected;
    tracing::debug!(%cluster_id, ?conn_state, "executor stream connected");

    let semaphore = Arc::new(Semaphore::new(state.args.in_flight_window));
    let (done_tx, mut done_rx) = mpsc::channel::<Uuid>(state.args.in_flight_window.max(1));
    let mut in_flight: HashMap<Uuid, Command> = HashMap::new();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            biased;

            _ = tx.closed() => {
                conn_state = ConnState::Closing;
                break;
            }

            Some(completed) = done_rx.recv() => {
                in_flight.remove(&completed);
            }

            _ = keepalive.tick() => {
                if tx.send(json_event("keepalive", Keepalive { now: Utc::now() })).await.is_err() {
                    conn_state = ConnState::Closing;
                    break;
                }
            }

            permit = semaphore.clone().acquire_owned(), if in_flight.len() < state.args.in_flight_window => {
                let Ok(permit) = permit else { continue };
                conn_state = ConnState::Draining;
                match state.queue.pop_next(&cluster_id, POP_WAIT).await {
                    Ok(Some(command)) => {
                        match tx.send(json_event("command", &command)).await {
                            Ok(()) => {
                                in_flight.insert(command.command_id, command.clone());
                                spawn_completion_watcher(state.clone(), command, permit, done_tx.clone());
                            }
                            Err(_) => {
                                drop(permit);
                                if let Err(e) = state.queue.requeue_head(&command).await {
                                    tracing::error!(command_id = %command.command_id, error = %e, "failed to requeue command on write failure");
                                }
                                conn_state = ConnState::Closing;
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        drop(permit);
                        conn_state = ConnState::Idle;
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::warn!(%cluster_id, error = %e, "pop_next failed");
                    }
                }
            }
        }
    }

    conn_state = ConnState::Closed;
    tracing::debug!(%cluster_id, ?conn_state, in_flight = in_flight.len(), "executor stream closed");

    for command in in_flight.into_values() {
        if let Err(e) = state.queue.requeue_head(&command).await {
            tracing::error!(command_id = %command.command_id, error = %e, "failed to requeue in-flight command on disconnect");
        }
    }
    if let Err(e) = state.executors.mark_disconnected(&cluster_id).await {
        tracing::warn!(%cluster_id, error = %e, "failed to clear executor connection record");
    }
}

/// Holds `permit` until this command's rendezvous resolves (either a real
/// Result arrives via the executor result sink, or it times out), then reports back on
/// `done_tx` so the producer loop drops it from the in-flight set and the
/// window frees up for the next `pop_next`.
fn spawn_completion_watcher(
    state: AppState,
    command: Command,
    permit: tokio::sync::OwnedSemaphorePermit,
    done_tx: mpsc::Sender<Uuid>,
) {
    tokio::spawn(async move {
        let _permit = permit;
        let _ = state
            .queue
            .await_result(command.command_id, command.timeout_ms, &state.shutdown)
            .await;
        let _ = done_tx.send(command.command_id).await;
    });
}
