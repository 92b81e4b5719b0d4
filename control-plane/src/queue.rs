//! Command queue: a per-cluster FIFO of pending commands plus a
//! per-command result rendezvous.
//!
//! The rendezvous (`command_id → result-waiter`) is a lock-guarded map of
//! broadcast senders (`kubently_common::rendezvous::Registry`), each
//! completed by a task that races an inbound Redis Pub/Sub notification
//! against cancellation via `tokio::select!`.
//!
//! A `result:{command_id}` key is also written on delivery so a waiter
//! that starts *after* delivery (the local registry races a Pub/Sub
//! round-trip with the store write) still observes the result — this
//! extends "duplicate delivery is a no-op" and "no command orphaned"
//! across control-plane instances, since the keyed store is the only
//! shared mutable state between them.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use kubently_common::{rendezvous::{Delivery, Registry}, store::Store};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::{Command, CommandResult},
};

/// Grace period a tombstone/late-result key is kept around for, beyond
/// the command's own timeout — bounds how long a straggling executor
/// Result can still be observed by a late subscriber without growing
/// unboundedly.
const RESULT_KEY_GRACE_SECS: u64 = 60;

fn pending_key(cluster_id: &str) -> String {
    format!("pending:{cluster_id}")
}

fn cmd_channel(cluster_id: &str) -> String {
    format!("cmd:{cluster_id}")
}

fn result_key(command_id: Uuid) -> String {
    format!("result:{command_id}")
}

fn result_channel(command_id: Uuid) -> String {
    format!("result:{command_id}")
}

fn tombstone_key(command_id: Uuid) -> String {
    format!("tombstone:{command_id}")
}

/// `command_id → cluster_id` the command was enqueued for, so the result
/// sink can reject a Result posted by an executor authenticated for a different
/// cluster. `CommandResult` carries no `cluster_id` of its own, so this
/// is the side table that makes that check possible.
fn owner_key(command_id: Uuid) -> String {
    format!("owner:{command_id}")
}

/// Grace period added on top of a command's own timeout for the owner
/// record, so a slow-arriving Result can still be validated.
const OWNER_KEY_GRACE_SECS: u64 = 60;

#[derive(Clone)]
pub struct CommandQueue {
    store: Store,
    registry: Arc<Registry<CommandResult>>,
    max_pending_queue_depth: i64,
}

impl CommandQueue {
    pub fn new(store: Store, max_pending_queue_depth: i64) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::new()),
            max_pending_queue_depth,
        }
    }

    /// `enqueue(cmd) → command_id`. Writes `pending:{cluster_id}`,
    /// publishes a wake-up on `cmd:{cluster_id}`.
    pub async fn enqueue(&self, cmd: &Command) -> ApiResult<Uuid> {
        let key = pending_key(&cmd.cluster_id);
        let depth = self.store.llen(&key).await?;
        if depth >= self.max_pending_queue_depth {
            return Err(ApiError::Unavailable(format!(
                "pending queue for cluster {} is full ({depth} >= {})",
                cmd.cluster_id, self.max_pending_queue_depth
            )));
        }
        let payload = serde_json::to_vec(cmd).map_err(|e| ApiError::Internal(e.into()))?;
        self.store.rpush(&key, &payload).await?;
        let owner_ttl = (cmd.timeout_ms / 1000).saturating_add(OWNER_KEY_GRACE_SECS).max(1);
        self.store
            .set_ex(&owner_key(cmd.command_id), cmd.cluster_id.as_bytes(), owner_ttl)
            .await?;
        self.store
            .publish(&cmd_channel(&cmd.cluster_id), cmd.command_id.to_string().as_bytes())
            .await?;
        Ok(cmd.command_id)
    }

    /// The cluster a pending/in-flight command was enqueued for, if it is
    /// still known. Used by the executor result sink to reject a
    /// Result whose poster is authenticated for a different cluster.
    pub async fn owner_cluster(&self, command_id: Uuid) -> ApiResult<Option<String>> {
        let bytes = self.store.get(&owner_key(command_id)).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// `await_result(command_id, timeout_ms) → Result | TimeoutError`.
    /// Blocks up to `timeout_ms`, cancellable via `cancel`.
    pub async fn await_result(
        &self,
        command_id: Uuid,
        timeout_ms: u64,
        cancel: &CancellationToken,
    ) -> ApiResult<CommandResult> {
        if let Some(existing) = self.take_stored_result(command_id).await? {
            return Ok(existing);
        }

        let mut rx = self.registry.register(command_id.to_string());
        let fanin = self.spawn_fanin(command_id);

        let timeout = tokio::time::sleep(Duration::from_millis(timeout_ms));
        tokio::pin!(timeout);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.registry.forget(&command_id.to_string());
                Err(ApiError::Cancelled)
            }
            delivered = rx.recv() => {
                match delivered {
                    Ok(delivery) => delivery
                        .into_result()
                        .map_err(|e| ApiError::Internal(anyhow::anyhow!(e))),
                    Err(_) => Err(ApiError::Internal(anyhow::anyhow!("rendezvous channel closed unexpectedly"))),
                }
            }
            _ = &mut timeout => {
                self.registry.forget(&command_id.to_string());
                let _ = self
                    .store
                    .set_ex(&tombstone_key(command_id), b"1", RESULT_KEY_GRACE_SECS)
                    .await;
                Ok(CommandResult::timeout(command_id))
            }
        };

        fanin.abort();
        outcome
    }

    /// `deliver(result)`: atomic from the caller's perspective — finds the
    /// matching rendezvous (local or, via Pub/Sub, on another instance)
    /// and completes it. A tombstoned or already-delivered command_id is
    /// a logged no-op (P1).
    pub async fn deliver(&self, result: CommandResult) -> ApiResult<()> {
        if self.store.get(&tombstone_key(result.command_id)).await?.is_some() {
            tracing::info!(command_id = %result.command_id, "discarding result for tombstoned/expired command");
            return Ok(());
        }

        let payload = serde_json::to_vec(&result).map_err(|e| ApiError::Internal(e.into()))?;
        let set = self
            .store
            .set_ex_nx(&result_key(result.command_id), &payload, RESULT_KEY_GRACE_SECS)
            .await?;
        if !set {
            tracing::info!(command_id = %result.command_id, "duplicate result delivery ignored");
            return Ok(());
        }

        self.registry
            .deliver(&result.command_id.to_string(), Delivery::ok(result.clone()));
        self.store
            .publish(&result_channel(result.command_id), &payload)
            .await?;
        Ok(())
    }

    /// `pop_next(cluster_id, wait_ms) → Command | null`. Atomic list pop:
    /// at most one caller across any number of connected executors for
    /// this cluster observes a given Command (I2).
    pub async fn pop_next(&self, cluster_id: &str, wait: Duration) -> ApiResult<Option<Command>> {
        let raw = self.store.blpop(&pending_key(cluster_id), wait).await?;
        raw.map(|bytes| serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into())))
            .transpose()
    }

    /// Requeue at the head — the "visibility timeout" pattern: a Command
    /// popped but not successfully transmitted to its executor goes back
    /// to the front of the line rather than the back.
    pub async fn requeue_head(&self, cmd: &Command) -> ApiResult<()> {
        let payload = serde_json::to_vec(cmd).map_err(|e| ApiError::Internal(e.into()))?;
        self.store.lpush(&pending_key(&cmd.cluster_id), &payload).await?;
        Ok(())
    }

    pub async fn pending_depth(&self, cluster_id: &str) -> ApiResult<i64> {
        Ok(self.store.llen(&pending_key(cluster_id)).await?)
    }

    async fn take_stored_result(&self, command_id: Uuid) -> ApiResult<Option<CommandResult>> {
        let Some(bytes) = self.store.get(&result_key(command_id)).await? else {
            return Ok(None);
        };
        let result: CommandResult =
            serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))?;
        let _ = self.store.delete(&result_key(command_id)).await;
        Ok(Some(result))
    }

    /// Spawn the per-waiter fan-in task: subscribes to this command's
    /// Redis Pub/Sub channel and relays any message into the local
    /// registry, so a Result delivered on a different control-plane
    /// instance still wakes this process's waiter.
    fn spawn_fanin(&self, command_id: Uuid) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut pubsub = match store.subscribe(&result_channel(command_id)).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(command_id = %command_id, error = %e, "failed to subscribe for result fan-in");
                    return;
                }
            };
            let mut stream = pubsub.on_message();
            if let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => return,
                };
                match serde_json::from_slice::<CommandResult>(&payload) {
                    Ok(result) => {
                        registry.deliver(&command_id.to_string(), Delivery::ok(result));
                    }
                    Err(e) => tracing::warn!(command_id = %command_id, error = %e, "malformed result on fan-in channel"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_cluster_and_command() {
        assert_eq!(pending_key("kind"), "pending:kind");
        assert_eq!(cmd_channel("kind"), "cmd:kind");
        let id = Uuid::nil();
        assert_eq!(result_key(id), format!("result:{id}"));
        assert_eq!(tombstone_key(id), format!("tombstone:{id}"));
    }
}
