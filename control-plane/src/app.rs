use std::{collections::HashMap, collections::HashSet, ops::Deref, sync::Arc};

use kubently_common::store::{Store, StoreResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{args::ServerArgs, auth::AuthConfig, queue::CommandQueue, session::SessionManager};

/// Serializes `message/send`/`message/stream` calls that share a
/// `contextId` so an earlier call's final event is always observed
/// before a later call's events begin. A lock-guarded map of per-context
/// async mutexes, handed out by reference-counted clone.
#[derive(Clone, Default)]
pub struct ContextLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ContextLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, context_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(context_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Key the keyed store under for the set of cluster_ids with at least one
/// connected executor (`GET /debug/clusters`). Membership is maintained on
/// connect/disconnect by the executor stream endpoint; this is a
/// rebuildable index over connection state, not authoritative data.
const CONNECTED_EXECUTORS_KEY: &str = "executors:connected";

#[derive(Clone)]
pub struct ExecutorRegistry {
    store: Store,
}

impl ExecutorRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn mark_connected(&self, cluster_id: &str) -> StoreResult<()> {
        self.store.sadd(CONNECTED_EXECUTORS_KEY, cluster_id).await
    }

    pub async fn mark_disconnected(&self, cluster_id: &str) -> StoreResult<()> {
        self.store.srem(CONNECTED_EXECUTORS_KEY, cluster_id).await
    }

    pub async fn connected_clusters(&self) -> StoreResult<HashSet<String>> {
        Ok(self
            .store
            .smembers(CONNECTED_EXECUTORS_KEY)
            .await?
            .into_iter()
            .collect())
    }
}

pub struct AppInner {
    pub store: Store,
    pub sessions: SessionManager,
    pub queue: CommandQueue,
    pub executors: ExecutorRegistry,
    pub auth_config: Arc<AuthConfig>,
    pub args: Arc<ServerArgs>,
    pub shutdown: CancellationToken,
    pub contexts: ContextLocks,
}

/// Shared application state. `Arc`-wrapped and `Deref`-exposed so handlers
/// can write `state.store` instead of `state.inner.store` while the type
/// itself stays cheap to clone into every `axum::Router::with_state` call
/// and background task.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppInner>,
}

impl Deref for AppState {
    type Target = AppInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl AppState {
    pub fn new(
        store: Store,
        sessions: SessionManager,
        queue: CommandQueue,
        auth_config: Arc<AuthConfig>,
        args: Arc<ServerArgs>,
        shutdown: CancellationToken,
    ) -> Self {
        let executors = ExecutorRegistry::new(store.clone());
        Self {
            inner: Arc::new(AppInner {
                store,
                sessions,
                queue,
                executors,
                auth_config,
                args,
                shutdown,
                contexts: ContextLocks::new(),
            }),
        }
    }
}
