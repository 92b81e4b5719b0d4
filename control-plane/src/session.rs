//! Session manager: create, touch, look up, and close debug sessions.

use chrono::{Duration as ChronoDuration, Utc};
use kubently_common::store::Store;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::Session,
};

fn session_key(session_id: Uuid) -> String {
    format!("session:{session_id}")
}

fn hot_key(cluster_id: &str) -> String {
    format!("hot:{cluster_id}")
}

/// Index of live session ids per cluster, so `list_sessions` doesn't need
/// a `KEYS`/`SCAN` sweep. Membership here is advisory — entries for
/// TTL-expired sessions are pruned lazily in `list_sessions`, same as the
/// `hot` counter is advisory for executor behavior (I6: the session hash
/// itself remains the source of truth).
fn cluster_sessions_key(cluster_id: &str) -> String {
    format!("sessions:{cluster_id}")
}

#[derive(Clone)]
pub struct SessionManager {
    store: Store,
    default_ttl_secs: u64,
}

impl SessionManager {
    pub fn new(store: Store, default_ttl_secs: u64) -> Self {
        Self {
            store,
            default_ttl_secs,
        }
    }

    /// `create_session(cluster_id, identity, ttl) → session_id`.
    pub async fn create_session(
        &self,
        cluster_id: &str,
        identity: &str,
        ttl_secs: Option<u64>,
    ) -> ApiResult<Session> {
        let ttl_secs = ttl_secs.unwrap_or(self.default_ttl_secs);
        let now = Utc::now();
        let session = Session {
            session_id: Uuid::new_v4(),
            cluster_id: cluster_id.to_string(),
            identity: identity.to_string(),
            created_at: now,
            last_active: now,
            ttl_deadline: now + ChronoDuration::seconds(ttl_secs as i64),
        };
        let payload = serde_json::to_vec(&session).map_err(|e| ApiError::Internal(e.into()))?;
        self.store
            .set_ex(&session_key(session.session_id), &payload, ttl_secs)
            .await?;
        self.store.incr(&hot_key(cluster_id)).await?;
        self.store
            .sadd(&cluster_sessions_key(cluster_id), &session.session_id.to_string())
            .await?;
        Ok(session)
    }

    /// `touch(session_id)`: refreshes TTL; fails `SessionExpired` if the
    /// key is gone. Strictly increases `ttl_deadline` (P6).
    pub async fn touch(&self, session_id: Uuid) -> ApiResult<Session> {
        let mut session = self.get(session_id).await?;
        let now = Utc::now();
        session.last_active = now;
        session.ttl_deadline = now + ChronoDuration::seconds(self.default_ttl_secs as i64);
        let payload = serde_json::to_vec(&session).map_err(|e| ApiError::Internal(e.into()))?;
        let refreshed = self
            .store
            .set_ex(&session_key(session_id), &payload, self.default_ttl_secs)
            .await;
        match refreshed {
            Ok(()) => Ok(session),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, session_id: Uuid) -> ApiResult<Session> {
        let bytes = self
            .store
            .get(&session_key(session_id))
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("session {session_id} not found or expired")))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Internal(e.into()))
    }

    /// `close_session(session_id)`: deletes the key, decrements
    /// `hot:{cluster_id}` (never below 0).
    pub async fn close_session(&self, session_id: Uuid) -> ApiResult<()> {
        let session = self.get(session_id).await?;
        self.store.delete(&session_key(session_id)).await?;
        self.store.decr_floor0(&hot_key(&session.cluster_id)).await?;
        self.store
            .srem(&cluster_sessions_key(&session.cluster_id), &session_id.to_string())
            .await?;
        Ok(())
    }

    /// `list_sessions(cluster_id)`. Prunes ids whose session key has
    /// already TTL-expired out of the index as it goes.
    pub async fn list_sessions(&self, cluster_id: &str) -> ApiResult<Vec<Session>> {
        let ids = self.store.smembers(&cluster_sessions_key(cluster_id)).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for raw_id in ids {
            let Ok(id) = raw_id.parse::<Uuid>() else {
                continue;
            };
            match self.get(id).await {
                Ok(session) => sessions.push(session),
                Err(ApiError::NotFound(_)) => {
                    let _ = self.store.srem(&cluster_sessions_key(cluster_id), &raw_id).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    /// `is_hot(cluster_id) → bool`. Advisory only — correctness of
    /// command dispatch never depends on this.
    pub async fn is_hot(&self, cluster_id: &str) -> ApiResult<bool> {
        Ok(self.store.get_i64(&hot_key(cluster_id)).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(session_key(id), format!("session:{id}"));
        assert_eq!(hot_key("kind"), "hot:kind");
    }
}
