//! Shared scaffolding for the HTTP integration suite: assembles the same
//! router `main.rs` serves, against a real Redis instance (see DESIGN.md's
//! "integration test backing store" decision). Every test picks its own
//! random `cluster_id`/api key so tests can run concurrently against one
//! shared Redis without colliding.

use std::{collections::HashSet, sync::{Arc, Once}};

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use kubently_common::{cors, store::Store};
use kubently_control_plane::{
    a2a,
    app::AppState,
    args::ServerArgs,
    auth::{self, ApiKeyEntry, AuthConfig},
    dispatch, discovery, executor_stream, queue::CommandQueue, results, session::SessionManager,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static INIT: Once = Once::new();

pub const TEST_API_KEY: &str = "test-suite-key";
pub const READ_ONLY_API_KEY: &str = "read-only-key";

fn redis_url() -> String {
    std::env::var("TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

/// A freshly wired router plus its `AppState`, so a test can both send HTTP
/// requests and reach into `queue`/`executors` directly to stand in for a
/// real executor agent.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub async fn spawn() -> TestApp {
    INIT.call_once(|| {
        kubently_common::init();
    });

    let store = Store::connect(&redis_url())
        .await
        .expect("Redis must be reachable at TEST_REDIS_URL for the integration suite");

    let args = Arc::new(ServerArgs {
        redis: kubently_common::args::RedisArgs {
            redis_host: "127.0.0.1".into(),
            redis_port: 6379,
            redis_username: None,
            redis_password: None,
            redis_proto: "redis".into(),
            redis_db: 0,
        },
        port: 0,
        session_ttl_seconds: 300,
        dispatch_timeout_seconds: 30,
        stream_timeout_seconds: 300,
        in_flight_window: 8,
        max_pending_queue_depth: 1024,
        api_key_table_path: None,
        oidc_issuer: None,
        oidc_audience: None,
        oidc_jwks_url: None,
        jwks_cache_ttl_seconds: 600,
        device_authorization_endpoint: None,
        device_token_endpoint: None,
    });

    let mut api_keys = std::collections::HashMap::new();
    api_keys.insert(
        TEST_API_KEY.to_string(),
        ApiKeyEntry {
            identity: "integration-suite".to_string(),
            permissions: HashSet::from([
                kubently_control_plane::models::scopes::DEBUG_READ.to_string(),
                kubently_control_plane::models::scopes::DEBUG_EXECUTE.to_string(),
                kubently_control_plane::models::scopes::A2A_INVOKE.to_string(),
            ]),
        },
    );
    api_keys.insert(
        READ_ONLY_API_KEY.to_string(),
        ApiKeyEntry {
            identity: "read-only-suite".to_string(),
            permissions: HashSet::from([kubently_control_plane::models::scopes::DEBUG_READ.to_string()]),
        },
    );

    let auth_config = Arc::new(AuthConfig {
        api_keys: Arc::new(api_keys),
        oidc_issuer: None,
        oidc_audience: None,
        jwks_url: None,
        jwks_cache_ttl: std::time::Duration::from_secs(600),
        skip_list: AuthConfig::default_skip_list(),
    });

    let sessions = SessionManager::new(store.clone(), args.session_ttl_seconds);
    let queue = CommandQueue::new(store.clone(), args.max_pending_queue_depth);
    let shutdown = CancellationToken::new();
    let state = AppState::new(store, sessions, queue, auth_config.clone(), args.clone(), shutdown);

    let public_routes = Router::new()
        .route("/health", get(discovery::health))
        .route("/healthz", get(discovery::health))
        .route("/.well-known/kubently-auth", get(discovery::kubently_auth))
        .route("/a2a/", get(a2a::agent_card))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/debug/session", post(dispatch::create_session))
        .route("/debug/session/{id}", delete(dispatch::close_session))
        .route("/debug/execute", post(dispatch::execute))
        .route("/debug/clusters", get(dispatch::list_clusters))
        .route("/executor/stream", get(executor_stream::stream))
        .route("/executor/results", post(results::post_result))
        .route("/a2a/", post(a2a::rpc))
        .with_state(state.clone());

    let router = public_routes
        .merge(protected_routes)
        .layer(middleware::from_fn(kubently_common::access_log::public))
        .layer(auth::AuthLayer::new((*auth_config).clone()))
        .layer(cors::dev());

    TestApp { router, state }
}

pub fn unique_cluster_id(label: &str) -> String {
    format!("{label}-{}", Uuid::new_v4())
}
