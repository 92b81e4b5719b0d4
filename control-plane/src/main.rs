use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use clap::Parser;
use kubently_common::{access_log, cors, shutdown::shutdown_signal, store::Store};
use kubently_control_plane::{
    a2a, app::AppState, args::ServerArgs, auth, discovery, dispatch, executor_stream, queue::CommandQueue,
    results, session::SessionManager,
};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    kubently_common::init();
    let args = ServerArgs::parse();
    kubently_common::metrics::maybe_spawn_metrics_server();

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    let store = Store::connect(&args.redis.url())
        .await
        .context("failed to connect to the keyed store")?;
    let sessions = SessionManager::new(store.clone(), args.session_ttl_seconds);
    let queue = CommandQueue::new(store.clone(), args.max_pending_queue_depth);
    let auth_config = Arc::new(build_auth_config(&args)?);
    let args = Arc::new(args);

    let state = AppState::new(store, sessions, queue, auth_config.clone(), args.clone(), shutdown.clone());

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
        .with_state(state);

    let app = public_routes
        .merge(protected_routes)
        .layer(middleware::from_fn(access_log::public))
        .layer(auth::AuthLayer::new((*auth_config).clone()))
        .layer(cors::dev());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("{}", format!("❌ Failed to bind server to {}: {}", addr, e).red());
            e
        })
        .context("failed to bind control-plane server")?;
    println!(
        "{}{}",
        "🚀 Starting kubently control plane • port=".green(),
        format!("{}", args.port).green().dimmed()
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("control-plane server failed")?;
    println!("{}", "🛑 Control plane stopped gracefully.".red());
    Ok(())
}

fn build_auth_config(args: &ServerArgs) -> Result<auth::AuthConfig> {
    let api_keys = match &args.api_key_table_path {
        Some(path) => auth::load_api_key_table(path)?,
        None => Default::default(),
    };
    let jwks_url = args.oidc_jwks_url.clone().or_else(|| {
        args.oidc_issuer
            .as_ref()
            .map(|issuer| format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')))
    });
    Ok(auth::AuthConfig {
        api_keys: Arc::new(api_keys),
        oidc_issuer: args.oidc_issuer.clone(),
        oidc_audience: args.oidc_audience.clone(),
        jwks_url,
        jwks_cache_ttl: std::time::Duration::from_secs(args.jwks_cache_ttl_seconds),
        skip_list: auth::AuthConfig::default_skip_list(),
    })
}
