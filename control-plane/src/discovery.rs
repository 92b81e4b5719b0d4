//! `.well-known/kubently-auth` — a read-only discovery document pointing
//! the CLI at the external OAuth provider's device-authorization and
//! token endpoints. The control plane never mints tokens itself; the
//! device-code/token exchange lives entirely in the external provider.

use axum::{Json, extract::State, response::IntoResponse};

use crate::app::AppState;

pub async fn kubently_auth(State(state): State<AppState>) -> impl IntoResponse {
    let mut authentication_methods = vec!["api_key"];
    if state.auth_config.jwks_url.is_some() {
        authentication_methods.push("bearer_token");
    }

    let oauth = match (
        &state.args.device_authorization_endpoint,
        &state.args.device_token_endpoint,
    ) {
        (Some(device_authorization_endpoint), Some(token_endpoint)) => Some(serde_json::json!({
            "device_authorization_endpoint": device_authorization_endpoint,
            "token_endpoint": token_endpoint,
        })),
        _ => None,
    };

    Json(serde_json::json!({
        "authentication_methods": authentication_methods,
        "oauth": oauth,
    }))
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}
