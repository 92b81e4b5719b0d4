use axum::{Json, response::IntoResponse};
use http::StatusCode;

pub mod args;
pub mod cors;
pub mod metrics;
pub mod rendezvous;
mod request_context;
pub mod shutdown;
pub mod store;
pub mod wait;

pub use request_context::*;

/// Process-wide init: colored output override, tracing subscriber, and the
/// rustls crypto provider that both `redis`'s `tls-rustls` feature and
/// `reqwest`'s `rustls-tls` feature rely on but don't install themselves.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);

    init_tracing();
    install_rustls_provider();
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

pub fn install_rustls_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("install aws-lc-rs provider");
}

pub mod response {
    use std::fmt::{Debug, Display};

    use anyhow::Error;
    use axum::response::Response;

    use super::*;

    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let reason = format!("{}", e);
        let err = e.into();
        tracing::error!(error = %err, status = %code, "request failed");
        (code, Json(serde_json::json!({"reason": reason}))).into_response()
    }

    pub fn not_found<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::NOT_FOUND)
    }

    pub fn too_many_requests<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn conflict<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::CONFLICT)
    }

    pub fn internal_server_error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_gateway<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_GATEWAY)
    }

    pub fn bad_request<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_REQUEST)
    }

    pub fn forbidden<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::FORBIDDEN)
    }

    pub fn unauthorized<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::UNAUTHORIZED)
    }

    pub fn service_unavailable<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub mod access_log {
    use std::net::IpAddr;

    use axum::http::HeaderMap;
    use http::StatusCode;
    use uuid::Uuid;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("public", req, next).await
    }

    pub async fn internal(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("internal", req, next).await
    }

    async fn request(
        surface: &'static str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        let ip = get_source_ip(req.headers())
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let request_id = req
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .unwrap_or_else(Uuid::new_v4);
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();
        let status = response.status();
        let is_success = status.is_success() || status == StatusCode::SWITCHING_PROTOCOLS;
        if is_success {
            tracing::info!(
                surface, %method, %path, %status, %request_id, elapsed_ms = elapsed.as_millis() as u64, client_ip = %ip,
                "request completed"
            );
        } else {
            // correlation id for the error taxonomy's "Internal ... logged
            // with correlation id" requirement
            tracing::warn!(
                surface, %method, %path, %status, %request_id, elapsed_ms = elapsed.as_millis() as u64, client_ip = %ip,
                "request failed"
            );
        }
        if let Ok(value) = request_id.to_string().parse() {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }

    pub fn get_source_ip(headers: &HeaderMap) -> Option<IpAddr> {
        if let Some(forwarded_for) = headers.get("x-forwarded-for")
            && let Ok(forwarded_for) = forwarded_for.to_str()
            && let Some(ip_str) = forwarded_for.split(',').next()
            && let Ok(ip) = ip_str.trim().parse()
        {
            return Some(ip);
        }

        if let Some(real_ip) = headers.get("x-real-ip")
            && let Ok(ip_str) = real_ip.to_str()
            && let Ok(ip) = ip_str.trim().parse()
        {
            return Some(ip);
        }

        None
    }
}
