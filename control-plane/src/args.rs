use clap::Parser;
use kubently_common::args::RedisArgs;

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    #[clap(flatten)]
    pub redis: RedisArgs,

    /// Public-facing listen port: /debug/*, /executor/*, /a2a/*, /.well-known/*
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Default session TTL in seconds.
    #[arg(long, env = "SESSION_TTL_SECONDS", default_value_t = 300)]
    pub session_ttl_seconds: u64,

    /// Default deadline for POST /debug/execute when the caller omits
    /// `timeout_seconds`.
    #[arg(long, env = "DISPATCH_TIMEOUT_SECONDS", default_value_t = 30)]
    pub dispatch_timeout_seconds: u64,

    /// Default deadline for a `message/stream` call / a2a session.
    #[arg(long, env = "STREAM_TIMEOUT_SECONDS", default_value_t = 300)]
    pub stream_timeout_seconds: u64,

    /// Per-connection bounded in-flight command window on the executor
    /// stream endpoint.
    #[arg(long, env = "EXECUTOR_IN_FLIGHT_WINDOW", default_value_t = 8)]
    pub in_flight_window: usize,

    /// Per-cluster pending-queue depth before `RESOURCE_EXHAUSTED`.
    #[arg(long, env = "MAX_PENDING_QUEUE_DEPTH", default_value_t = 1024)]
    pub max_pending_queue_depth: i64,

    /// Path to a JSON file mapping API keys to `{identity, permissions}`.
    #[arg(long, env = "API_KEY_TABLE_PATH")]
    pub api_key_table_path: Option<String>,

    /// OIDC issuer used to validate bearer tokens' `iss` claim.
    #[arg(long, env = "OIDC_ISSUER")]
    pub oidc_issuer: Option<String>,

    /// Expected `aud` claim on bearer tokens.
    #[arg(long, env = "OIDC_AUDIENCE")]
    pub oidc_audience: Option<String>,

    /// JWKS document URL. Defaults to `{issuer}/.well-known/jwks.json`
    /// when unset but `oidc_issuer` is.
    #[arg(long, env = "OIDC_JWKS_URL")]
    pub oidc_jwks_url: Option<String>,

    /// JWKS cache TTL in seconds.
    #[arg(long, env = "JWKS_CACHE_TTL_SECONDS", default_value_t = 600)]
    pub jwks_cache_ttl_seconds: u64,

    /// External OAuth provider's device-authorization endpoint, advertised
    /// at `/.well-known/kubently-auth`. The core never mints tokens itself.
    #[arg(long, env = "DEVICE_AUTHORIZATION_ENDPOINT")]
    pub device_authorization_endpoint: Option<String>,

    /// External OAuth provider's token endpoint, advertised alongside the
    /// device-authorization endpoint.
    #[arg(long, env = "DEVICE_TOKEN_ENDPOINT")]
    pub device_token_endpoint: Option<String>,
}
