use clap::Parser;

/// Configuration for the in-cluster executor agent, sourced from
/// environment variables or flags.
#[derive(Parser, Debug, Clone)]
pub struct ExecutorArgs {
    /// Base URL of the control plane, e.g. `https://kubently.example.com`.
    #[arg(long, env = "KUBENTLY_API_URL")]
    pub api_url: String,

    /// This executor's cluster identity, sent as `X-Cluster-ID`.
    #[arg(long, env = "CLUSTER_ID")]
    pub cluster_id: String,

    /// Bearer token presented on every request to the control plane.
    #[arg(long, env = "KUBENTLY_TOKEN")]
    pub token: String,

    /// Verify the control plane's TLS certificate. Disabling this is for
    /// local development only (the source logs a warning in the same
    /// case); never disable it against a real deployment.
    #[arg(long, env = "KUBENTLY_SSL_VERIFY", default_value_t = true)]
    pub ssl_verify: bool,

    /// Path to a PEM bundle used in place of the system trust store.
    #[arg(long, env = "KUBENTLY_CA_CERT")]
    pub ca_cert: Option<String>,

    /// kubectl binary to invoke. Overridable for tests.
    #[arg(long, env = "KUBECTL_PATH", default_value = "kubectl")]
    pub kubectl_path: String,
}
