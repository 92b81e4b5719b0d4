//! Executor agent: connects to the control plane's SSE command stream,
//! runs each Command through `kubectl`, and posts the Result back. The
//! split between a stream-reading task and a dedicated command-running
//! task, joined by a bounded channel, keeps a slow `kubectl` invocation
//! from ever stalling SSE keepalive handling.

mod args;
mod kubectl;
mod result_sink;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use kubently_common::shutdown::shutdown_signal;
use kubently_control_plane::models::Command;
use owo_colors::OwoColorize;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use args::ExecutorArgs;

/// Delay before reconnecting after the SSE stream drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Bounded so a burst of commands can't grow executor memory unboundedly;
/// the control plane's own in-flight window (default 8) is the real
/// backpressure point, this is just a local cushion.
const COMMAND_CHANNEL_CAPACITY: usize = 32;
/// Consecutive failed connection attempts tolerated before giving up with
/// exit code 2. Reset to 0 on any connection that reaches `Event::Open`.
const MAX_CONSECUTIVE_CONNECT_FAILURES: u32 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    // LOG_LEVEL is this agent's documented knob; RUST_LOG (read by
    // kubently_common::init's EnvFilter) takes precedence if also set.
    if std::env::var("RUST_LOG").is_err()
        && let Ok(level) = std::env::var("LOG_LEVEL")
    {
        unsafe { std::env::set_var("RUST_LOG", level) };
    }
    kubently_common::init();
    let args = ExecutorArgs::parse();

    let http = build_http_client(&args).unwrap_or_else(|e| {
        eprintln!("{}", format!("❌ failed to build HTTP client: {e}").red());
        std::process::exit(1); // fatal configuration error, e.g. unreadable CA bundle
    });

    if args.api_url.starts_with("http://") && args.ssl_verify {
        tracing::warn!("using HTTP without TLS — this should only be used for local development");
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });

    let (tx, rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_CAPACITY);
    let worker = tokio::spawn(worker_main(cancel.clone(), http.clone(), args.clone(), rx));

    println!(
        "{}{}",
        "🤖 kubently executor starting • cluster_id=".green(),
        args.cluster_id.green().dimmed()
    );

    let mut consecutive_failures: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let (opened, err) = connect_and_stream(&http, &args, &tx, &cancel).await;
        if let Some(e) = err {
            tracing::error!(error = %e, "SSE connection error");
        }
        if opened {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
        }
        if cancel.is_cancelled() {
            break;
        }
        if consecutive_failures >= MAX_CONSECUTIVE_CONNECT_FAILURES {
            eprintln!(
                "{}",
                format!(
                    "❌ giving up after {consecutive_failures} consecutive failed connection attempts"
                )
                .red()
            );
            drop(tx);
            let _ = worker.await;
            std::process::exit(2); // unrecoverable transport error after retry budget
        }
        tracing::info!("reconnecting in {RECONNECT_DELAY:?}");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    drop(tx);
    let _ = worker.await;
    println!("{}", "🛑 kubently executor stopped gracefully.".red());
    Ok(())
}

fn build_http_client(args: &ExecutorArgs) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(!args.ssl_verify);
    if let Some(ca_path) = &args.ca_cert {
        let pem = std::fs::read(ca_path)?;
        let cert = reqwest::Certificate::from_pem(&pem)?;
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder.build()?)
}

/// Returns whether the connection reached `Event::Open` at any point before
/// closing or erroring, plus the error if one ended the attempt. A
/// connection that opens and is later dropped still counts as "opened" —
/// only a run of attempts that never open at all burns the retry budget.
async fn connect_and_stream(
    http: &reqwest::Client,
    args: &ExecutorArgs,
    tx: &mpsc::Sender<Command>,
    cancel: &CancellationToken,
) -> (bool, Option<anyhow::Error>) {
    let url = format!("{}/executor/stream", args.api_url.trim_end_matches('/'));
    tracing::info!(%url, "connecting to SSE endpoint");

    let request = http
        .get(&url)
        .bearer_auth(&args.token)
        .header("X-Cluster-ID", &args.cluster_id);
    let mut source = match EventSource::new(request) {
        Ok(s) => s,
        Err(e) => return (false, Some(e.into())),
    };
    let mut opened = false;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return (opened, None),
            next = source.next() => next,
        };
        let Some(event) = next else {
            return (opened, None); // stream closed cleanly
        };
        match event {
            Ok(Event::Open) => {
                tracing::debug!("SSE connection established");
                opened = true;
            }
            Ok(Event::Message(msg)) => handle_event(&msg.event, &msg.data, tx).await,
            Err(e) => {
                source.close();
                return (opened, Some(e.into()));
            }
        }
    }
}

async fn handle_event(event: &str, data: &str, tx: &mpsc::Sender<Command>) {
    match event {
        "connected" => tracing::info!(payload = %data, "connected to control plane"),
        "keepalive" => tracing::debug!("keepalive received"),
        "command" => match serde_json::from_str::<Command>(data) {
            Ok(command) => {
                tracing::info!(command_id = %command.command_id, "received command");
                if tx.send(command).await.is_err() {
                    tracing::error!("command worker channel closed, dropping command");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to parse command event"),
        },
        other => tracing::debug!(event = other, "ignoring unrecognized SSE event"),
    }
}

/// Dedicated task owning all `kubectl` subprocess work and result
/// submission, so a slow invocation never blocks the SSE reader.
async fn worker_main(
    cancel: CancellationToken,
    http: reqwest::Client,
    args: ExecutorArgs,
    mut rx: mpsc::Receiver<Command>,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => return,
            command = rx.recv() => match command {
                Some(c) => c,
                None => return,
            },
        };

        let result = kubectl::run(command.command_id, &args.kubectl_path, &command.args).await;
        result_sink::post_result(&http, &args.api_url, &args.token, &command.cluster_id, &result, &cancel).await;
    }
}
