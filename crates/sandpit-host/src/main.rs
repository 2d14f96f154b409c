//! sandpit-host: drives one sandpit session over stdio.
//!
//! Reads newline-delimited JSON-RPC 2.0 requests from stdin and writes
//! responses to stdout. Session and debugger events are written to stdout as
//! notifications (`session/event`, `debug/event`). Logs go to stderr.

mod config;
mod handler;
mod protocol;

use config::HostConfig;
use handler::handle_request;
use protocol::{error_codes, Notification, Request, Response};
use sandpit_core::{ScriptToolchain, SessionManager};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout is the protocol transport
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("sandpit_host=info".parse()?)
                .add_directive("sandpit_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("sandpit-host starting");

    let config = HostConfig::from_env();
    info!(?config, "Configuration loaded");
    config.validate_warn();

    let session = SessionManager::new(config.to_session_config()?, Arc::new(ScriptToolchain::new()));

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));
    let forwarders = [
        tokio::spawn(forward("session/event", session.subscribe(), out_tx.clone())),
        tokio::spawn(forward("debug/event", session.debug_events(), out_tx.clone())),
    ];

    let mut in_flight = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    debug!(request = %trimmed, "received request");
                    match serde_json::from_str::<Request>(trimmed) {
                        Ok(req) => {
                            let session = session.clone();
                            let out = out_tx.clone();
                            in_flight.spawn(async move {
                                let response = handle_request(&session, req).await;
                                send(&out, &response);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse request");
                            send(
                                &out_tx,
                                &Response::error(0, error_codes::PARSE_ERROR, format!("parse error: {}", e)),
                            );
                        }
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "failed to read stdin");
                    break;
                }
            },
        }
    }

    // Settles any running execution and drops pending requests
    session.shutdown().await;
    while in_flight.join_next().await.is_some() {}

    for forwarder in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    if let Err(e) = writer.await? {
        error!(error = %e, "failed to write stdout");
    }

    info!("sandpit-host stopped");
    Ok(())
}

/// Serialize `message` and queue it for stdout.
fn send<T: Serialize>(out: &mpsc::UnboundedSender<String>, message: &T) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = out.send(json);
        }
        Err(e) => error!(error = %e, "failed to serialize message"),
    }
}

/// Relay broadcast events as notifications until the channel closes.
async fn forward<E: Serialize + Clone>(
    method: &'static str,
    mut events: broadcast::Receiver<E>,
    out: mpsc::UnboundedSender<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_value(&event) {
                Ok(params) => send(&out, &Notification::new(method, params)),
                Err(e) => error!(error = %e, method, "failed to serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(method, skipped, "event consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Single writer for stdout so lines never interleave.
async fn write_lines(mut lines: mpsc::UnboundedReceiver<String>) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.recv().await {
        debug!(response = %line, "sending");
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}
