//! Carriers delivering JSON-RPC messages to the [`ProtocolHandler`].

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{list_changed_notification, Incoming, ProtocolHandler, RpcResponse};
use crate::registry::CatalogEvent;

// ==================== stdio ====================

/// Serve line-delimited JSON-RPC on stdin/stdout until EOF
pub async fn serve_stdio(handler: Arc<ProtocolHandler>) -> anyhow::Result<()> {
    serve_lines(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve line-delimited JSON-RPC over any reader/writer pair.
///
/// Messages are handled in arrival order, except `tools/call` which runs
/// concurrently so a later `notifications/cancelled` can reach it.
/// In-flight calls are drained once the reader hits EOF.
pub async fn serve_lines<R, W>(
    handler: Arc<ProtocolHandler>,
    reader: R,
    writer: W,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, rx));
    let stop_notifier = CancellationToken::new();
    let notifier = tokio::spawn(forward_list_changes(
        handler.clone(),
        handler.composer().registry().subscribe(),
        tx.clone(),
        stop_notifier.clone(),
    ));

    info!("MCP server ready, waiting for requests...");

    let mut calls = JoinSet::new();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let outcome = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e),
        }
        let line = trim_line(&buf);
        if line.is_empty() {
            continue;
        }
        debug!("← {}", String::from_utf8_lossy(line));

        match Incoming::parse(line) {
            Err(response) => send(&tx, &response),
            Ok(message) if message.is_tool_call() => {
                let handler = handler.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    if let Some(response) = handler.handle(message).await {
                        send(&tx, &response);
                    }
                });
            }
            Ok(message) => {
                if let Some(response) = handler.handle(message).await {
                    send(&tx, &response);
                }
            }
        }

        while calls.try_join_next().is_some() {}
    };

    match &outcome {
        Ok(()) => info!("Client disconnected (EOF)"),
        Err(e) => error!(error = %e, "Input stream failed"),
    }
    while calls.join_next().await.is_some() {}

    stop_notifier.cancel();
    let _ = notifier.await;
    drop(tx);
    writer_task.await??;
    outcome?;
    Ok(())
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) => &line[start..=end],
        _ => &[],
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            debug!("→ {}", line);
            if tx.send(line).is_err() {
                warn!("Output closed; dropping response");
            }
        }
        Err(e) => error!(error = %e, "Failed to serialize response"),
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Emit `notifications/tools/list_changed` whenever the catalogue mutates
/// after the client initialized. Events already queued are flushed before
/// `stop` is honoured.
async fn forward_list_changes(
    handler: Arc<ProtocolHandler>,
    mut events: broadcast::Receiver<CatalogEvent>,
    tx: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = stop.cancelled() => break,
        };
        match event {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                if !handler.is_initialized() {
                    continue;
                }
                if tx.send(list_changed_notification().to_string()).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

// ==================== HTTP ====================

/// `POST /mcp` takes one JSON-RPC message per body; `GET /health` reports
/// liveness and catalogue size
pub fn router(handler: Arc<ProtocolHandler>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/health", get(health_handler))
        .with_state(handler)
}

async fn mcp_handler(State(handler): State<Arc<ProtocolHandler>>, body: Bytes) -> Response {
    match handler.handle_raw(&body).await {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn health_handler(State(handler): State<Arc<ProtocolHandler>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "skills": handler.composer().registry().len(),
    }))
}

/// Serve the HTTP transport until Ctrl+C / SIGTERM
pub async fn serve_http(handler: Arc<ProtocolHandler>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP transport listening on /mcp");

    axum::serve(listener, router(handler))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP transport shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
