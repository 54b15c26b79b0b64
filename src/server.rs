//! Development server: serves the project root and pushes live-reload
//! messages to connected pages over a WebSocket.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    reload::{ReloadHub, ReloadMessage},
    task::config::ServerConfig,
};

pub const SOCKET_PATH: &str = "/__assetline/ws";
pub const CLIENT_SCRIPT_PATH: &str = "/__assetline/client.js";

const CLIENT_SCRIPT: &str = include_str!("client.js");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const MAX_HTML_BYTES: usize = 16 * 1024 * 1024;

struct AppState {
    hub: ReloadHub,
}

pub struct DevServer;

impl DevServer {
    /// Live-reload endpoints, with every other path served from `root`.
    pub fn router(root: PathBuf, hub: ReloadHub) -> Router {
        let files = Router::new()
            .fallback_service(ServeDir::new(root))
            .layer(middleware::map_response(prepare_file_response));

        Router::new()
            .route(SOCKET_PATH, get(socket_handler))
            .route(CLIENT_SCRIPT_PATH, get(client_script))
            .fallback_service(files)
            .with_state(Arc::new(AppState { hub }))
    }

    /// Binds the listener and starts serving in the background. The server
    /// runs until the returned handle is shut down or dropped.
    pub async fn start(config: &ServerConfig, root: PathBuf, hub: ReloadHub) -> Result<DevServerHandle> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| PipelineError::Server(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!("Serving {} at http://{}", root.display(), local_addr);

        let app = Self::router(root, hub);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(DevServerHandle {
            local_addr,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// A running dev server. Dropping the handle signals shutdown.
pub struct DevServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl DevServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for in-flight requests,
    /// aborting the server if it does not finish within the grace period.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let abort = task.abort_handle();

        match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
            Ok(Ok(Ok(()))) => {
                info!("Dev server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(PipelineError::Server(e.to_string())),
            Ok(Err(e)) => Err(PipelineError::Server(e.to_string())),
            Err(_) => {
                warn!("Dev server did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                abort.abort();
                Ok(())
            }
        }
    }
}

impl Drop for DevServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn client_script() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        CLIENT_SCRIPT,
    )
}

async fn socket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let updates = state.hub.subscribe();
    debug!(
        "Live-reload client connected ({} subscribed)",
        state.hub.client_count()
    );
    ws.on_upgrade(move |socket| handle_socket(socket, updates))
}

async fn handle_socket(socket: WebSocket, mut updates: broadcast::Receiver<ReloadMessage>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => {
                let message = match update {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Live-reload client lagged by {} message(s), forcing reload", skipped);
                        ReloadMessage::Reload
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Live-reload client disconnected");
}

/// Marks every file response uncacheable and adds the live-reload client to
/// complete HTML documents.
async fn prepare_file_response(response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let is_html = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html"));
    if parts.status != StatusCode::OK || !is_html {
        return Response::from_parts(parts, body);
    }

    let bytes = match to_bytes(body, MAX_HTML_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read HTML response: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    parts.headers.remove(header::CONTENT_LENGTH);
    let html = inject_client(&String::from_utf8_lossy(&bytes));
    Response::from_parts(parts, Body::from(html))
}

/// Adds the live-reload client before the closing body tag, or at the end
/// of documents without one.
pub fn inject_client(html: &str) -> String {
    let tag = format!(r#"<script src="{}" async></script>"#, CLIENT_SCRIPT_PATH);

    match html.to_ascii_lowercase().rfind("</body>") {
        Some(index) => {
            let mut injected = String::with_capacity(html.len() + tag.len());
            injected.push_str(&html[..index]);
            injected.push_str(&tag);
            injected.push_str(&html[index..]);
            injected
        }
        None => format!("{}{}", html, tag),
    }
}
