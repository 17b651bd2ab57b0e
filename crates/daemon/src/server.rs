//! HTTP and WebSocket endpoints.
//!
//! Three routes, all behind the token middleware:
//!
//! - `GET /ws/ping` answers 204 so clients can check reachability and token.
//! - `GET /ws/connect` upgrades to the WebSocket session.
//! - `GET /ws/debug` dumps process state as JSON.
//!
//! The listener serves plain HTTP via `axum::serve`, or TLS through a
//! `tokio-rustls` accept loop feeding hyper's connection builder.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use protocol::TransferOptions;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::require_token;
use crate::config::Config;
use crate::files::SessionRoot;
use crate::network::WebSocketChannel;
use crate::router::{DispatchContext, MessageRouter};
use crate::status::Status;
use crate::tls;

/// Body returned when `/ws/connect` is hit without an upgrade.
pub const UPGRADE_EXPECTED: &str = "Web socket request expected.";

/// Shared state for all handlers.
#[derive(Debug)]
pub struct AppState {
    /// The pre-shared token every request must present.
    pub token: String,
    pub router: MessageRouter,
    pub config: Config,
}

impl AppState {
    /// Builds the state for serving `config`: resolves and canonicalizes the
    /// root and creates the process counters.
    pub fn new(config: Config, token: String) -> Result<Self> {
        let root_dir = config.root_dir()?;
        let root = SessionRoot::new(&root_dir)
            .with_context(|| format!("Cannot serve {}", root_dir.display()))?;
        let transfer = TransferOptions {
            chunk_size: config.transfer.chunk_size,
            max_bytes_per_second: config.bytes_per_second_limit(),
        };
        let context = DispatchContext::new(root, Arc::new(Status::new()), transfer);

        Ok(Self {
            token,
            router: MessageRouter::new(Arc::new(context)),
            config,
        })
    }

    pub fn status(&self) -> &Status {
        &self.router.context().status
    }
}

/// Builds the axum router with auth and request tracing.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/ping", get(ping))
        .route("/ws/connect", get(connect))
        .route("/ws/debug", get(debug_info))
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn connect(
    State(state): State<Arc<AppState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!(error = %rejection, "Rejected non-upgrade connect request");
            return (StatusCode::BAD_REQUEST, UPGRADE_EXPECTED).into_response();
        }
    };

    let router = state.router.clone();
    upgrade.on_upgrade(move |socket| async move {
        router.run(WebSocketChannel::new(socket)).await;
    })
}

async fn debug_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let context = state.router.context();
    let environment: BTreeMap<String, String> = std::env::vars().collect();
    let working_directory = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    Json(json!({
        "WorkingDirectory": working_directory,
        "Root": context.root.path().display().to_string(),
        "Options": {
            "Host": state.config.server.host,
            "Port": state.config.server.port,
            "Token": "<redacted>",
            "BytesPerSecondLimit": context.transfer.max_bytes_per_second,
            "ChunkSize": context.transfer.chunk_size,
            "Tls": state.config.tls.paths().is_some(),
        },
        "Status": state.status().snapshot(),
        "Environment": environment,
    }))
}

/// A bound listener ready to serve.
pub struct Server {
    listener: TcpListener,
    state: Arc<AppState>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Binds the configured address.
    pub async fn bind(config: Config, token: String) -> Result<Self> {
        let addr = config.listen_addr();
        Self::bind_to(config, token, addr).await
    }

    /// Binds a specific address (port 0 lets the OS choose).
    pub async fn bind_to(config: Config, token: String, addr: SocketAddr) -> Result<Self> {
        let tls = match config.tls.paths() {
            Some((cert, key)) => Some(tls::acceptor(cert, key)?),
            None => None,
        };
        let state = Arc::new(AppState::new(config, token)?);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;

        Ok(Self {
            listener,
            state,
            tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Listener has no address")
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// The base URL clients should use, e.g. `https://127.0.0.1:50000`.
    pub fn endpoint(&self) -> Result<String> {
        let scheme = if self.is_tls() { "https" } else { "http" };
        Ok(format!("{scheme}://{}", self.local_addr()?))
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let app = create_router(Arc::clone(&self.state));
        match self.tls {
            None => {
                axum::serve(self.listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .context("HTTP server failed")?;
            }
            Some(acceptor) => serve_tls(self.listener, acceptor, app, shutdown).await,
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let builder = Builder::new(TokioExecutor::new());
            let connection =
                builder.serve_connection_with_upgrades(TokioIo::new(tls_stream), service);
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "Connection ended with error");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!(%peer, "Dropping connection for shutdown");
                }
            }
        });
    }
}
