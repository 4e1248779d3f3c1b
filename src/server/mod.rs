//! Live development server
//!
//! `LiveServer` owns the listener, the socket channel, the file watcher and
//! (optionally) an HMR dev-server adapter for one server instance.

pub mod collab;
pub mod error;
pub mod events;
pub mod file_watcher;
pub mod hmr;
pub mod inject;
pub mod proxy;
pub mod socket;
pub mod state;
pub mod static_files;

pub use error::ServerError;
pub use events::{EventBroadcaster, ServerEvent};
pub use file_watcher::{FileWatcher, WatchFilter};
pub use hmr::{HmrAdapter, HmrProfile};
pub use socket::SOCKET_PATH;
pub use state::ServerAppState;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, State},
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::certs::CertificateProvisioner;
use crate::config::ServerConfig;
use crate::shutdown::{ShutdownState, TeardownReport};

/// Liveness probe, served even when everything else is proxied
pub const HEALTH_PATH: &str = "/__devlight/health";

/// How long stop() waits for in-flight connections to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Snapshot of a running server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub url: String,
    pub port: u16,
    pub https: bool,
}

enum ServeHandle {
    Plain(oneshot::Sender<()>),
    Tls(axum_server::Handle),
}

struct RunningServer {
    state: ServerAppState,
    info: ServerInfo,
    serve: ServeHandle,
    serve_task: JoinHandle<()>,
    watcher: Option<FileWatcher>,
    hmr: Option<HmrAdapter>,
}

/// Server lifecycle controller
pub struct LiveServer {
    config: Arc<ServerConfig>,
    broadcaster: Arc<EventBroadcaster>,
    shutdown: ShutdownState,
    certificates: CertificateProvisioner,
    hmr_profile: Option<HmrProfile>,
    running: Option<RunningServer>,
}

impl LiveServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            broadcaster: Arc::new(EventBroadcaster::new()),
            shutdown: ShutdownState::new(),
            certificates: CertificateProvisioner::new(),
            hmr_profile: None,
            running: None,
        }
    }

    /// Share an externally owned shutdown flag (e.g. one wired to signals)
    pub fn with_shutdown_state(mut self, shutdown: ShutdownState) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_certificate_provisioner(mut self, provisioner: CertificateProvisioner) -> Self {
        self.certificates = provisioner;
        self
    }

    /// Use an explicit dev-server profile instead of the configured project type
    pub fn with_hmr_profile(mut self, profile: HmrProfile) -> Self {
        self.hmr_profile = Some(profile);
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Receive lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.broadcaster.subscribe()
    }

    /// Flag that cancels a pending startup when set
    pub fn shutdown_handle(&self) -> ShutdownState {
        self.shutdown.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Only available while running
    pub fn info(&self) -> Option<ServerInfo> {
        self.running.as_ref().map(|r| r.info.clone())
    }

    /// Name of the dev-server profile being proxied, if any
    pub fn hmr_profile_name(&self) -> Option<&str> {
        self.running
            .as_ref()
            .and_then(|r| r.hmr.as_ref())
            .map(|adapter| adapter.profile().name.as_str())
    }

    /// Shared state of the running instance
    pub fn state(&self) -> Option<&ServerAppState> {
        self.running.as_ref().map(|r| &r.state)
    }

    /// Start serving. On failure the `Error` event is emitted and nothing
    /// is left bound or running.
    pub async fn start(&mut self) -> Result<ServerInfo, ServerError> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyRunning(running.info.port));
        }

        match self.launch().await {
            Ok(running) => {
                let info = running.info.clone();
                self.running = Some(running);
                log::info!("Serving {} at {}", self.config.root_path.display(), info.url);
                self.broadcaster.emit(ServerEvent::Started {
                    port: info.port,
                    https: info.https,
                });
                Ok(info)
            }
            Err(e) => {
                log::error!("Failed to start server: {}", e);
                self.broadcaster.emit(ServerEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<RunningServer, ServerError> {
        let config = &self.config;
        if !config.root_path.is_dir() {
            return Err(ServerError::InvalidRoot(config.root_path.clone()));
        }
        let addr = bind_address(&config.host, config.port)?;

        let tls = if config.use_https {
            Some(self.tls_config().await?)
        } else {
            None
        };

        let mut hmr = match self.hmr_adapter() {
            Some(mut adapter) => {
                adapter
                    .ensure_running(config.hmr_ready_timeout, &self.shutdown)
                    .await?;
                Some(adapter)
            }
            None => None,
        };

        let listener = match bind_listener(addr) {
            Ok(listener) => listener,
            Err(e) => {
                if let Some(adapter) = hmr.as_mut() {
                    adapter.shutdown().await;
                }
                return Err(e);
            }
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(config.port);

        let mut proxy_rules = config.proxy_rules.clone();
        if let Some(rule) = hmr.as_ref().and_then(|a| a.proxy_rule()) {
            proxy_rules.push(rule);
        }
        let state = ServerAppState::new(config.clone(), proxy_rules, self.broadcaster.clone());
        let app = build_router(state.clone());

        let https = tls.is_some();
        let (serve, serve_task) = match tls {
            Some(tls) => serve_tls(listener, tls, app),
            None => match serve_plain(listener, app) {
                Ok(pair) => pair,
                Err(e) => {
                    if let Some(adapter) = hmr.as_mut() {
                        adapter.shutdown().await;
                    }
                    return Err(e);
                }
            },
        };

        let watcher = start_watcher(&state);

        let scheme = if https { "https" } else { "http" };
        let info = ServerInfo {
            url: format!("{}://{}:{}", scheme, display_host(&config.host), port),
            port,
            https,
        };

        Ok(RunningServer {
            state,
            info,
            serve,
            serve_task,
            watcher,
            hmr,
        })
    }

    async fn tls_config(&self) -> Result<axum_server::tls_rustls::RustlsConfig, ServerError> {
        // Another component may already have installed a provider
        let _ = rustls::crypto::ring::default_provider().install_default();

        let pair = self.certificates.acquire().await;
        axum_server::tls_rustls::RustlsConfig::from_pem(pair.cert, pair.key)
            .await
            .map_err(|e| ServerError::Tls(e.to_string()))
    }

    /// Undetectable `auto` projects fall back to plain static serving
    fn hmr_adapter(&self) -> Option<HmrAdapter> {
        let profile = match (&self.hmr_profile, self.config.project_type) {
            (Some(profile), _) => profile.clone(),
            (None, Some(project_type)) => {
                match HmrProfile::resolve(project_type, &self.config.root_path) {
                    Some(profile) => profile,
                    None => {
                        log::info!(
                            "No supported dev server detected in {}, serving static files",
                            self.config.root_path.display()
                        );
                        return None;
                    }
                }
            }
            (None, None) => return None,
        };
        log::info!("Using '{}' dev-server profile", profile.name);
        Some(HmrAdapter::new(profile, self.config.root_path.clone()))
    }

    /// Best-effort ordered teardown: socket clients, watcher, listener,
    /// then the HMR dev server. No-op when not running.
    pub async fn stop(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let Some(mut running) = self.running.take() else {
            return report;
        };

        log::info!("Stopping server on port {}", running.info.port);

        running.state.mark_closing();
        report.connections_closed = running.state.registry.close_all();

        if let Some(watcher) = running.watcher.take() {
            watcher.stop();
            report.watcher_stopped = true;
        }

        match running.serve {
            ServeHandle::Plain(tx) => {
                if tx.send(()).is_err() {
                    report.errors.push("HTTP server already exited".to_string());
                }
            }
            ServeHandle::Tls(handle) => handle.graceful_shutdown(Some(DRAIN_TIMEOUT)),
        }

        let mut serve_task = running.serve_task;
        if tokio::time::timeout(DRAIN_TIMEOUT + Duration::from_secs(1), &mut serve_task)
            .await
            .is_err()
        {
            serve_task.abort();
            report
                .errors
                .push("Listener did not drain in time; connections were dropped".to_string());
        }

        if let Some(mut adapter) = running.hmr.take() {
            report.hmr_stopped = adapter.has_spawned_process();
            adapter.shutdown().await;
        }

        report.log();
        self.broadcaster.emit(ServerEvent::Stopped);
        report
    }
}

fn bind_address(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let ip: IpAddr = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
                addr: format!("{}:{}", host, port),
                reason: e.to_string(),
            })?
    };
    Ok(SocketAddr::new(ip, port))
}

fn bind_listener(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ServerError::Bind { addr, source })?;
    Ok(listener)
}

/// Host shown in the URL; wildcard and loopback binds read as localhost
fn display_host(host: &str) -> String {
    match host {
        "0.0.0.0" | "::" | "127.0.0.1" | "::1" => "localhost".to_string(),
        h if h.contains(':') => format!("[{}]", h),
        h => h.to_string(),
    }
}

fn serve_plain(
    listener: std::net::TcpListener,
    app: Router,
) -> Result<(ServeHandle, JoinHandle<()>), ServerError> {
    let addr = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let listener = tokio::net::TcpListener::from_std(listener)
        .map_err(|source| ServerError::Bind { addr, source })?;

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = rx.await;
            log::debug!("HTTP listener shutting down");
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            log::error!("Server error: {}", e);
        }
    });

    log::info!("Listening on http://{}", addr);
    Ok((ServeHandle::Plain(tx), task))
}

fn serve_tls(
    listener: std::net::TcpListener,
    tls: axum_server::tls_rustls::RustlsConfig,
    app: Router,
) -> (ServeHandle, JoinHandle<()>) {
    if let Ok(addr) = listener.local_addr() {
        log::info!("Listening on https://{}", addr);
    }

    let handle = axum_server::Handle::new();
    let server = axum_server::from_tcp_rustls(listener, tls).handle(handle.clone());
    let task = tokio::spawn(async move {
        if let Err(e) = server.serve(app.into_make_service()).await {
            log::error!("HTTPS server error: {}", e);
        }
    });

    (ServeHandle::Tls(handle), task)
}

/// Watcher failures degrade to serving without reloads
fn start_watcher(state: &ServerAppState) -> Option<FileWatcher> {
    let config = &state.config;
    let filter = match WatchFilter::new(
        &config.root_path,
        &config.watch_patterns,
        &config.watch_ignore_patterns,
    ) {
        Ok(filter) => filter,
        Err(e) => {
            log::warn!("Invalid watch pattern, live reload disabled: {}", e);
            return None;
        }
    };

    let reload_state = state.clone();
    match FileWatcher::start(filter, move |relative| {
        reload_state.notify_file_changed(relative);
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log::warn!("Failed to start file watcher, live reload disabled: {}", e);
            None
        }
    }
}

fn build_router(state: ServerAppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(SOCKET_PATH, get(socket::socket_handler))
        .route(HEALTH_PATH, get(health_handler))
        .fallback(fallback_handler)
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Proxy rules first, then the static router
async fn fallback_handler(
    State(state): State<ServerAppState>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path().to_string();

    if let Some(rule) = state.proxy.match_rule(&path).cloned() {
        return state.proxy.forward(&rule, ws, req).await;
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    static_files::serve_path(
        &state.config.root_path,
        &path,
        state.config.spa_mode,
        state.config.show_overlay,
    )
    .await
}
