//! `Disposer`: owns both listeners and the live client set.
//!
//! The raw-stream listener accepts TCP connections directly; the WebSocket
//! listener is an axum router that also serves `/health` and `/metrics`.
//! Every accepted connection gets a fresh client id, a connection slot, and a
//! session task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use nodecast_core::{NodeManager, SubscriberId};
use nodecast_rpc::{MethodRegistry, RpcContext};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::ClientSet;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{CONNECTIONS_REJECTED_TOTAL, render};
use crate::session::{SessionDeps, run_session};
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{SocketConnection, TransportKind, WebSocketConnection};

/// Pause after a failed `accept` so a persistent error cannot spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Addresses the listeners actually bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundAddrs {
    /// Raw TCP listener.
    pub socket: SocketAddr,
    /// WebSocket listener.
    pub websocket: SocketAddr,
}

/// State shared by both accept loops and the axum handlers.
#[derive(Debug)]
struct Shared {
    deps: SessionDeps,
    max_connections: usize,
    max_frame_bytes: usize,
    next_client_id: AtomicU64,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl Shared {
    fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    fn reject(&self, kind: TransportKind, peer: SocketAddr) {
        counter!(CONNECTIONS_REJECTED_TOTAL, "transport" => kind.as_str()).increment(1);
        warn!(%peer, transport = kind.as_str(), limit = self.max_connections, "connection limit reached");
    }
}

/// The broker's network front: both listeners plus the live client set.
pub struct Disposer {
    config: ServerConfig,
    shared: Arc<Shared>,
    shutdown: ShutdownCoordinator,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl Disposer {
    /// Build a disposer around `nodes` and `registry`.
    ///
    /// The handler context takes its name, echo policy, and unknown-method
    /// reporting from `config`.
    pub fn new(config: ServerConfig, nodes: Arc<NodeManager>, registry: MethodRegistry) -> Self {
        let mut ctx = RpcContext::new(nodes, config.process_name.clone());
        ctx.echo_policy = config.echo_policy;
        ctx.report_unknown_methods = config.report_unknown_methods;

        let deps = SessionDeps {
            registry: Arc::new(registry),
            ctx: Arc::new(ctx),
            clients: Arc::new(ClientSet::new()),
            outbound_buffer: config.outbound_buffer,
        };
        let shared = Shared {
            deps,
            max_connections: config.max_connections,
            max_frame_bytes: config.max_frame_bytes,
            next_client_id: AtomicU64::new(1),
            metrics: None,
            start_time: Instant::now(),
        };
        Self {
            config,
            shared: Arc::new(shared),
            shutdown: ShutdownCoordinator::new(),
            tasks: Mutex::new(None),
        }
    }

    /// Serve Prometheus text on `GET /metrics`.
    ///
    /// Only takes effect before [`listen`](Self::listen).
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(handle);
        }
        self
    }

    /// Bind both listeners and start accepting.
    pub async fn listen(&self) -> Result<BoundAddrs, ServerError> {
        if self.tasks.lock().is_some() || self.shutdown.is_shutting_down() {
            return Err(ServerError::AlreadyListening);
        }

        let socket_listener = bind(&self.config.socket.addr()).await?;
        let ws_listener = bind(&self.config.websocket.addr()).await?;
        let addrs = BoundAddrs {
            socket: socket_listener.local_addr()?,
            websocket: ws_listener.local_addr()?,
        };

        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let token = self.shutdown.token();
        let socket_task = tokio::spawn(accept_sockets(
            socket_listener,
            Arc::clone(&self.shared),
            token.clone(),
        ));

        let app = router(Arc::clone(&self.shared))
            .into_make_service_with_connect_info::<SocketAddr>();
        let ws_task = tokio::spawn(async move {
            let serve = axum::serve(ws_listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "websocket listener failed");
            }
            info!("websocket listener stopped");
        });
        *tasks = Some(vec![socket_task, ws_task]);

        info!(
            name = %self.config.process_name,
            socket = %addrs.socket,
            websocket = %addrs.websocket,
            "broker listening"
        );
        Ok(addrs)
    }

    /// Stop accepting on both listeners and wait for them to close.
    ///
    /// Established sessions stay open; see [`disconnect_all`](Self::disconnect_all).
    /// Returns `false` if the listeners had to be aborted after the timeout.
    pub async fn stop(&self) -> bool {
        let handles = self.tasks.lock().take().unwrap_or_default();
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        self.shutdown.graceful_shutdown(handles, Some(timeout)).await
    }

    /// Destroy every live client; their sessions then close the transport.
    /// Returns how many clients were destroyed.
    pub async fn disconnect_all(&self) -> usize {
        let clients = &self.shared.deps.clients;
        let mut closed = 0;
        for id in clients.ids().await {
            if let Some(client) = clients.get(id).await {
                let _ = client.destroy(&self.shared.deps.ctx.nodes);
                closed += 1;
            }
        }
        closed
    }

    /// Live client set.
    pub fn clients(&self) -> &Arc<ClientSet> {
        &self.shared.deps.clients
    }

    /// Handler context shared by every client.
    pub fn context(&self) -> &Arc<RpcContext> {
        &self.shared.deps.ctx
    }

    /// Configuration the disposer was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// HTTP router of the WebSocket listener, for in-process tests.
    pub fn router(&self) -> Router {
        router(Arc::clone(&self.shared))
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disposer")
            .field("socket", &self.config.socket.addr())
            .field("websocket", &self.config.websocket.addr())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_owned(),
            source,
        })
}

// ── Raw-stream listener ─────────────────────────────────────────────

async fn accept_sockets(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => admit_socket(stream, peer, &shared),
            Err(e) => {
                warn!(error = %e, "socket accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    info!("socket listener stopped");
}

fn admit_socket(stream: TcpStream, peer: SocketAddr, shared: &Shared) {
    let Some(slot) = shared.deps.clients.try_reserve(shared.max_connections) else {
        shared.reject(TransportKind::Socket, peer);
        drop(stream);
        return;
    };
    let _ = stream.set_nodelay(true);
    let conn = SocketConnection::new(stream, peer, shared.max_frame_bytes);
    drop(tokio::spawn(run_session(
        conn,
        shared.next_id(),
        slot,
        shared.deps.clone(),
    )));
}

// ── WebSocket listener ──────────────────────────────────────────────

fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(shared)
}

/// GET / and GET /ws: upgrade to a WebSocket session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(shared): State<Arc<Shared>>,
) -> Response {
    let Some(slot) = shared.deps.clients.try_reserve(shared.max_connections) else {
        shared.reject(TransportKind::WebSocket, peer);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };
    let client_id = shared.next_id();
    let deps = shared.deps.clone();
    ws.max_message_size(shared.max_frame_bytes)
        .on_upgrade(move |socket| {
            run_session(WebSocketConnection::new(socket, peer), client_id, slot, deps)
        })
        .into_response()
}

/// GET /health
async fn health_handler(State(shared): State<Arc<Shared>>) -> Json<HealthResponse> {
    let connections = shared.deps.clients.count().await;
    let nodes = shared.deps.ctx.nodes.node_count();
    Json(health::health_check(shared.start_time, connections, nodes))
}

/// GET /metrics
async fn metrics_handler(State(shared): State<Arc<Shared>>) -> Response {
    match &shared.metrics {
        Some(handle) => render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
