//! Relay server wiring.
//!
//! [`RelayServer`] owns the session manager and runs the three long-lived
//! tasks of the daemon: the WebSocket accept loop, the control socket, and
//! the reaper that expires unbound tokens. Stopping it tears down every live
//! session.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::{ControlHandler, ControlServer};
use crate::relay::{self, CloseReason, RelayOptions};
use crate::session::SessionManager;

/// How often the reaper looks for expired tokens.
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed for the WebSocket upgrade after a TCP accept.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for background tasks to finish during stop.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the relay server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Server state changed.
    StateChanged(ServerState),
    /// A WebSocket connection completed its upgrade.
    ConnectionOpened { conn_id: u64, peer: SocketAddr },
    /// A WebSocket connection ended.
    ConnectionClosed { conn_id: u64, reason: CloseReason },
}

/// The ptyrelay daemon.
pub struct RelayServer {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<ServerState>>,
    /// Session manager shared with every connection.
    manager: Arc<SessionManager>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<ServerEvent>,
    /// Long-lived tasks started by `start`.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Address the WebSocket listener is bound to.
    local_addr: Option<SocketAddr>,
}

impl RelayServer {
    /// Creates a relay server from a validated configuration.
    pub fn new(config: Config) -> Self {
        let manager = Arc::new(SessionManager::new(&config));
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            manager,
            shutdown_token: CancellationToken::new(),
            event_tx,
            tasks: Mutex::new(Vec::new()),
            local_addr: None,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns a receiver for server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Returns the bound WebSocket address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the control socket path.
    pub fn control_socket(&self) -> &Path {
        &self.config.server.control_socket
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Binds both listeners and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Relay server is already running");
            }
            *state = ServerState::Starting;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Starting));

        info!("Starting relay server...");

        if let Err(e) = self.spawn_tasks().await {
            *self.state.write().await = ServerState::Stopped;
            self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));
            return Err(e);
        }

        *self.state.write().await = ServerState::Running;
        self.emit_event(ServerEvent::StateChanged(ServerState::Running));

        info!("Relay server running");
        Ok(())
    }

    async fn spawn_tasks(&mut self) -> Result<()> {
        // A stopped server may be started again with a fresh token
        self.shutdown_token = CancellationToken::new();

        let listener = TcpListener::bind(&self.config.server.listen_addr)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind WebSocket listener on {}",
                    self.config.server.listen_addr
                )
            })?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read WebSocket listener address")?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, framing = ?self.config.server.framing, "WebSocket listener bound");

        let control = ControlServer::bind(&self.config.server.control_socket)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind control socket at {}",
                    self.config.server.control_socket.display()
                )
            })?;

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.manager),
            RelayOptions::from_config(&self.config),
            self.shutdown_token.clone(),
            self.event_tx.clone(),
        )));

        let handler = Arc::new(ControlHandler::new(Arc::clone(&self.manager)));
        tasks.push(tokio::spawn(
            control.serve(handler, self.shutdown_token.clone()),
        ));

        if self.config.session.pending_ttl().is_some() {
            tasks.push(tokio::spawn(reap_pending(
                Arc::clone(&self.manager),
                self.shutdown_token.clone(),
            )));
            debug!("Started pending token reaper");
        }

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        Ok(())
    }

    /// Stops serving and kills every live session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ServerState::Stopped {
                return Ok(());
            }
            if *state == ServerState::ShuttingDown {
                anyhow::bail!("Relay server is already shutting down");
            }
            *state = ServerState::ShuttingDown;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::ShuttingDown));

        info!("Stopping relay server...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();

        let killed = self.manager.teardown_all();
        debug!(sessions = killed, "Killed live sessions");

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }

        {
            let mut state = self.state.write().await;
            *state = ServerState::Stopped;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));

        info!("Relay server stopped");
        Ok(())
    }

    /// Emits a server event.
    fn emit_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Accepts TCP connections, upgrades them and relays each on its own task.
async fn accept_loop(
    listener: TcpListener,
    manager: Arc<SessionManager>,
    options: RelayOptions,
    shutdown: CancellationToken,
    events: broadcast::Sender<ServerEvent>,
) {
    let next_conn_id = AtomicU64::new(1);

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                    continue;
                }
            },
        };

        // Interactive traffic; disable Nagle
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        let events = events.clone();

        tokio::spawn(async move {
            let ws = match tokio::time::timeout(UPGRADE_TIMEOUT, accept_async(stream)).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    warn!(peer = %peer, "WebSocket handshake timed out");
                    return;
                }
            };

            debug!(conn_id = conn_id, peer = %peer, "WebSocket connection opened");
            let _ = events.send(ServerEvent::ConnectionOpened { conn_id, peer });

            let reason = relay::handle_connection(ws, manager, options, shutdown, conn_id).await;

            let _ = events.send(ServerEvent::ConnectionClosed { conn_id, reason });
        });
    }

    info!("WebSocket listener stopped");
}

/// Periodically expires tokens that were never presented.
async fn reap_pending(manager: Arc<SessionManager>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                manager.expire_pending();
            }
        }
    }
}
