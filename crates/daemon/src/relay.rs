//! Transport relay.
//!
//! Binds one WebSocket connection to one PTY session. The first message a
//! client sends is its token; the reply is the shell's pid. After that,
//! input flows to the PTY and PTY output flows back until either side goes
//! away, at which point the other side is torn down too.

use std::borrow::Cow;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{encode_pid, ControlAction, Envelope, Framing};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::session::pty::UNKNOWN_EXIT_CODE;
use crate::session::{PtyProcess, SessionError, SessionIo, SessionManager};

/// How long a single outbound message may take before the peer is
/// considered gone.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for trailing output after the child exited.
const DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Per-connection relay settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    /// Framing used after the handshake.
    pub framing: Framing,
    /// Time allowed to present a valid token.
    pub bind_timeout: Option<Duration>,
    /// Keep-alive ping interval.
    pub heartbeat_interval: Option<Duration>,
    /// Silence tolerated on top of one interval.
    pub heartbeat_timeout: Duration,
}

impl RelayOptions {
    /// Builds relay options from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            framing: config.server.framing,
            bind_timeout: config.session.bind_timeout(),
            heartbeat_interval: config.session.heartbeat_interval(),
            heartbeat_timeout: config.session.heartbeat_timeout(),
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a relayed connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the transport or it failed.
    TransportClosed,
    /// The shell exited with the given code.
    ProcessExited(u32),
    /// Nothing was received within the heartbeat window.
    HalfOpen,
    /// No valid token arrived in time.
    BindTimeout,
    /// The daemon is shutting down.
    Shutdown,
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Serves one accepted WebSocket connection until it ends.
pub async fn handle_connection<S>(
    ws: WebSocketStream<S>,
    manager: Arc<SessionManager>,
    options: RelayOptions,
    shutdown: CancellationToken,
    conn_id: u64,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();

    let (session, io) = match bind(&mut source, &manager, &options, &shutdown, conn_id).await {
        Ok(bound) => bound,
        Err(reason) => {
            tracing::debug!(conn_id = conn_id, reason = ?reason, "Connection ended before bind");
            close_transport(&mut sink, reason).await;
            return reason;
        }
    };

    let pid = session.pid();
    if !send(&mut sink, Message::Text(encode_pid(pid)), conn_id).await {
        manager.close(&session);
        return CloseReason::TransportClosed;
    }

    let relay = Relay {
        session: &session,
        sink: &mut sink,
        source: &mut source,
        options,
        conn_id,
    };
    let reason = relay.run(io, &shutdown).await;

    manager.close(&session);
    close_transport(&mut sink, reason).await;

    tracing::info!(conn_id = conn_id, pid = pid, reason = ?reason, "Connection closed");
    reason
}

/// Reads messages until one carries a valid token and its session spawns.
///
/// Every message before that is treated as a token attempt; failures are
/// logged and the connection keeps waiting.
async fn bind<S>(
    source: &mut WsSource<S>,
    manager: &SessionManager,
    options: &RelayOptions,
    shutdown: &CancellationToken,
    conn_id: u64,
) -> Result<(Arc<PtyProcess>, SessionIo), CloseReason>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = options.bind_timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Err(CloseReason::Shutdown),
            _ = sleep_until(deadline) => {
                tracing::warn!(conn_id = conn_id, "No valid session token before timeout");
                return Err(CloseReason::BindTimeout);
            }
            next = source.next() => next,
        };

        let token = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(conn_id = conn_id, "Ignoring non-UTF-8 message before bind");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => return Err(CloseReason::TransportClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(conn_id = conn_id, error = %e, "Transport error before bind");
                return Err(CloseReason::TransportClosed);
            }
        };

        match manager.bind(token.trim()) {
            Ok(bound) => return Ok(bound),
            Err(SessionError::UnknownToken(prefix)) => {
                tracing::warn!(conn_id = conn_id, token = %prefix, "Ignoring unknown session token");
            }
            Err(e) => {
                tracing::error!(conn_id = conn_id, error = %e, "Failed to start session");
            }
        }
    }
}

/// The bound half of a connection.
struct Relay<'a, S> {
    session: &'a PtyProcess,
    sink: &'a mut WsSink<S>,
    source: &'a mut WsSource<S>,
    options: RelayOptions,
    conn_id: u64,
}

impl<S> Relay<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(self, mut io: SessionIo, shutdown: &CancellationToken) -> CloseReason {
        let Relay {
            session,
            sink,
            source,
            options,
            conn_id,
        } = self;
        let pid = session.pid();

        let mut heartbeat = options
            .heartbeat_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));
        let silence_limit = options
            .heartbeat_interval
            .map(|period| period + options.heartbeat_timeout);
        let mut last_seen = Instant::now();
        let mut output_open = true;
        // Input the full queue could not take; the transport is not read
        // again until it is handed over.
        let mut pending_input: Option<Vec<u8>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return CloseReason::Shutdown,

                inbound = source.next(), if pending_input.is_none() => {
                    let message = match inbound {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            tracing::debug!(conn_id = conn_id, pid = pid, error = %e, "Transport error");
                            return CloseReason::TransportClosed;
                        }
                        None => return CloseReason::TransportClosed,
                    };
                    last_seen = Instant::now();

                    match classify(options.framing, message) {
                        Inbound::Input(bytes) if session.is_active() => {
                            match io.input.try_send(bytes) {
                                Ok(()) => {}
                                Err(TrySendError::Full(bytes)) => pending_input = Some(bytes),
                                Err(TrySendError::Closed(_)) => {
                                    tracing::debug!(pid = pid, "Dropping input, PTY writer stopped");
                                }
                            }
                        }
                        Inbound::Input(_) => {
                            tracing::debug!(pid = pid, "Dropping input for terminated session");
                        }
                        Inbound::Ping => {
                            let pong = Envelope::Control(ControlAction::Pong);
                            if !send_envelope(sink, &pong, conn_id).await {
                                return CloseReason::TransportClosed;
                            }
                        }
                        Inbound::Close => return CloseReason::TransportClosed,
                        Inbound::Ignore => {}
                    }
                }

                permit = io.input.reserve(), if pending_input.is_some() => match permit {
                    Ok(permit) => {
                        if let Some(bytes) = pending_input.take() {
                            permit.send(bytes);
                        }
                        last_seen = Instant::now();
                    }
                    Err(_) => {
                        tracing::debug!(pid = pid, "Dropping input, PTY writer stopped");
                        pending_input = None;
                    }
                },

                chunk = io.output.recv(), if output_open => match chunk {
                    Some(bytes) => {
                        if !send(sink, Message::Binary(bytes), conn_id).await {
                            return CloseReason::TransportClosed;
                        }
                    }
                    // EOF; the exit branch reports the status
                    None => output_open = false,
                },

                status = &mut io.exit => {
                    let code = status.unwrap_or(UNKNOWN_EXIT_CODE);
                    drain_output(&mut io.output, sink, conn_id).await;

                    if options.framing == Framing::Envelope {
                        send_envelope(sink, &Envelope::exit(code), conn_id).await;
                    }
                    if code == 0 {
                        tracing::info!(conn_id = conn_id, pid = pid, "Shell exited cleanly");
                    } else {
                        tracing::info!(conn_id = conn_id, pid = pid, exit_code = code, "Shell exited abnormally");
                    }
                    return CloseReason::ProcessExited(code);
                }

                _ = tick(&mut heartbeat) => {
                    // A stalled PTY pauses reads, which is not the peer's silence
                    if let Some(limit) = silence_limit.filter(|_| pending_input.is_none()) {
                        if last_seen.elapsed() >= limit {
                            tracing::warn!(conn_id = conn_id, pid = pid, "Heartbeat timeout");
                            return CloseReason::HalfOpen;
                        }
                    }
                    if !send(sink, Message::Ping(Vec::new()), conn_id).await {
                        return CloseReason::TransportClosed;
                    }
                    if options.framing == Framing::Envelope {
                        let ping = Envelope::Control(ControlAction::Ping);
                        if !send_envelope(sink, &ping, conn_id).await {
                            return CloseReason::TransportClosed;
                        }
                    }
                }
            }
        }
    }
}

/// What an inbound message means for the session.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Input(Vec<u8>),
    Ping,
    Close,
    Ignore,
}

fn classify(framing: Framing, message: Message) -> Inbound {
    match (framing, message) {
        (Framing::Raw, Message::Text(text)) => Inbound::Input(text.into_bytes()),
        (Framing::Envelope, Message::Text(text)) => match Envelope::decode(&text) {
            Ok(Envelope::Data { data }) => Inbound::Input(data.into_bytes()),
            Ok(Envelope::Control(ControlAction::Ping)) => Inbound::Ping,
            Ok(Envelope::Control(_)) => Inbound::Ignore,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed envelope");
                Inbound::Ignore
            }
        },
        (_, Message::Binary(data)) => Inbound::Input(data),
        (_, Message::Close(_)) => Inbound::Close,
        (_, Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => Inbound::Ignore,
    }
}

/// Forwards whatever output is still buffered after the child exited.
async fn drain_output<S>(output: &mut tokio::sync::mpsc::Receiver<Vec<u8>>, sink: &mut WsSink<S>, conn_id: u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(Some(bytes)) = tokio::time::timeout(DRAIN_GRACE, output.recv()).await {
        if !send(sink, Message::Binary(bytes), conn_id).await {
            break;
        }
    }
}

/// Sends one message; returns `false` if the transport is gone.
///
/// Failures are logged and otherwise swallowed.
async fn send<S>(sink: &mut WsSink<S>, message: Message, conn_id: u64) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(SEND_TIMEOUT, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::debug!(conn_id = conn_id, error = %e, "Send failed");
            false
        }
        Err(_) => {
            tracing::debug!(conn_id = conn_id, "Send timed out");
            false
        }
    }
}

async fn send_envelope<S>(sink: &mut WsSink<S>, envelope: &Envelope, conn_id: u64) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match envelope.encode() {
        Ok(text) => send(sink, Message::Text(text), conn_id).await,
        Err(e) => {
            tracing::error!(conn_id = conn_id, error = %e, "Failed to encode envelope");
            true
        }
    }
}

async fn close_transport<S>(sink: &mut WsSink<S>, reason: CloseReason)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match reason {
        CloseReason::TransportClosed => None,
        CloseReason::ProcessExited(0) => Some((CloseCode::Normal, "shell exited")),
        CloseReason::ProcessExited(_) => Some((CloseCode::Error, "shell exited abnormally")),
        CloseReason::HalfOpen => Some((CloseCode::Away, "heartbeat timeout")),
        CloseReason::BindTimeout => Some((CloseCode::Policy, "no session token")),
        CloseReason::Shutdown => Some((CloseCode::Away, "server shutting down")),
    };

    if let Some((code, text)) = frame {
        let close = Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(text),
        }));
        let _ = tokio::time::timeout(SEND_TIMEOUT, sink.send(close)).await;
    }
    let _ = tokio::time::timeout(SEND_TIMEOUT, sink.close()).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
