//! Session manager.
//!
//! Owns the [`SessionRegistry`] and drives the session lifecycle: issuing
//! tokens, binding a token to a freshly spawned PTY, resizing, and teardown.

use std::sync::Arc;

use protocol::{CreateRequest, CreateResponse, ResizeRequest, SessionSummary};

use super::pty::{PtyProcess, SessionError, SessionIo};
use super::registry::{PendingRequest, SessionRegistry};
use super::shell::ShellInvocation;
use super::token::{generate_token, token_prefix};
use crate::config::{Config, SessionConfig, ShellConfig};

/// Creates, tracks and tears down PTY sessions.
pub struct SessionManager {
    registry: SessionRegistry,
    shell: ShellConfig,
    session: SessionConfig,
    public_url: String,
}

impl SessionManager {
    /// Creates a manager from the daemon configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            registry: SessionRegistry::new(config.session.max_sessions),
            shell: config.shell.clone(),
            session: config.session.clone(),
            public_url: config.server.public_url.clone(),
        }
    }

    /// Reserves a session and issues its token.
    ///
    /// Nothing is spawned until the token is presented on a transport.
    pub fn create(&self, request: CreateRequest) -> Result<CreateResponse, SessionError> {
        let size = request.size.unwrap_or_default().or_default();
        let token = generate_token();

        let mut pending = PendingRequest::new(token.clone(), size);
        pending.username = request.username;
        pending.args = request.args;
        self.registry.register_pending(pending)?;

        tracing::info!(
            token = token_prefix(&token),
            cols = size.cols,
            rows = size.rows,
            "Issued session token"
        );

        Ok(CreateResponse {
            token,
            uri: self.public_url.clone(),
        })
    }

    /// Consumes `token` and spawns its session.
    ///
    /// On success the session is registered under its pid before this
    /// returns. A consumed token cannot be bound again, even if the spawn
    /// fails.
    pub fn bind(&self, token: &str) -> Result<(Arc<PtyProcess>, SessionIo), SessionError> {
        let request = self.registry.take_pending(token)?;
        let invocation =
            ShellInvocation::resolve(&self.shell, request.username.as_deref(), &request.args);

        let (process, io) = PtyProcess::spawn(request, &invocation, &self.shell.term_name)?;
        self.registry.add_session(Arc::clone(&process));

        tracing::info!(
            pid = process.pid(),
            token = token_prefix(token),
            "Session bound"
        );

        Ok((process, io))
    }

    /// Resizes the session matching the request's pid and token.
    pub fn resize(&self, request: &ResizeRequest) -> Result<(), SessionError> {
        let session = self.registry.find_session(request.pid, &request.token)?;
        session.resize(request.size)
    }

    /// Kills a session and removes it from the registry.
    ///
    /// Safe to call any number of times from any trigger. Returns `true` if
    /// this call removed the session.
    pub fn close(&self, session: &PtyProcess) -> bool {
        session.kill();
        let removed = self
            .registry
            .remove_session(session.pid(), session.token())
            .is_some();
        if removed {
            tracing::info!(pid = session.pid(), "Session removed");
        }
        removed
    }

    /// Kills every live session and forgets every pending token.
    ///
    /// Returns the number of sessions torn down.
    pub fn teardown_all(&self) -> usize {
        let sessions = self.registry.drain_sessions();
        for session in &sessions {
            session.kill();
        }
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Tore down all sessions");
        }
        sessions.len()
    }

    /// Drops tokens older than the configured TTL.
    pub fn expire_pending(&self) -> usize {
        let Some(ttl) = self.session.pending_ttl() else {
            return 0;
        };
        let expired = self.registry.expire_pending(ttl);
        if expired > 0 {
            tracing::info!(count = expired, "Expired unbound session tokens");
        }
        expired
    }

    /// Number of issued but unbound tokens.
    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.session_count()
    }

    /// Snapshot of live sessions.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry.list_sessions()
    }
}
