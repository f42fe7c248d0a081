//! Session registry.
//!
//! Single source of truth for issued tokens and live sessions. Both maps sit
//! behind one mutex so that consuming a token and registering its session can
//! never interleave with another connection's lookup. The lock is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use protocol::{SessionSummary, TerminalSize};

use super::pty::{PtyProcess, SessionError};
use super::token::token_prefix;

/// A token that was issued but not yet presented on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Single-use token.
    pub token: String,
    /// Requested terminal size.
    pub size: TerminalSize,
    /// Identity of the requester, if known.
    pub username: Option<String>,
    /// Extra arguments for the local shell.
    pub args: Vec<String>,
    /// When the token was issued.
    pub created_at: Instant,
}

impl PendingRequest {
    /// Creates a request with no identity or arguments.
    pub fn new(token: String, size: TerminalSize) -> Self {
        Self {
            token,
            size,
            username: None,
            args: Vec::new(),
            created_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, PendingRequest>,
    sessions: HashMap<u32, Arc<PtyProcess>>,
}

/// Registry of pending requests (by token) and live sessions (by pid).
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl SessionRegistry {
    /// Creates a registry admitting at most `capacity` pending plus live sessions.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an issued token.
    ///
    /// A token still pending or bound to a live session is refused.
    pub fn register_pending(&self, request: PendingRequest) -> Result<(), SessionError> {
        let mut inner = self.lock();

        let token_in_use = inner.pending.contains_key(&request.token)
            || inner
                .sessions
                .values()
                .any(|session| session.token() == request.token);
        if token_in_use {
            return Err(SessionError::DuplicateToken);
        }
        if inner.pending.len() + inner.sessions.len() >= self.capacity {
            return Err(SessionError::CapacityExceeded(self.capacity));
        }

        inner.pending.insert(request.token.clone(), request);
        Ok(())
    }

    /// Removes and returns the pending request for `token`.
    ///
    /// A token can be taken exactly once.
    pub fn take_pending(&self, token: &str) -> Result<PendingRequest, SessionError> {
        self.lock()
            .pending
            .remove(token)
            .ok_or_else(|| SessionError::UnknownToken(token_prefix(token).to_string()))
    }

    /// Registers a freshly spawned session under its pid.
    pub fn add_session(&self, session: Arc<PtyProcess>) {
        let pid = session.pid();
        if let Some(previous) = self.lock().sessions.insert(pid, session) {
            // The OS recycled a pid whose session was never removed
            tracing::warn!(pid = pid, state = ?previous.state(), "Replaced stale session entry");
        }
    }

    /// Looks up a live session. Both pid and token must match.
    pub fn find_session(&self, pid: u32, token: &str) -> Result<Arc<PtyProcess>, SessionError> {
        self.lock()
            .sessions
            .get(&pid)
            .filter(|session| session.token() == token)
            .cloned()
            .ok_or(SessionError::StaleResize(pid))
    }

    /// Removes the session registered under `pid` if it carries `token`.
    ///
    /// Idempotent; returns the removed session on the first call only. The
    /// token check keeps a late removal from evicting a newer session that
    /// reused the pid.
    pub fn remove_session(&self, pid: u32, token: &str) -> Option<Arc<PtyProcess>> {
        let mut inner = self.lock();
        match inner.sessions.get(&pid) {
            Some(session) if session.token() == token => inner.sessions.remove(&pid),
            _ => None,
        }
    }

    /// Drops pending requests issued more than `ttl` ago.
    ///
    /// Returns the number of dropped requests.
    pub fn expire_pending(&self, ttl: Duration) -> usize {
        let mut inner = self.lock();
        let before = inner.pending.len();
        inner
            .pending
            .retain(|_, request| request.created_at.elapsed() < ttl);
        before - inner.pending.len()
    }

    /// Removes every session and pending request, returning the sessions.
    pub fn drain_sessions(&self) -> Vec<Arc<PtyProcess>> {
        let mut inner = self.lock();
        inner.pending.clear();
        inner.sessions.drain().map(|(_, session)| session).collect()
    }

    /// Number of issued but unbound tokens.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Snapshot of live sessions, ordered by pid.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .lock()
            .sessions
            .values()
            .map(|session| session.summary())
            .collect();
        sessions.sort_by_key(|summary| summary.pid);
        sessions
    }
}
