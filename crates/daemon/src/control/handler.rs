//! Control request dispatch.

use std::sync::Arc;
use std::time::Instant;

use protocol::{ControlRequest, ControlResponse};

use crate::session::{SessionError, SessionManager};

/// Maps control requests onto the session manager.
pub struct ControlHandler {
    manager: Arc<SessionManager>,
    started_at: Instant,
}

impl ControlHandler {
    /// Creates a handler; uptime is counted from now.
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }

    /// Answers one request.
    ///
    /// Only `Create` can fail visibly. A resize is always accepted; stale or
    /// invalid ones are dropped here.
    pub fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Ping => ControlResponse::Pong,
            ControlRequest::Create(create) => match self.manager.create(create) {
                Ok(created) => ControlResponse::Created(created),
                Err(e) => {
                    tracing::warn!(error = %e, "Rejected session request");
                    ControlResponse::Error {
                        message: e.to_string(),
                    }
                }
            },
            ControlRequest::Resize(resize) => {
                match self.manager.resize(&resize) {
                    Ok(()) => {}
                    Err(SessionError::StaleResize(pid)) => {
                        tracing::debug!(pid = pid, "Dropping stale resize");
                    }
                    Err(e) => {
                        tracing::debug!(pid = resize.pid, error = %e, "Dropping resize");
                    }
                }
                ControlResponse::Accepted
            }
            ControlRequest::Status => ControlResponse::Status {
                pending: self.manager.pending_count(),
                sessions: self.manager.session_count(),
                uptime_secs: self.started_at.elapsed().as_secs(),
            },
            ControlRequest::ListSessions => ControlResponse::Sessions {
                sessions: self.manager.list_sessions(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use protocol::{CreateRequest, ResizeRequest, TerminalSize};

    fn handler_with(max_sessions: usize) -> ControlHandler {
        let mut config = Config::default();
        config.shell.default_shell = "/bin/sh".to_string();
        config.session.max_sessions = max_sessions;
        ControlHandler::new(Arc::new(SessionManager::new(&config)))
    }

    #[test]
    fn test_ping() {
        assert_eq!(handler_with(4).handle(ControlRequest::Ping), ControlResponse::Pong);
    }

    #[test]
    fn test_create_then_status() {
        let handler = handler_with(4);

        let response = handler.handle(ControlRequest::Create(CreateRequest::default()));
        assert!(matches!(response, ControlResponse::Created(_)));

        match handler.handle(ControlRequest::Status) {
            ControlResponse::Status {
                pending, sessions, ..
            } => {
                assert_eq!(pending, 1);
                assert_eq!(sessions, 0);
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_create_over_capacity_is_error() {
        let handler = handler_with(1);
        handler.handle(ControlRequest::Create(CreateRequest::default()));

        match handler.handle(ControlRequest::Create(CreateRequest::default())) {
            ControlResponse::Error { message } => assert!(message.contains("capacity")),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_resize_is_accepted() {
        let handler = handler_with(4);
        let response = handler.handle(ControlRequest::Resize(ResizeRequest {
            size: TerminalSize::new(100, 40),
            pid: 999_999,
            token: "nope".to_string(),
        }));
        assert_eq!(response, ControlResponse::Accepted);
    }

    #[test]
    fn test_list_sessions_empty() {
        let handler = handler_with(4);
        assert_eq!(
            handler.handle(ControlRequest::ListSessions),
            ControlResponse::Sessions { sessions: vec![] }
        );
    }
}
