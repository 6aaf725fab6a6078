//! Status shared by the session workers ([`Transcoder`](super::Transcoder),
//! [`Player`](super::Player))
//!
//! A session publishes its status on a `watch` channel: `Idle` until started,
//! `Running` once every child runs, then exactly one terminal status.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    /// Every stream reached its destination
    Completed,
    /// Stopped on request before completion
    Stopped,
    Failed(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Failed(_)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Stopped => write!(f, "stopped"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// `Stopped`, unless the session already reached a terminal status
pub(crate) fn settle_stopped(status: &watch::Sender<SessionStatus>) {
    status.send_if_modified(|status| {
        if status.is_terminal() {
            return false;
        }
        *status = SessionStatus::Stopped;
        true
    });
}

/// Resolves with the first terminal status
pub(crate) async fn wait_terminal(mut status: watch::Receiver<SessionStatus>) -> SessionStatus {
    let reached = status
        .wait_for(SessionStatus::is_terminal)
        .await
        .map(|terminal| terminal.clone());
    // publisher gone: whatever it last sent
    reached.unwrap_or_else(|_| status.borrow().clone())
}
