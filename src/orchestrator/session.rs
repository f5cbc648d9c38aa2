use crate::protocol::now_ms;
use std::net::SocketAddr;
use uuid::Uuid;

/// One duplex connection with a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub started_at: u64,
    pub peer: Option<SocketAddr>,
    pub user_agent: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: now_ms(),
            peer: None,
            user_agent: None,
        }
    }

    #[must_use]
    pub const fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Milliseconds from session start to `at`, clamped at zero.
    #[must_use]
    pub const fn elapsed_at(&self, at: u64) -> u64 {
        at.saturating_sub(self.started_at)
    }
}
