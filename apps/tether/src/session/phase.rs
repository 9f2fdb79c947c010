use std::fmt;

use crate::discovery::PeerRole;

/// Lifecycle of one session as seen by the rest of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    New,
    Negotiating {
        role: PeerRole,
    },
    Connected,
    Disconnected,
    Failed {
        reason: String,
    },
    Closed,
}

impl ConnectionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionPhase::New => "new",
            ConnectionPhase::Negotiating { .. } => "negotiating",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Failed { .. } => "failed",
            ConnectionPhase::Closed => "closed",
        }
    }

    /// No further negotiation or transport input is acted on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionPhase::Failed { .. } | ConnectionPhase::Closed)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionPhase::Negotiating { role } => write!(f, "negotiating as {role}"),
            ConnectionPhase::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}
