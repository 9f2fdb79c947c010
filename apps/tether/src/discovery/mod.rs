use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod lan;
pub mod memory;
pub mod service;

pub use service::{DiscoveryEvent, PeerDiscoveryService};

/// Scopes advertising and browsing so unrelated services are never seen.
pub const SERVICE_TYPE: &str = "tether-stream";

/// Discovery-info key carrying the advertised role.
pub const ROLE_KEY: &str = "type";

pub const DEFAULT_INVITATION_TIMEOUT: Duration = Duration::from_secs(30);

pub type DiscoveryInfo = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Viewer,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Host => "host",
            PeerRole::Viewer => "viewer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(PeerRole::Host),
            "viewer" => Some(PeerRole::Viewer),
            _ => None,
        }
    }

    /// The role a peer must advertise to be worth inviting.
    pub fn counterpart(self) -> Self {
        match self {
            PeerRole::Host => PeerRole::Viewer,
            PeerRole::Viewer => PeerRole::Host,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    /// `None` when the advertisement carried no recognizable role tag.
    pub role: Option<PeerRole>,
}

impl Peer {
    pub fn new(id: PeerId, display_name: impl Into<String>, role: PeerRole) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role: Some(role),
        }
    }

    pub fn from_advertisement(id: PeerId, display_name: String, info: &DiscoveryInfo) -> Self {
        Self {
            id,
            display_name,
            role: info.get(ROLE_KEY).and_then(|raw| PeerRole::parse(raw)),
        }
    }

    pub fn discovery_info(&self) -> DiscoveryInfo {
        let mut info = DiscoveryInfo::new();
        if let Some(role) = self.role {
            info.insert(ROLE_KEY.to_string(), role.as_str().to_string());
        }
        info
    }
}

/// A reliable, ordered byte pipe to one remote peer.
#[derive(Debug)]
pub struct SessionLink {
    pub peer: Peer,
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl SessionLink {
    /// Two in-process links wired back to back.
    pub fn pair(a: Peer, b: Peer) -> (SessionLink, SessionLink) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            SessionLink {
                peer: b,
                outbound: a_tx,
                inbound: a_rx,
            },
            SessionLink {
                peer: a,
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

#[derive(Debug)]
pub enum BackendEvent {
    Found {
        id: PeerId,
        display_name: String,
        info: DiscoveryInfo,
    },
    Lost(PeerId),
    /// A remote peer invited us and the backend accepted.
    Incoming(SessionLink),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to start advertising: {0}")]
    Advertise(String),
    #[error("failed to start browsing: {0}")]
    Browse(String),
    #[error("peer {0} is not reachable")]
    UnknownPeer(PeerId),
    #[error("invitation to {0} was declined")]
    Declined(PeerId),
    #[error("invitation to {peer} timed out after {timeout:?}")]
    InvitationTimeout { peer: PeerId, timeout: Duration },
    #[error("invitation to {peer} failed: {reason}")]
    Invitation { peer: PeerId, reason: String },
    #[error("discovery backend events already taken")]
    EventsTaken,
}

/// Presence and invitation primitives of one local-network technology.
///
/// Backends push [`BackendEvent`]s on the receiver returned by
/// `take_events`; found/lost events may arrive in any order and repeat.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn start_advertising(&self, local: &Peer) -> Result<(), DiscoveryError>;
    async fn stop_advertising(&self);
    async fn start_browsing(&self, local: &Peer) -> Result<(), DiscoveryError>;
    async fn stop_browsing(&self);

    /// Resolves once the remote accepts; may never resolve if the remote
    /// ignores the invitation, so callers bound it with a timeout.
    async fn invite(&self, local: &Peer, remote: &Peer) -> Result<SessionLink, DiscoveryError>;

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BackendEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_read_from_discovery_info() {
        let mut info = DiscoveryInfo::new();
        info.insert(ROLE_KEY.into(), "host".into());
        let peer = Peer::from_advertisement(PeerId::new("a"), "iPad".into(), &info);
        assert_eq!(peer.role, Some(PeerRole::Host));
        assert_eq!(peer.discovery_info(), info);

        info.insert(ROLE_KEY.into(), "projector".into());
        let peer = Peer::from_advertisement(PeerId::new("a"), "iPad".into(), &info);
        assert_eq!(peer.role, None);
        assert!(peer.discovery_info().is_empty());
    }

    #[test]
    fn counterpart_roles() {
        assert_eq!(PeerRole::Viewer.counterpart(), PeerRole::Host);
        assert_eq!(PeerRole::Host.counterpart(), PeerRole::Viewer);
    }

    #[tokio::test]
    async fn paired_links_deliver_in_order() {
        let a = Peer::new(PeerId::new("a"), "A", PeerRole::Host);
        let b = Peer::new(PeerId::new("b"), "B", PeerRole::Viewer);
        let (link_a, mut link_b) = SessionLink::pair(a.clone(), b.clone());
        assert_eq!(link_a.peer, b);
        assert_eq!(link_b.peer, a);
        link_a.outbound.send(Bytes::from_static(b"1")).unwrap();
        link_a.outbound.send(Bytes::from_static(b"2")).unwrap();
        assert_eq!(link_b.inbound.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(link_b.inbound.recv().await.unwrap(), Bytes::from_static(b"2"));
    }
}
