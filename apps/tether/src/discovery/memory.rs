//! In-process discovery over a [`LocalBus`].
//!
//! Presence frames share one topic per service type; invitations go to a
//! per-peer topic and every accepted session gets its own pair of topics.
//! Endpoints always subscribe before they publish so nothing is lost to a
//! topic with no listeners yet.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use transport_bus::{Bus, BusMessage, LocalBus};

use super::{BackendEvent, DiscoveryBackend, DiscoveryError, DiscoveryInfo, Peer, PeerId, SessionLink};

/// How an advertising endpoint answers invitations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InviteResponse {
    #[default]
    Accept,
    Decline,
    /// Leave the inviter waiting until its own timeout fires.
    Ignore,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum PresenceFrame {
    Announce {
        peer_id: PeerId,
        name: String,
        info: DiscoveryInfo,
    },
    Query,
    Withdraw {
        peer_id: PeerId,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct InviteFrame {
    session: String,
    peer_id: PeerId,
    name: String,
    info: DiscoveryInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct InviteReply {
    accepted: bool,
}

#[derive(Default)]
struct Tasks {
    advertising: Option<JoinHandle<()>>,
    invites: Option<JoinHandle<()>>,
    browsing: Option<JoinHandle<()>>,
}

pub struct MemoryDiscovery {
    bus: Arc<LocalBus>,
    service_type: String,
    response: Arc<Mutex<InviteResponse>>,
    tasks: Mutex<Tasks>,
    local: Mutex<Option<Peer>>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
}

impl MemoryDiscovery {
    pub fn new(bus: Arc<LocalBus>, service_type: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            service_type: service_type.into(),
            response: Arc::new(Mutex::new(InviteResponse::default())),
            tasks: Mutex::new(Tasks::default()),
            local: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn with_invite_response(self, response: InviteResponse) -> Self {
        *self.response.lock() = response;
        self
    }

    pub fn set_invite_response(&self, response: InviteResponse) {
        *self.response.lock() = response;
    }

    fn presence_topic(&self) -> String {
        format!("{}/presence", self.service_type)
    }

    fn invite_topic(&self, peer: &PeerId) -> String {
        format!("{}/invite/{peer}", self.service_type)
    }

    fn publish_presence(&self, origin: &PeerId, frame: &PresenceFrame) {
        let Ok(payload) = serde_json::to_vec(frame) else {
            return;
        };
        // nobody listening yet is fine for presence
        let _ = self
            .bus
            .publish(&self.presence_topic(), origin.as_str(), Bytes::from(payload));
    }
}

fn session_topic(service_type: &str, session: &str, endpoint: &PeerId) -> String {
    format!("{service_type}/session/{session}/{endpoint}")
}

fn reply_topic(service_type: &str, session: &str) -> String {
    format!("{service_type}/session/{session}/reply")
}

/// Bridges a pair of session topics onto a [`SessionLink`]. The caller must
/// already hold the subscription for `inbound_topic`.
fn bridge(
    bus: Arc<LocalBus>,
    local_id: PeerId,
    remote: Peer,
    mut subscription: broadcast::Receiver<BusMessage>,
    inbound_topic: String,
    outbound_topic: String,
) -> SessionLink {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Bytes>();

    let out_bus = Arc::clone(&bus);
    tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if out_bus
                .publish(&outbound_topic, local_id.as_str(), payload)
                .is_err()
            {
                tracing::debug!(target = "discovery::memory", topic = %outbound_topic, "remote endpoint gone");
                break;
            }
        }
        out_bus.close_topic(&outbound_topic);
    });

    tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(message) => {
                    if inbound_tx.send(message.payload).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "discovery::memory", skipped, "session topic lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        bus.close_topic(&inbound_topic);
    });

    SessionLink {
        peer: remote,
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

async fn listen_for_invites(
    bus: Arc<LocalBus>,
    service_type: String,
    local: Peer,
    response: Arc<Mutex<InviteResponse>>,
    mut invites: broadcast::Receiver<BusMessage>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    loop {
        let message = match invites.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Ok(invite) = serde_json::from_slice::<InviteFrame>(&message.payload) else {
            tracing::debug!(target = "discovery::memory", "ignoring malformed invitation");
            continue;
        };
        let answer = *response.lock();
        tracing::debug!(
            target = "discovery::memory",
            from = %invite.peer_id,
            session = %invite.session,
            ?answer,
            "invitation received"
        );
        let accepted = match answer {
            InviteResponse::Ignore => continue,
            InviteResponse::Decline => false,
            InviteResponse::Accept => true,
        };

        let remote = Peer::from_advertisement(invite.peer_id.clone(), invite.name, &invite.info);
        let inbound_topic = session_topic(&service_type, &invite.session, &local.id);
        let link = accepted.then(|| {
            let subscription = bus.subscribe(&inbound_topic);
            bridge(
                Arc::clone(&bus),
                local.id.clone(),
                remote,
                subscription,
                inbound_topic,
                session_topic(&service_type, &invite.session, &invite.peer_id),
            )
        });

        let reply = match serde_json::to_vec(&InviteReply { accepted }) {
            Ok(reply) => Bytes::from(reply),
            Err(_) => continue,
        };
        if bus
            .publish(&reply_topic(&service_type, &invite.session), local.id.as_str(), reply)
            .is_err()
        {
            tracing::debug!(target = "discovery::memory", from = %invite.peer_id, "inviter stopped waiting");
            if accepted {
                bus.close_topic(&session_topic(&service_type, &invite.session, &local.id));
            }
            continue;
        }
        if let Some(link) = link {
            let _ = events.send(BackendEvent::Incoming(link));
        }
    }
}

async fn watch_presence(
    local_id: PeerId,
    mut presence: broadcast::Receiver<BusMessage>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    loop {
        let message = match presence.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if message.origin == local_id.as_str() {
            continue;
        }
        let event = match serde_json::from_slice::<PresenceFrame>(&message.payload) {
            Ok(PresenceFrame::Announce {
                peer_id,
                name,
                info,
            }) => BackendEvent::Found {
                id: peer_id,
                display_name: name,
                info,
            },
            Ok(PresenceFrame::Withdraw { peer_id }) => BackendEvent::Lost(peer_id),
            Ok(PresenceFrame::Query) => continue,
            Err(_) => continue,
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

#[async_trait]
impl DiscoveryBackend for MemoryDiscovery {
    async fn start_advertising(&self, local: &Peer) -> Result<(), DiscoveryError> {
        if self.tasks.lock().advertising.is_some() {
            return Ok(());
        }
        *self.local.lock() = Some(local.clone());

        let invites = self.bus.subscribe(&self.invite_topic(&local.id));
        let invite_task = tokio::spawn(listen_for_invites(
            Arc::clone(&self.bus),
            self.service_type.clone(),
            local.clone(),
            Arc::clone(&self.response),
            invites,
            self.events_tx.clone(),
        ));

        // answer late browsers' queries with a fresh announcement
        let mut presence = self.bus.subscribe(&self.presence_topic());
        let bus = Arc::clone(&self.bus);
        let topic = self.presence_topic();
        let announce = PresenceFrame::Announce {
            peer_id: local.id.clone(),
            name: local.display_name.clone(),
            info: local.discovery_info(),
        };
        let payload = serde_json::to_vec(&announce)
            .map(Bytes::from)
            .map_err(|err| DiscoveryError::Advertise(err.to_string()))?;
        let origin = local.id.clone();
        let announce_payload = payload.clone();
        let advertise_task = tokio::spawn(async move {
            loop {
                match presence.recv().await {
                    Ok(message) if message.origin != origin.as_str() => {
                        if matches!(
                            serde_json::from_slice::<PresenceFrame>(&message.payload),
                            Ok(PresenceFrame::Query)
                        ) {
                            let _ = bus.publish(&topic, origin.as_str(), announce_payload.clone());
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.advertising = Some(advertise_task);
            tasks.invites = Some(invite_task);
        }
        let _ = self
            .bus
            .publish(&self.presence_topic(), local.id.as_str(), payload);
        tracing::debug!(target = "discovery::memory", peer = %local.id, "advertising");
        Ok(())
    }

    async fn stop_advertising(&self) {
        let (advertising, invites) = {
            let mut tasks = self.tasks.lock();
            (tasks.advertising.take(), tasks.invites.take())
        };
        let Some(advertising) = advertising else {
            return;
        };
        advertising.abort();
        if let Some(invites) = invites {
            invites.abort();
        }
        let local = self.local.lock().clone();
        if let Some(local) = local {
            self.publish_presence(
                &local.id,
                &PresenceFrame::Withdraw {
                    peer_id: local.id.clone(),
                },
            );
        }
    }

    async fn start_browsing(&self, local: &Peer) -> Result<(), DiscoveryError> {
        if self.tasks.lock().browsing.is_some() {
            return Ok(());
        }
        *self.local.lock() = Some(local.clone());
        let presence = self.bus.subscribe(&self.presence_topic());
        let task = tokio::spawn(watch_presence(
            local.id.clone(),
            presence,
            self.events_tx.clone(),
        ));
        self.tasks.lock().browsing = Some(task);
        self.publish_presence(&local.id, &PresenceFrame::Query);
        tracing::debug!(target = "discovery::memory", peer = %local.id, "browsing");
        Ok(())
    }

    async fn stop_browsing(&self) {
        if let Some(task) = self.tasks.lock().browsing.take() {
            task.abort();
        }
    }

    async fn invite(&self, local: &Peer, remote: &Peer) -> Result<SessionLink, DiscoveryError> {
        let session = uuid::Uuid::new_v4().to_string();
        let reply = reply_topic(&self.service_type, &session);
        let mut replies = self.bus.subscribe(&reply);
        let inbound_topic = session_topic(&self.service_type, &session, &local.id);
        let subscription = self.bus.subscribe(&inbound_topic);

        let frame = InviteFrame {
            session: session.clone(),
            peer_id: local.id.clone(),
            name: local.display_name.clone(),
            info: local.discovery_info(),
        };
        let payload = serde_json::to_vec(&frame).map_err(|err| DiscoveryError::Invitation {
            peer: remote.id.clone(),
            reason: err.to_string(),
        })?;
        if self
            .bus
            .publish(&self.invite_topic(&remote.id), local.id.as_str(), Bytes::from(payload))
            .is_err()
        {
            self.bus.close_topic(&reply);
            self.bus.close_topic(&inbound_topic);
            return Err(DiscoveryError::UnknownPeer(remote.id.clone()));
        }

        loop {
            let message = match replies.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.bus.close_topic(&inbound_topic);
                    return Err(DiscoveryError::Invitation {
                        peer: remote.id.clone(),
                        reason: "reply topic closed".into(),
                    });
                }
            };
            let Ok(answer) = serde_json::from_slice::<InviteReply>(&message.payload) else {
                continue;
            };
            self.bus.close_topic(&reply);
            if !answer.accepted {
                self.bus.close_topic(&inbound_topic);
                return Err(DiscoveryError::Declined(remote.id.clone()));
            }
            let outbound_topic = session_topic(&self.service_type, &session, &remote.id);
            return Ok(bridge(
                Arc::clone(&self.bus),
                local.id.clone(),
                remote.clone(),
                subscription,
                inbound_topic,
                outbound_topic,
            ));
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BackendEvent>> {
        self.events_rx.lock().take()
    }
}

impl Drop for MemoryDiscovery {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for task in [
            tasks.advertising.take(),
            tasks.invites.take(),
            tasks.browsing.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{PeerRole, SERVICE_TYPE};

    fn host() -> Peer {
        Peer::new(PeerId::new("host-1"), "Studio Mac", PeerRole::Host)
    }

    fn viewer() -> Peer {
        Peer::new(PeerId::new("viewer-1"), "Vision Pro", PeerRole::Viewer)
    }

    #[test_timeout::tokio_timeout_test]
    async fn browser_finds_and_loses_advertiser() {
        let bus = Arc::new(LocalBus::new());
        let advertiser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE);
        let browser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE);
        let mut events = browser.take_events().unwrap();

        advertiser.start_advertising(&host()).await.unwrap();
        // browsing after the announcement still finds the peer via Query
        browser.start_browsing(&viewer()).await.unwrap();

        match events.recv().await.unwrap() {
            BackendEvent::Found {
                id,
                display_name,
                info,
            } => {
                assert_eq!(id, host().id);
                assert_eq!(display_name, "Studio Mac");
                assert_eq!(info.get("type").map(String::as_str), Some("host"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        advertiser.stop_advertising().await;
        match events.recv().await.unwrap() {
            BackendEvent::Lost(id) => assert_eq!(id, host().id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepted_invitation_links_both_sides() {
        let bus = Arc::new(LocalBus::new());
        let advertiser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE);
        let browser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE);
        let mut host_events = advertiser.take_events().unwrap();
        advertiser.start_advertising(&host()).await.unwrap();

        let mut outbound = browser.invite(&viewer(), &host()).await.unwrap();
        let mut inbound = match host_events.recv().await.unwrap() {
            BackendEvent::Incoming(link) => link,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(inbound.peer.id, viewer().id);
        assert_eq!(inbound.peer.role, Some(PeerRole::Viewer));

        outbound.outbound.send(Bytes::from_static(b"offer")).unwrap();
        assert_eq!(inbound.inbound.recv().await.unwrap(), Bytes::from_static(b"offer"));
        inbound.outbound.send(Bytes::from_static(b"answer")).unwrap();
        assert_eq!(outbound.inbound.recv().await.unwrap(), Bytes::from_static(b"answer"));

        // dropping one side ends the other side's inbound stream
        drop(inbound);
        assert_eq!(outbound.inbound.recv().await, None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn declined_and_unknown_invitations_fail() {
        let bus = Arc::new(LocalBus::new());
        let advertiser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE)
            .with_invite_response(InviteResponse::Decline);
        let browser = MemoryDiscovery::new(Arc::clone(&bus), SERVICE_TYPE);

        let err = browser.invite(&viewer(), &host()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownPeer(_)));

        advertiser.start_advertising(&host()).await.unwrap();
        let err = browser.invite(&viewer(), &host()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Declined(_)));
    }
}
