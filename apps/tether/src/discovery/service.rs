use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    BackendEvent, DEFAULT_INVITATION_TIMEOUT, DiscoveryBackend, DiscoveryError, Peer, PeerId,
    SERVICE_TYPE, SessionLink,
};
use crate::metrics;
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub service_type: String,
    pub invitation_timeout: Duration,
    /// Invite compatible peers as soon as they are found.
    pub auto_invite: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: SERVICE_TYPE.to_string(),
            invitation_timeout: DEFAULT_INVITATION_TIMEOUT,
            auto_invite: true,
        }
    }
}

#[derive(Debug)]
pub enum DiscoveryEvent {
    PeerFound(Peer),
    PeerLost(PeerId),
    SessionReady(SignalingChannel),
    InvitationAbandoned { peer: PeerId, reason: String },
    Error(String),
}

#[derive(Default)]
struct ServiceState {
    advertising: bool,
    browsing: bool,
    peers: HashMap<PeerId, Peer>,
    invitations: HashMap<PeerId, JoinHandle<()>>,
    /// Peers whose invitation was abandoned; not retried until seen again.
    abandoned: HashSet<PeerId>,
    session_established: bool,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    local: Peer,
    config: DiscoveryConfig,
    backend: Arc<dyn DiscoveryBackend>,
    state: Mutex<ServiceState>,
    events_tx: mpsc::UnboundedSender<DiscoveryEvent>,
}

/// Finds a counterpart peer on the local network and turns the first
/// accepted invitation (either direction) into a [`SignalingChannel`].
///
/// Everything the service learns is published as [`DiscoveryEvent`]s on the
/// receiver returned by [`take_events`](Self::take_events).
pub struct PeerDiscoveryService {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DiscoveryEvent>>>,
}

impl PeerDiscoveryService {
    pub fn new(local: Peer, config: DiscoveryConfig, backend: Arc<dyn DiscoveryBackend>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                local,
                config,
                backend,
                state: Mutex::new(ServiceState::default()),
                events_tx,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn local_peer(&self) -> &Peer {
        &self.inner.local
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.inner.config
    }

    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        self.events_rx.lock().take()
    }

    pub async fn start_advertising(&self) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if state.advertising {
                return Ok(());
            }
            // backend events can arrive before the start call returns
            state.advertising = true;
        }
        let started = match self.ensure_pump() {
            Ok(()) => self.inner.backend.start_advertising(&self.inner.local).await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            self.inner.state.lock().advertising = false;
            return Err(self.inner.report(err));
        }
        tracing::info!(
            target = "discovery",
            peer = %self.inner.local.id,
            service = %self.inner.config.service_type,
            "advertising started"
        );
        Ok(())
    }

    pub async fn start_browsing(&self) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if state.browsing {
                return Ok(());
            }
            // backend events can arrive before the start call returns
            state.browsing = true;
        }
        let started = match self.ensure_pump() {
            Ok(()) => self.inner.backend.start_browsing(&self.inner.local).await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            self.inner.state.lock().browsing = false;
            return Err(self.inner.report(err));
        }
        tracing::info!(
            target = "discovery",
            peer = %self.inner.local.id,
            service = %self.inner.config.service_type,
            "browsing started"
        );
        Ok(())
    }

    /// Stops advertising and browsing and abandons pending invitations.
    /// An already established [`SignalingChannel`] keeps working; once
    /// discovery is started again a new session may be established.
    pub async fn stop(&self) {
        let (advertising, browsing) = {
            let mut state = self.inner.state.lock();
            let flags = (state.advertising, state.browsing);
            state.advertising = false;
            state.browsing = false;
            state.session_established = false;
            for (_, task) in state.invitations.drain() {
                task.abort();
            }
            state.peers.clear();
            state.abandoned.clear();
            flags
        };
        metrics::VISIBLE_PEERS.set(0);
        if advertising {
            self.inner.backend.stop_advertising().await;
        }
        if browsing {
            self.inner.backend.stop_browsing().await;
        }
        if advertising || browsing {
            tracing::info!(target = "discovery", peer = %self.inner.local.id, "discovery stopped");
        }
    }

    /// Aborts every outstanding invitation, e.g. once session setup has
    /// started through some other path.
    pub fn cancel_invitations(&self) {
        let cancelled = self.inner.cancel_all_invitations();
        if cancelled > 0 {
            tracing::debug!(target = "discovery", cancelled, "invitations cancelled");
        }
    }

    pub fn pending_invitations(&self) -> Vec<PeerId> {
        let mut pending: Vec<PeerId> = self
            .inner
            .state
            .lock()
            .invitations
            .keys()
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    pub fn visible_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.inner.state.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Lets a running service pair again after the owner's session has
    /// closed or failed.
    pub fn session_ended(&self) {
        self.inner.state.lock().session_established = false;
    }

    pub fn is_session_established(&self) -> bool {
        self.inner.state.lock().session_established
    }

    /// Invites `peer` explicitly, bypassing the role check.
    pub fn invite(&self, peer: &PeerId) -> Result<(), DiscoveryError> {
        let target = self
            .inner
            .state
            .lock()
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownPeer(peer.clone()))?;
        Inner::send_invitation(&self.inner, target);
        Ok(())
    }

    fn ensure_pump(&self) -> Result<(), DiscoveryError> {
        let mut state = self.inner.state.lock();
        if state.pump.is_some() {
            return Ok(());
        }
        let events = self
            .inner
            .backend
            .take_events()
            .ok_or(DiscoveryError::EventsTaken)?;
        let inner = Arc::clone(&self.inner);
        state.pump = Some(tokio::spawn(Inner::pump(inner, events)));
        Ok(())
    }
}

impl Drop for PeerDiscoveryService {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        for (_, task) in state.invitations.drain() {
            task.abort();
        }
    }
}

impl Inner {
    fn report(&self, err: DiscoveryError) -> DiscoveryError {
        tracing::warn!(target = "discovery", error = %err, "discovery could not start");
        let _ = self.events_tx.send(DiscoveryEvent::Error(err.to_string()));
        err
    }

    async fn pump(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BackendEvent::Found {
                    id,
                    display_name,
                    info,
                } => {
                    if id == inner.local.id {
                        continue;
                    }
                    inner.on_found(Peer::from_advertisement(id, display_name, &info));
                }
                BackendEvent::Lost(id) => inner.on_lost(id),
                BackendEvent::Incoming(link) => inner.on_incoming(link),
            }
        }
    }

    fn on_found(self: &Arc<Self>, peer: Peer) {
        let invite = {
            let mut state = self.state.lock();
            if !state.advertising && !state.browsing {
                return;
            }
            let changed = state.peers.get(&peer.id) != Some(&peer);
            state.peers.insert(peer.id.clone(), peer.clone());
            metrics::VISIBLE_PEERS.set(state.peers.len() as i64);
            if changed {
                tracing::debug!(
                    target = "discovery",
                    peer = %peer.id,
                    name = %peer.display_name,
                    role = ?peer.role,
                    "peer found"
                );
                let _ = self.events_tx.send(DiscoveryEvent::PeerFound(peer.clone()));
            }
            self.config.auto_invite
                && state.browsing
                && !state.session_established
                && self
                    .local
                    .role
                    .is_some_and(|role| peer.role == Some(role.counterpart()))
                && !state.invitations.contains_key(&peer.id)
                && !state.abandoned.contains(&peer.id)
        };
        if invite {
            Inner::send_invitation(self, peer);
        }
    }

    fn on_lost(&self, id: PeerId) {
        let mut state = self.state.lock();
        state.abandoned.remove(&id);
        if let Some(task) = state.invitations.remove(&id) {
            task.abort();
            metrics::INVITATIONS.with_label_values(&["cancelled"]).inc();
            tracing::debug!(target = "discovery", peer = %id, "invitation cancelled; peer lost");
        }
        if state.peers.remove(&id).is_some() {
            metrics::VISIBLE_PEERS.set(state.peers.len() as i64);
            tracing::debug!(target = "discovery", peer = %id, "peer lost");
            let _ = self.events_tx.send(DiscoveryEvent::PeerLost(id));
        }
    }

    fn on_incoming(&self, link: SessionLink) {
        {
            let mut state = self.state.lock();
            if state.session_established {
                tracing::info!(
                    target = "discovery",
                    peer = %link.peer.id,
                    "refusing second session"
                );
                metrics::INVITATIONS.with_label_values(&["refused"]).inc();
                return;
            }
            state.session_established = true;
        }
        metrics::INVITATIONS.with_label_values(&["incoming"]).inc();
        self.cancel_all_invitations();
        tracing::info!(target = "discovery", peer = %link.peer.id, "session established by remote invitation");
        let _ = self
            .events_tx
            .send(DiscoveryEvent::SessionReady(SignalingChannel::new(link)));
    }

    fn send_invitation(inner: &Arc<Inner>, peer: Peer) {
        let mut state = inner.state.lock();
        if state.invitations.contains_key(&peer.id) || state.session_established {
            return;
        }
        let task_inner = Arc::clone(inner);
        let target = peer.clone();
        // the task cannot finish before it is registered: it needs this lock
        let task = tokio::spawn(async move {
            let timeout = task_inner.config.invitation_timeout;
            let outcome = tokio::time::timeout(
                timeout,
                task_inner.backend.invite(&task_inner.local, &target),
            )
            .await
            .unwrap_or_else(|_| {
                Err(DiscoveryError::InvitationTimeout {
                    peer: target.id.clone(),
                    timeout,
                })
            });
            task_inner.finish_invitation(target.id, outcome);
        });
        tracing::debug!(target = "discovery", peer = %peer.id, "invitation sent");
        state.invitations.insert(peer.id, task);
    }

    fn finish_invitation(&self, peer: PeerId, outcome: Result<SessionLink, DiscoveryError>) {
        let mut state = self.state.lock();
        if state.invitations.remove(&peer).is_none() {
            // cancelled while the backend was answering
            return;
        }
        match outcome {
            Ok(link) => {
                if state.session_established {
                    metrics::INVITATIONS.with_label_values(&["refused"]).inc();
                    return;
                }
                state.session_established = true;
                for (_, task) in state.invitations.drain() {
                    task.abort();
                }
                drop(state);
                metrics::INVITATIONS.with_label_values(&["accepted"]).inc();
                tracing::info!(target = "discovery", %peer, "invitation accepted");
                let _ = self
                    .events_tx
                    .send(DiscoveryEvent::SessionReady(SignalingChannel::new(link)));
            }
            Err(err) => {
                state.abandoned.insert(peer.clone());
                drop(state);
                let result = match err {
                    DiscoveryError::InvitationTimeout { .. } => "timeout",
                    DiscoveryError::Declined(_) => "declined",
                    _ => "failed",
                };
                metrics::INVITATIONS.with_label_values(&[result]).inc();
                tracing::info!(target = "discovery", %peer, error = %err, "invitation abandoned");
                let _ = self.events_tx.send(DiscoveryEvent::InvitationAbandoned {
                    peer,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn cancel_all_invitations(&self) -> usize {
        let mut state = self.state.lock();
        let cancelled = state.invitations.len();
        for (_, task) in state.invitations.drain() {
            task.abort();
        }
        if cancelled > 0 {
            metrics::INVITATIONS
                .with_label_values(&["cancelled"])
                .inc_by(cancelled as u64);
        }
        cancelled
    }
}
