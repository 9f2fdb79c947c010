use std::sync::Arc;

use tokio::sync::watch;

use super::phase::ConnectionPhase;
use crate::discovery::PeerRole;
use crate::metrics;
use crate::signaling::{
    IceCandidate, SdpKind, SessionDescription, SignalingEnvelope, SignalingSender,
};
use crate::transport::{
    MediaTransport, NegotiationOptions, RemoteVideo, TransportError, TransportEvent,
    TransportState,
};

/// What happens to remote candidates that arrive before the remote
/// description has been applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidatePolicy {
    #[default]
    Discard,
    /// Queue them and apply them right after the remote description.
    Buffer,
}

/// Work the owner of the controller has to carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StartTelemetry,
    StopTelemetry,
}

/// Session state machine: turns signaling envelopes and transport
/// callbacks into negotiation steps and phase transitions.
///
/// All methods take `&mut self`; the session actor is the only caller, so
/// transitions are applied one input at a time.
pub struct ConnectionController {
    role: PeerRole,
    transport: Arc<dyn MediaTransport>,
    signaling: SignalingSender,
    policy: CandidatePolicy,
    phase_tx: watch::Sender<ConnectionPhase>,
    video_tx: watch::Sender<Option<RemoteVideo>>,
    local_description_set: bool,
    remote_description_set: bool,
    offer_outstanding: bool,
    held_local: Vec<IceCandidate>,
    held_remote: Vec<IceCandidate>,
    telemetry_started: bool,
    last_error: Option<String>,
}

impl ConnectionController {
    pub fn new(
        role: PeerRole,
        transport: Arc<dyn MediaTransport>,
        signaling: SignalingSender,
        policy: CandidatePolicy,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::New);
        let (video_tx, _) = watch::channel(None);
        Self {
            role,
            transport,
            signaling,
            policy,
            phase_tx,
            video_tx,
            local_description_set: false,
            remote_description_set: false,
            offer_outstanding: false,
            held_local: Vec::new(),
            held_remote: Vec::new(),
            telemetry_started: false,
            last_error: None,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase_tx.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn subscribe_remote_video(&self) -> watch::Receiver<Option<RemoteVideo>> {
        self.video_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Begins session setup. The host creates and sends its offer; the
    /// viewer has nothing to do until an offer arrives. Idempotent.
    pub async fn start(&mut self) {
        if self.phase() != ConnectionPhase::New {
            return;
        }
        match self.role {
            PeerRole::Host => {
                self.transition(ConnectionPhase::Negotiating { role: self.role });
                self.send_offer().await;
            }
            PeerRole::Viewer => {
                tracing::debug!(
                    target = "session",
                    peer = %self.signaling.peer_id(),
                    "waiting for remote offer"
                );
            }
        }
    }

    async fn send_offer(&mut self) {
        let offer = match self
            .transport
            .create_offer(NegotiationOptions::video_only())
            .await
        {
            Ok(offer) => offer,
            Err(err) => return self.negotiation_error("create_offer", err),
        };
        if let Err(err) = self.transport.set_local_description(offer.clone()).await {
            return self.negotiation_error("set_local_offer", err);
        }
        self.local_description_set = true;
        self.offer_outstanding = true;
        self.signaling.send(&offer.into());
        self.flush_local_candidates();
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        if self.phase().is_terminal() {
            tracing::debug!(
                target = "session",
                peer = %self.signaling.peer_id(),
                kind = envelope.kind(),
                phase = self.phase().name(),
                "ignoring envelope after session ended"
            );
            return;
        }
        match envelope {
            SignalingEnvelope::SessionDescription(desc) => match (self.role, desc.kind) {
                (PeerRole::Viewer, SdpKind::Offer) => self.accept_offer(desc).await,
                (PeerRole::Host, SdpKind::Answer) => self.accept_answer(desc).await,
                (role, kind) => {
                    tracing::warn!(
                        target = "session",
                        peer = %self.signaling.peer_id(),
                        %role,
                        kind = kind.as_str(),
                        "dropping unexpected session description"
                    );
                }
            },
            SignalingEnvelope::IceCandidate(candidate) => {
                self.handle_remote_candidate(candidate).await
            }
        }
    }

    async fn accept_offer(&mut self, offer: SessionDescription) {
        if self.remote_description_set {
            tracing::warn!(
                target = "session",
                peer = %self.signaling.peer_id(),
                "dropping repeated offer"
            );
            return;
        }
        if self.phase() == ConnectionPhase::New {
            self.transition(ConnectionPhase::Negotiating { role: self.role });
        }
        if let Err(err) = self.transport.set_remote_description(offer).await {
            return self.negotiation_error("set_remote_offer", err);
        }
        self.remote_description_set = true;
        self.apply_held_remote_candidates().await;

        let answer = match self
            .transport
            .create_answer(NegotiationOptions::video_only())
            .await
        {
            Ok(answer) => answer,
            Err(err) => return self.negotiation_error("create_answer", err),
        };
        if let Err(err) = self.transport.set_local_description(answer.clone()).await {
            return self.negotiation_error("set_local_answer", err);
        }
        self.local_description_set = true;
        self.signaling.send(&answer.into());
        self.flush_local_candidates();
    }

    async fn accept_answer(&mut self, answer: SessionDescription) {
        if !self.offer_outstanding {
            tracing::warn!(
                target = "session",
                peer = %self.signaling.peer_id(),
                "dropping answer without an outstanding offer"
            );
            return;
        }
        if let Err(err) = self.transport.set_remote_description(answer).await {
            return self.negotiation_error("set_remote_answer", err);
        }
        self.offer_outstanding = false;
        self.remote_description_set = true;
        self.apply_held_remote_candidates().await;
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.remote_description_set {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                self.negotiation_error("add_candidate", err);
            }
            return;
        }
        match self.policy {
            CandidatePolicy::Discard => {
                tracing::debug!(
                    target = "session",
                    peer = %self.signaling.peer_id(),
                    "discarding candidate received before remote description"
                );
                metrics::SIGNALING_DROPPED
                    .with_label_values(&["early_candidate"])
                    .inc();
            }
            CandidatePolicy::Buffer => self.held_remote.push(candidate),
        }
    }

    async fn apply_held_remote_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.held_remote) {
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                self.negotiation_error("add_candidate", err);
            }
        }
    }

    fn flush_local_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.held_local) {
            self.signaling.send(&candidate.into());
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<Effect> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.phase().is_terminal() {
                    return None;
                }
                if self.local_description_set {
                    self.signaling.send(&candidate.into());
                } else {
                    self.held_local.push(candidate);
                }
                None
            }
            TransportEvent::StateChanged(state) => self.handle_transport_state(state),
            TransportEvent::RemoteVideo(video) => {
                if !self.phase().is_terminal() {
                    self.video_tx.send_replace(Some(video));
                }
                None
            }
        }
    }

    fn handle_transport_state(&mut self, state: TransportState) -> Option<Effect> {
        let phase = self.phase();
        tracing::debug!(
            target = "session",
            peer = %self.signaling.peer_id(),
            transport = state.as_str(),
            phase = phase.name(),
            "transport state changed"
        );
        match (state, phase) {
            (_, phase) if phase.is_terminal() => None,
            (TransportState::Connected, ConnectionPhase::Negotiating { .. }) => {
                self.transition(ConnectionPhase::Connected);
                if self.telemetry_started {
                    None
                } else {
                    self.telemetry_started = true;
                    Some(Effect::StartTelemetry)
                }
            }
            (TransportState::Connected, ConnectionPhase::Disconnected) => {
                self.transition(ConnectionPhase::Connected);
                None
            }
            (TransportState::Disconnected, ConnectionPhase::Connected) => {
                self.transition(ConnectionPhase::Disconnected);
                None
            }
            (TransportState::Failed, _) => {
                self.fail("transport failed".to_string());
                Some(Effect::StopTelemetry)
            }
            (TransportState::Closed, _) => {
                self.fail("transport closed unexpectedly".to_string());
                Some(Effect::StopTelemetry)
            }
            _ => None,
        }
    }

    /// Releases the transport and moves to `Closed`. Safe to call any
    /// number of times.
    pub async fn close(&mut self) -> Option<Effect> {
        if self.phase() == ConnectionPhase::Closed {
            return None;
        }
        if let Err(err) = self.transport.close().await {
            tracing::warn!(
                target = "session",
                peer = %self.signaling.peer_id(),
                error = %err,
                "transport close reported an error"
            );
        }
        self.held_local.clear();
        self.held_remote.clear();
        self.transition(ConnectionPhase::Closed);
        self.video_tx.send_replace(None);
        Some(Effect::StopTelemetry)
    }

    fn fail(&mut self, reason: String) {
        self.last_error = Some(reason.clone());
        self.transition(ConnectionPhase::Failed { reason });
    }

    fn negotiation_error(&mut self, stage: &'static str, err: TransportError) {
        tracing::warn!(
            target = "session",
            peer = %self.signaling.peer_id(),
            stage,
            error = %err,
            "negotiation step failed"
        );
        metrics::NEGOTIATION_ERRORS
            .with_label_values(&[stage])
            .inc();
        self.last_error = Some(format!("{stage}: {err}"));
    }

    fn transition(&mut self, next: ConnectionPhase) {
        let previous = self.phase_tx.send_replace(next.clone());
        if previous == next {
            return;
        }
        tracing::info!(
            target = "session",
            peer = %self.signaling.peer_id(),
            from = previous.name(),
            to = %next,
            "connection phase changed"
        );
        metrics::PHASE_TRANSITIONS
            .with_label_values(&[previous.name(), next.name()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Peer, PeerId, SessionLink};
    use crate::signaling::{SignalingChannel, SignalingReceiver};
    use crate::transport::mock::{MockCall, MockOp, MockTransport, MockTransportHandle};

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        }
    }

    fn controller(
        role: PeerRole,
        policy: CandidatePolicy,
    ) -> (ConnectionController, MockTransportHandle, SignalingReceiver) {
        let local = Peer::new(PeerId::new("local"), "Local", role);
        let remote = Peer::new(PeerId::new("remote"), "Remote", role.counterpart());
        let (ours, theirs) = SessionLink::pair(local, remote);
        let (sender, _) = SignalingChannel::new(ours).split();
        let (_, receiver) = SignalingChannel::new(theirs).split();
        let (transport, handle) = MockTransport::new(role.as_str());
        let controller = ConnectionController::new(role, Arc::new(transport), sender, policy);
        (controller, handle, receiver)
    }

    async fn negotiated_host() -> (ConnectionController, MockTransportHandle, SignalingReceiver) {
        let (mut host, handle, peer) = controller(PeerRole::Host, CandidatePolicy::Discard);
        host.start().await;
        host.handle_envelope(SessionDescription::answer("v=0 answer").into())
            .await;
        (host, handle, peer)
    }

    #[test_timeout::tokio_timeout_test]
    async fn host_offers_video_only_and_trickles_after_local_description() {
        let (mut host, handle, mut peer) = controller(PeerRole::Host, CandidatePolicy::Discard);
        handle.gather_on_local_description(vec![candidate(1)]);
        // surfaced before any local description exists
        assert_eq!(
            host.handle_transport_event(TransportEvent::LocalCandidate(candidate(2))),
            None
        );

        host.start().await;
        assert_eq!(
            host.phase(),
            ConnectionPhase::Negotiating {
                role: PeerRole::Host
            }
        );
        assert_eq!(
            handle.calls()[0],
            MockCall::CreateOffer(NegotiationOptions {
                video: true,
                audio: false,
                voice_activity_detection: false,
            })
        );

        let first = peer.recv().await.unwrap();
        assert!(matches!(
            first,
            SignalingEnvelope::SessionDescription(SessionDescription {
                kind: SdpKind::Offer,
                ..
            })
        ));
        assert_eq!(peer.recv().await.unwrap(), candidate(2).into());

        // gathered candidates reach the controller through the event stream
        let mut events = handle_events(&mut host);
        let gathered = events.recv().await.unwrap();
        host.handle_transport_event(gathered);
        assert_eq!(peer.recv().await.unwrap(), candidate(1).into());
    }

    fn handle_events(
        controller: &mut ConnectionController,
    ) -> tokio::sync::mpsc::UnboundedReceiver<TransportEvent> {
        controller.transport.take_events().unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn viewer_answers_remote_offer() {
        let (mut viewer, handle, mut peer) = controller(PeerRole::Viewer, CandidatePolicy::Discard);
        viewer.start().await;
        assert_eq!(viewer.phase(), ConnectionPhase::New);

        viewer
            .handle_envelope(SessionDescription::offer("v=0 offer").into())
            .await;
        assert_eq!(
            viewer.phase(),
            ConnectionPhase::Negotiating {
                role: PeerRole::Viewer
            }
        );
        let calls = handle.calls();
        assert_eq!(calls[0], MockCall::SetRemote(SessionDescription::offer("v=0 offer")));
        assert_eq!(calls[1], MockCall::CreateAnswer(NegotiationOptions::video_only()));
        assert!(matches!(calls[2], MockCall::SetLocal(_)));
        assert!(matches!(
            peer.recv().await.unwrap(),
            SignalingEnvelope::SessionDescription(SessionDescription {
                kind: SdpKind::Answer,
                ..
            })
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_remote_candidates_are_discarded_by_default() {
        let (mut viewer, handle, _peer) = controller(PeerRole::Viewer, CandidatePolicy::Discard);
        viewer.handle_envelope(candidate(3).into()).await;
        viewer
            .handle_envelope(SessionDescription::offer("v=0 offer").into())
            .await;
        viewer.handle_envelope(candidate(4).into()).await;
        let added: Vec<_> = handle
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(added, vec![candidate(4)]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn buffered_remote_candidates_follow_the_remote_description() {
        let (mut viewer, handle, _peer) = controller(PeerRole::Viewer, CandidatePolicy::Buffer);
        viewer.handle_envelope(candidate(3).into()).await;
        viewer.handle_envelope(candidate(5).into()).await;
        viewer
            .handle_envelope(SessionDescription::offer("v=0 offer").into())
            .await;
        let calls = handle.calls();
        assert!(matches!(calls[0], MockCall::SetRemote(_)));
        assert_eq!(calls[1], MockCall::AddCandidate(candidate(3)));
        assert_eq!(calls[2], MockCall::AddCandidate(candidate(5)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn connected_report_in_new_phase_is_ignored() {
        let (mut host, _handle, _peer) = controller(PeerRole::Host, CandidatePolicy::Discard);
        let effect =
            host.handle_transport_event(TransportEvent::StateChanged(TransportState::Connected));
        assert_eq!(effect, None);
        assert_eq!(host.phase(), ConnectionPhase::New);
    }

    #[test_timeout::tokio_timeout_test]
    async fn telemetry_starts_once_per_negotiation() {
        let (mut host, _handle, _peer) = negotiated_host().await;
        let connected = TransportEvent::StateChanged(TransportState::Connected);
        let disconnected = TransportEvent::StateChanged(TransportState::Disconnected);

        assert_eq!(
            host.handle_transport_event(connected.clone()),
            Some(Effect::StartTelemetry)
        );
        assert_eq!(host.handle_transport_event(connected.clone()), None);
        assert_eq!(host.handle_transport_event(disconnected), None);
        assert_eq!(host.phase(), ConnectionPhase::Disconnected);
        assert_eq!(host.handle_transport_event(connected), None);
        assert_eq!(host.phase(), ConnectionPhase::Connected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn failure_is_terminal() {
        let (mut host, handle, _peer) = negotiated_host().await;
        host.handle_transport_event(TransportEvent::StateChanged(TransportState::Connected));
        let effect =
            host.handle_transport_event(TransportEvent::StateChanged(TransportState::Failed));
        assert_eq!(effect, Some(Effect::StopTelemetry));
        assert!(matches!(host.phase(), ConnectionPhase::Failed { .. }));
        assert_eq!(host.last_error(), Some("transport failed"));

        let before = handle.calls().len();
        host.handle_envelope(candidate(9).into()).await;
        assert_eq!(handle.calls().len(), before);
        assert_eq!(
            host.handle_transport_event(TransportEvent::StateChanged(TransportState::Connected)),
            None
        );
        assert!(matches!(host.phase(), ConnectionPhase::Failed { .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn negotiation_errors_keep_negotiating() {
        let (mut host, handle, _peer) = controller(PeerRole::Host, CandidatePolicy::Discard);
        handle.fail_next(MockOp::SetLocal);
        host.start().await;
        assert_eq!(
            host.phase(),
            ConnectionPhase::Negotiating {
                role: PeerRole::Host
            }
        );
        assert!(host.last_error().unwrap().starts_with("set_local_offer"));

        // no offer went out, so an answer has nothing to complete
        host.handle_envelope(SessionDescription::answer("v=0").into())
            .await;
        assert_eq!(
            handle.count(|call| matches!(call, MockCall::SetRemote(_))),
            0
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn unexpected_descriptions_are_dropped() {
        let (mut host, handle, _peer) = negotiated_host().await;
        host.handle_envelope(SessionDescription::offer("v=0 rogue").into())
            .await;
        host.handle_envelope(SessionDescription::answer("v=0 again").into())
            .await;
        assert_eq!(
            handle.count(|call| matches!(call, MockCall::SetRemote(_))),
            1
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_idempotent() {
        let (mut host, handle, _peer) = negotiated_host().await;
        let mut phase = host.subscribe_phase();
        assert_eq!(host.close().await, Some(Effect::StopTelemetry));
        assert_eq!(host.close().await, None);
        assert_eq!(*phase.borrow_and_update(), ConnectionPhase::Closed);
        assert_eq!(handle.count(|call| *call == MockCall::Close), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_video_is_published() {
        let (mut viewer, _handle, _peer) = controller(PeerRole::Viewer, CandidatePolicy::Discard);
        let video = viewer.subscribe_remote_video();
        let track = RemoteVideo {
            track_id: "video".into(),
            mime_type: "video/H264".into(),
        };
        viewer.handle_transport_event(TransportEvent::RemoteVideo(track.clone()));
        assert_eq!(*video.borrow(), Some(track));
        viewer.close().await;
        assert_eq!(*video.borrow(), None);
    }
}
