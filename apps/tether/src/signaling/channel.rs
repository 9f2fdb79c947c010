use bytes::Bytes;
use tokio::sync::mpsc;

use super::envelope::SignalingEnvelope;
use crate::discovery::{Peer, PeerId, SessionLink};
use crate::metrics;

/// Envelope-level view of a [`SessionLink`].
///
/// Sends are fire-and-forget: a failed send is logged and counted but never
/// retried or reported back; a stalled negotiation surfaces through the
/// connection phase instead.
#[derive(Debug)]
pub struct SignalingChannel {
    peer: Peer,
    sender: SignalingSender,
    receiver: SignalingReceiver,
}

impl SignalingChannel {
    pub fn new(link: SessionLink) -> Self {
        let SessionLink {
            peer,
            outbound,
            inbound,
        } = link;
        Self {
            sender: SignalingSender {
                peer_id: peer.id.clone(),
                outbound,
            },
            receiver: SignalingReceiver {
                peer_id: peer.id.clone(),
                inbound,
            },
            peer,
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn send(&self, envelope: &SignalingEnvelope) {
        self.sender.send(envelope);
    }

    pub fn split(self) -> (SignalingSender, SignalingReceiver) {
        (self.sender, self.receiver)
    }
}

#[derive(Debug, Clone)]
pub struct SignalingSender {
    peer_id: PeerId,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl SignalingSender {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn send(&self, envelope: &SignalingEnvelope) {
        let kind = envelope.kind();
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    target = "signaling",
                    peer = %self.peer_id,
                    error = %err,
                    "dropping envelope that failed to encode"
                );
                metrics::SIGNALING_DROPPED
                    .with_label_values(&["encode"])
                    .inc();
                return;
            }
        };
        let len = bytes.len();
        if self.outbound.send(bytes).is_err() {
            tracing::warn!(
                target = "signaling",
                peer = %self.peer_id,
                kind,
                "signaling session closed; envelope not sent"
            );
            metrics::SIGNALING_DROPPED
                .with_label_values(&["closed"])
                .inc();
            return;
        }
        tracing::debug!(target = "signaling", peer = %self.peer_id, kind, len, "sent envelope");
        metrics::SIGNALING_MESSAGES
            .with_label_values(&["out", kind])
            .inc();
    }
}

#[derive(Debug)]
pub struct SignalingReceiver {
    peer_id: PeerId,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl SignalingReceiver {
    /// Next decodable envelope; undecodable messages are skipped. `None`
    /// once the session is gone.
    pub async fn recv(&mut self) -> Option<SignalingEnvelope> {
        loop {
            let bytes = self.inbound.recv().await?;
            if let Some(envelope) = on_receive(&self.peer_id, &bytes) {
                return Some(envelope);
            }
        }
    }
}

/// Decodes one inbound message, dropping it when it matches no known shape.
pub fn on_receive(peer_id: &PeerId, bytes: &[u8]) -> Option<SignalingEnvelope> {
    match SignalingEnvelope::decode(bytes) {
        Ok(envelope) => {
            tracing::debug!(
                target = "signaling",
                peer = %peer_id,
                kind = envelope.kind(),
                len = bytes.len(),
                "received envelope"
            );
            metrics::SIGNALING_MESSAGES
                .with_label_values(&["in", envelope.kind()])
                .inc();
            Some(envelope)
        }
        Err(err) => {
            tracing::debug!(
                target = "signaling",
                peer = %peer_id,
                error = %err,
                "ignoring undecodable signaling message"
            );
            metrics::SIGNALING_DROPPED
                .with_label_values(&["decode"])
                .inc();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::PeerRole;
    use crate::signaling::{IceCandidate, SessionDescription};

    fn channels() -> (SignalingChannel, SignalingChannel) {
        let host = Peer::new(PeerId::new("host"), "Host", PeerRole::Host);
        let viewer = Peer::new(PeerId::new("viewer"), "Viewer", PeerRole::Viewer);
        let (a, b) = SessionLink::pair(host, viewer);
        (SignalingChannel::new(a), SignalingChannel::new(b))
    }

    #[tokio::test]
    async fn envelopes_arrive_in_send_order() {
        let (host, viewer) = channels();
        assert_eq!(host.peer().id, PeerId::new("viewer"));
        let (_, mut rx) = viewer.split();

        let offer: SignalingEnvelope = SessionDescription::offer("v=0").into();
        let candidate: SignalingEnvelope = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mline_index: 0,
            sdp_mid: Some("0".into()),
        }
        .into();
        host.send(&offer);
        host.send(&candidate);

        assert_eq!(rx.recv().await, Some(offer));
        assert_eq!(rx.recv().await, Some(candidate));
    }

    #[tokio::test]
    async fn garbage_is_skipped_and_the_channel_keeps_working() {
        let host = Peer::new(PeerId::new("host"), "Host", PeerRole::Host);
        let viewer = Peer::new(PeerId::new("viewer"), "Viewer", PeerRole::Viewer);
        let (raw, link) = SessionLink::pair(host, viewer);
        let (_, mut rx) = SignalingChannel::new(link).split();

        raw.outbound.send(Bytes::from_static(b"\xff\xfe")).unwrap();
        raw.outbound.send(Bytes::from_static(br#"{"hello":"world"}"#)).unwrap();
        raw.outbound
            .send(Bytes::from_static(br#"{"type":"answer","sdp":"v=0"}"#))
            .unwrap();

        assert_eq!(rx.recv().await, Some(SessionDescription::answer("v=0").into()));
        drop(raw);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn sending_after_the_peer_left_does_not_panic() {
        let (host, viewer) = channels();
        drop(viewer);
        host.send(&SessionDescription::offer("v=0").into());
    }
}
