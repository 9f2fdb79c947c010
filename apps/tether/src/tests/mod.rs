mod telemetry_loop;

use std::sync::Arc;
use std::time::Duration;

use crate::discovery::{Peer, PeerId, PeerRole, SessionLink};
use crate::session::{ConnectionPhase, SessionConfig, SessionHandle};
use crate::signaling::SignalingChannel;
use crate::transport::mock::{MockTransport, MockTransportHandle};

/// Polls `condition` until it holds. Under a paused clock each poll also
/// lets pending timers fire.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(crate) async fn reach_phase(
    session: &SessionHandle,
    expected: impl Fn(&ConnectionPhase) -> bool,
) -> ConnectionPhase {
    let mut phase = session.subscribe_phase();
    let reached = phase
        .wait_for(|current| expected(current))
        .await
        .expect("session actor alive")
        .clone();
    reached
}

pub(crate) fn spawn_mock_session(
    role: PeerRole,
    channel: SignalingChannel,
) -> (SessionHandle, MockTransportHandle) {
    let (transport, handle) = MockTransport::new(role.as_str());
    let session = SessionHandle::spawn(SessionConfig::new(role), Arc::new(transport), channel)
        .expect("fresh transport");
    (session, handle)
}

/// A viewer session whose remote end is driven by the test directly.
pub(crate) fn viewer_with_remote() -> (SessionHandle, MockTransportHandle, SignalingChannel) {
    let viewer = Peer::new(PeerId::new("viewer"), "Headset", PeerRole::Viewer);
    let host = Peer::new(PeerId::new("host"), "Studio", PeerRole::Host);
    let (ours, theirs) = SessionLink::pair(viewer, host);
    let (session, handle) = spawn_mock_session(PeerRole::Viewer, SignalingChannel::new(ours));
    (session, handle, SignalingChannel::new(theirs))
}
