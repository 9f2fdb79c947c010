pub mod channel;
pub mod envelope;

pub use channel::{SignalingChannel, SignalingReceiver, SignalingSender};
pub use envelope::{EnvelopeError, IceCandidate, SdpKind, SessionDescription, SignalingEnvelope};
