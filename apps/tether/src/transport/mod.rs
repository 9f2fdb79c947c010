use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::signaling::{IceCandidate, SessionDescription};

pub mod mock;
pub mod webrtc;

/// What the negotiated session carries. The controller only ever asks for
/// video without audio and without voice-activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationOptions {
    pub video: bool,
    pub audio: bool,
    pub voice_activity_detection: bool,
}

impl NegotiationOptions {
    pub fn video_only() -> Self {
        Self {
            video: true,
            audio: false,
            voice_activity_detection: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

/// Describes the remote video track once the transport starts receiving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
    pub track_id: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteVideo(RemoteVideo),
}

/// One read of the transport's receive counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    pub frames_decoded: u64,
    pub bytes_received: u64,
    pub jitter_seconds: Option<f64>,
    pub round_trip_time_seconds: Option<f64>,
    pub sampled_at: Instant,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("stats query failed: {0}")]
    Stats(String),
    #[error("transport closed")]
    Closed,
}

/// The narrow seam between the session controller and the real-time
/// transport library.
///
/// Implementations report candidates, state changes and remote media on the
/// event receiver handed out once by `take_events`.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError>;

    async fn create_answer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<StatSample, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
