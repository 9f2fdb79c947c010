use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    MediaTransport, NegotiationOptions, RemoteVideo, StatSample, TransportError, TransportEvent,
    TransportState,
};
use crate::discovery::PeerRole;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub role: PeerRole,
    /// Empty by default: both peers share a LAN so host candidates suffice.
    pub ice_servers: Vec<String>,
    pub video_track_id: String,
    pub video_stream_id: String,
}

impl WebRtcConfig {
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            ice_servers: Vec::new(),
            video_track_id: "video".to_string(),
            video_stream_id: "tether".to_string(),
        }
    }

    pub fn with_ice_servers(mut self, urls: Vec<String>) -> Self {
        self.ice_servers = urls;
        self
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct ReceiveCounters {
    frames: AtomicU64,
    bytes: AtomicU64,
}

/// [`MediaTransport`] backed by a `webrtc` peer connection.
///
/// The host sends one H.264 track fed by an external capture pipeline; the
/// viewer counts what it receives so stats can report frames and bytes.
pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    local_video: Option<Arc<TrackLocalStaticSample>>,
    counters: Arc<ReceiveCounters>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcTransport {
    pub async fn new(config: WebRtcConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config.rtc_configuration())
                .await
                .map_err(|err| TransportError::Setup(err.to_string()))?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(ReceiveCounters::default());

        let candidate_tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "transport", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            sdp_mid: init.sdp_mid,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "transport", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_tx.clone();
                Box::pin(async move {
                    tracing::debug!(target = "transport", state = %state, "peer connection state changed");
                    if let Some(state) = map_state(state) {
                        let _ = events.send(TransportEvent::StateChanged(state));
                    }
                })
            },
        ));

        let local_video = match config.role {
            PeerRole::Host => {
                let track = Arc::new(TrackLocalStaticSample::new(
                    RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_owned(),
                        ..Default::default()
                    },
                    config.video_track_id.clone(),
                    config.video_stream_id.clone(),
                ));
                peer_connection
                    .add_transceiver_from_track(
                        Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendonly,
                            send_encodings: Vec::new(),
                        }),
                    )
                    .await
                    .map_err(|err| TransportError::Setup(err.to_string()))?;
                Some(track)
            }
            PeerRole::Viewer => {
                let track_tx = events_tx.clone();
                let track_counters = Arc::clone(&counters);
                peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                    let events = track_tx.clone();
                    let counters = Arc::clone(&track_counters);
                    Box::pin(async move {
                        let remote = RemoteVideo {
                            track_id: track.id(),
                            mime_type: track.codec().capability.mime_type.clone(),
                        };
                        tracing::info!(
                            target = "transport",
                            track = %remote.track_id,
                            mime = %remote.mime_type,
                            "remote video track arrived"
                        );
                        let _ = events.send(TransportEvent::RemoteVideo(remote));
                        tokio::spawn(count_remote_media(track, counters));
                    })
                }));
                None
            }
        };

        Ok(Self {
            peer_connection,
            local_video,
            counters,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Track the capture pipeline writes encoded samples into (host only).
    pub fn local_video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_video.clone()
    }
}

async fn count_remote_media(track: Arc<TrackRemote>, counters: Arc<ReceiveCounters>) {
    while let Ok((packet, _)) = track.read_rtp().await {
        counters
            .bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        // marker bit closes an access unit
        if packet.header.marker {
            counters.frames.fetch_add(1, Ordering::Relaxed);
        }
    }
    tracing::debug!(target = "transport", track = %track.id(), "remote track ended");
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// A nominated pair reports zero until its first STUN round trip completes.
fn measured_round_trip(seconds: f64) -> Option<f64> {
    (seconds > 0.0).then_some(seconds)
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|err| TransportError::Negotiation(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_offer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                voice_activity_detection: options.voice_activity_detection,
                ice_restart: false,
            }))
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(
        &self,
        options: NegotiationOptions,
    ) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(Some(RTCAnswerOptions {
                voice_activity_detection: options.voice_activity_detection,
            }))
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::Negotiation(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn stats(&self) -> Result<StatSample, TransportError> {
        let report = self.peer_connection.get_stats().await;
        let round_trip_time_seconds = report.reports.values().find_map(|entry| match entry {
            StatsReportType::CandidatePair(pair) if pair.nominated => {
                measured_round_trip(pair.current_round_trip_time)
            }
            _ => None,
        });
        Ok(StatSample {
            frames_decoded: self.counters.frames.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes.load(Ordering::Relaxed),
            // webrtc 0.14 inbound RTP stats carry no jitter
            jitter_seconds: None,
            round_trip_time_seconds,
            sampled_at: Instant::now(),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer_connection
            .close()
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
