//! Wire form of the negotiation messages exchanged over the signaling
//! channel. Both peers must agree on the exact JSON shape:
//!
//! - session description: `{"type":"offer","sdp":"..."}`
//! - candidate: `{"sdp":"candidate:...","sdpMLineIndex":0,"sdpMid":"0"}`

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdp")]
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEnvelope {
    SessionDescription(SessionDescription),
    IceCandidate(IceCandidate),
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode {kind} envelope: {source}")]
    Encode {
        kind: &'static str,
        source: serde_json::Error,
    },
    #[error("payload of {len} bytes is neither a session description nor a candidate")]
    Unrecognized { len: usize },
}

impl SignalingEnvelope {
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        let encoded = match self {
            SignalingEnvelope::SessionDescription(desc) => serde_json::to_vec(desc),
            SignalingEnvelope::IceCandidate(candidate) => serde_json::to_vec(candidate),
        };
        encoded.map(Bytes::from).map_err(|source| EnvelopeError::Encode {
            kind: self.kind(),
            source,
        })
    }

    /// Session descriptions are tried first; a candidate payload never
    /// carries a `type` field so it cannot be mistaken for one.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if let Ok(desc) = serde_json::from_slice::<SessionDescription>(bytes) {
            return Ok(SignalingEnvelope::SessionDescription(desc));
        }
        if let Ok(candidate) = serde_json::from_slice::<IceCandidate>(bytes) {
            return Ok(SignalingEnvelope::IceCandidate(candidate));
        }
        Err(EnvelopeError::Unrecognized { len: bytes.len() })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::SessionDescription(desc) => desc.kind.as_str(),
            SignalingEnvelope::IceCandidate(_) => "candidate",
        }
    }
}

impl From<SessionDescription> for SignalingEnvelope {
    fn from(desc: SessionDescription) -> Self {
        SignalingEnvelope::SessionDescription(desc)
    }
}

impl From<IceCandidate> for SignalingEnvelope {
    fn from(candidate: IceCandidate) -> Self {
        SignalingEnvelope::IceCandidate(candidate)
    }
}
