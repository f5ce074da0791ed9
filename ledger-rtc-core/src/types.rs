//! Call negotiation types and data structures

use crate::identity::ObjectId;
use crate::media::{LocalStream, RemoteStream, TrackKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of call requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Voice,
    /// Audio and camera video
    Video,
}

impl CallType {
    /// Whether a camera track is part of this call
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video)
    }

    /// Capture constraints used when acquiring local media for this call type
    pub fn constraints(&self) -> MediaConstraints {
        match self {
            Self::Voice => MediaConstraints::audio_only(),
            Self::Video => MediaConstraints::video_call(),
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Voice => write!(f, "voice"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl FromStr for CallType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "voice" | "audio" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            other => anyhow::bail!("unknown call type: {other}"),
        }
    }
}

/// Microphone processing requested from the capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Camera facing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera
    User,
    /// Rear camera
    Environment,
}

/// Camera capture request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Preferred width in pixels
    pub ideal_width: u32,
    /// Upper bound on width
    pub max_width: u32,
    /// Preferred height in pixels
    pub ideal_height: u32,
    /// Upper bound on height
    pub max_height: u32,
    /// Preferred frame rate
    pub ideal_frame_rate: u32,
    /// Upper bound on frame rate
    pub max_frame_rate: u32,
    /// Which camera to use
    pub facing_mode: FacingMode,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            max_width: 1920,
            ideal_height: 720,
            max_height: 1080,
            ideal_frame_rate: 30,
            max_frame_rate: 60,
            facing_mode: FacingMode::User,
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Microphone request, `None` for no audio
    pub audio: Option<AudioConstraints>,
    /// Camera request, `None` for no video
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: None,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: Some(VideoConstraints::default()),
        }
    }

    /// Check if audio is requested
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Check if video is requested
    pub fn has_video(&self) -> bool {
        self.video.is_some()
    }

    /// Track kinds requested, audio first
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::new();
        if self.has_audio() {
            kinds.push(TrackKind::Audio);
        }
        if self.has_video() {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer from the caller
    Offer,
    /// Answer from the callee
    Answer,
}

/// Session description exchanged through the ledger
///
/// Serialized as `{"type":"offer","sdp":"v=0..."}` so payloads stay compatible
/// with browser peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Encode as the UTF-8 JSON bytes stored in a call record
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode bytes read from a call record
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a JSON session description
    pub fn from_payload(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media id
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate for the first media section
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Peer connection state, mirrored from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// Not started
    #[default]
    New,
    /// Transports negotiating
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity failed
    Failed,
    /// Connection closed
    Closed,
}

impl ConnectionPhase {
    /// Whether this phase ends the active part of a call
    pub fn ends_activity(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE agent connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionPhase {
    /// Not started
    #[default]
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable pair was found
    Connected,
    /// Checks finished
    Completed,
    /// Connectivity lost
    Disconnected,
    /// No usable pair
    Failed,
    /// Agent shut down
    Closed,
}

/// Local candidate gathering state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringPhase {
    /// Not started
    #[default]
    New,
    /// Gathering in progress
    Gathering,
    /// All candidates gathered
    Complete,
}

/// Immutable view of one negotiation, published on every change
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    /// Ledger call record backing this negotiation, once known
    pub session_id: Option<ObjectId>,
    /// Call type of the negotiation
    pub call_type: Option<CallType>,
    /// Peer connection state
    pub connection_phase: ConnectionPhase,
    /// ICE agent state
    pub ice_phase: IceConnectionPhase,
    /// Whether the peer connection currently reports `connected`
    pub is_connected: bool,
    /// True once the connection reached `connected`, until it leaves it
    pub is_call_active: bool,
    /// Local capture stream
    pub local_stream: Option<Arc<LocalStream>>,
    /// Stream assembled from remote tracks
    pub remote_stream: Option<Arc<RemoteStream>>,
    /// Local microphone muted
    pub is_local_audio_muted: bool,
    /// Local camera muted
    pub is_local_video_muted: bool,
    /// Whether a peer connection is still held
    pub has_connection: bool,
    /// Last error message
    pub error: Option<String>,
}

impl CallSnapshot {
    /// Number of local tracks that are still live
    pub fn live_local_tracks(&self) -> usize {
        self.local_stream
            .as_ref()
            .map(|s| s.tracks().iter().filter(|t| t.is_live()).count())
            .unwrap_or(0)
    }
}
