//! Local and remote media streams
//!
//! Capture devices sit behind the [`MediaDevices`] trait. A [`LocalTrack`]
//! owns its device claim through a [`TrackSource`]; stopping the track (or
//! dropping the last handle to it) releases the device, so a failed call
//! attempt never leaves a microphone or camera claimed.
//!
//! [`VirtualDevices`] is an in-process device pool with exclusive claims. It
//! stands in for platform capture wherever none is wired in, and reports the
//! same failures a real device layer does.

use crate::types::MediaConstraints;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Local media acquisition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device already claimed elsewhere
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Anything else the device layer reports
    #[error("Media error: {0}")]
    Unknown(String),
}

impl MediaError {
    /// Message suitable for showing to the user
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => {
                "Camera/microphone access denied. Please allow permissions and try again."
            }
            Self::DeviceNotFound(_) => "No camera/microphone found. Please check your devices.",
            Self::DeviceBusy(_) => "Camera/microphone is already in use by another application.",
            Self::Unknown(_) => "Failed to access camera/microphone",
        }
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Device-side handle behind a local track
pub trait TrackSource: Send + Sync {
    /// Stop capturing and release the device
    fn stop(&self);
}

/// Local capture track
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
    source: Mutex<Option<Box<dyn TrackSource>>>,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(kind: TrackKind, label: impl Into<String>, source: Option<Box<dyn TrackSource>>) -> Self {
        Self {
            id: format!("{}-{}", kind, uuid::Uuid::new_v4().simple()),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            source: Mutex::new(source),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether samples from this track are sent
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable sending without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the track still holds its device
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stop the track and release its device. Idempotent.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            if let Some(source) = self.source.lock().take() {
                source.stop();
            }
            tracing::debug!(track_id = %self.id, kind = %self.kind, "Stopped local track");
        }
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Local capture stream
#[derive(Debug)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    /// Group tracks into a stream
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of the given kind
    pub fn first_track(&self, kind: TrackKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Number of tracks of the given kind
    pub fn count(&self, kind: TrackKind) -> usize {
        self.tracks.iter().filter(|t| t.kind() == kind).count()
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Track received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
    /// Remote stream the track belongs to
    pub stream_id: String,
}

/// Stream assembled from remote tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier as announced by the peer
    pub id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteStream {
    /// Stream holding a single track
    pub fn from_track(track: RemoteTrackInfo) -> Self {
        Self {
            id: track.stream_id.clone(),
            tracks: vec![track],
        }
    }

    /// Copy of this stream with `track` added (replacing any with the same id)
    pub fn with_track(&self, track: RemoteTrackInfo) -> Self {
        let mut tracks: Vec<_> = self
            .tracks
            .iter()
            .filter(|t| t.id != track.id)
            .cloned()
            .collect();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            tracks,
        }
    }
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire a stream satisfying `constraints`: microphone if audio is
    /// requested, camera if video is requested. All-or-nothing.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError>;
}

#[derive(Debug)]
struct DeviceSlot {
    label: String,
    in_use: bool,
}

#[derive(Debug)]
struct PoolState {
    permission_granted: bool,
    microphone: Option<DeviceSlot>,
    camera: Option<DeviceSlot>,
}

impl PoolState {
    fn slot_mut(&mut self, kind: TrackKind) -> Option<&mut DeviceSlot> {
        match kind {
            TrackKind::Audio => self.microphone.as_mut(),
            TrackKind::Video => self.camera.as_mut(),
        }
    }
}

/// In-process device pool with exclusive claims
#[derive(Debug, Clone)]
pub struct VirtualDevices {
    state: Arc<Mutex<PoolState>>,
}

impl VirtualDevices {
    /// Pool with one microphone and one camera, permission granted
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                permission_granted: true,
                microphone: Some(DeviceSlot {
                    label: "Virtual Microphone".to_string(),
                    in_use: false,
                }),
                camera: Some(DeviceSlot {
                    label: "Virtual Camera".to_string(),
                    in_use: false,
                }),
            })),
        }
    }

    /// Remove the camera from the pool
    #[must_use]
    pub fn without_camera(self) -> Self {
        self.state.lock().camera = None;
        self
    }

    /// Remove the microphone from the pool
    #[must_use]
    pub fn without_microphone(self) -> Self {
        self.state.lock().microphone = None;
        self
    }

    /// Grant or revoke capture permission
    pub fn set_permission(&self, granted: bool) {
        self.state.lock().permission_granted = granted;
    }

    /// Number of devices currently claimed
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        [&state.microphone, &state.camera]
            .iter()
            .filter(|slot| slot.as_ref().map(|s| s.in_use).unwrap_or(false))
            .count()
    }
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

struct VirtualSource {
    state: Arc<Mutex<PoolState>>,
    kind: TrackKind,
}

impl TrackSource for VirtualSource {
    fn stop(&self) {
        if let Some(slot) = self.state.lock().slot_mut(self.kind) {
            slot.in_use = false;
        }
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    #[tracing::instrument(skip(self, constraints), fields(audio = constraints.has_audio(), video = constraints.has_video()))]
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::Unknown("no media kinds requested".to_string()));
        }

        let mut claimed = Vec::with_capacity(kinds.len());
        {
            let mut state = self.state.lock();
            if !state.permission_granted {
                return Err(MediaError::PermissionDenied(
                    kinds.iter().map(ToString::to_string).collect::<Vec<_>>().join("+"),
                ));
            }
            for kind in &kinds {
                match state.slot_mut(*kind) {
                    None => return Err(MediaError::DeviceNotFound(kind.to_string())),
                    Some(slot) if slot.in_use => {
                        return Err(MediaError::DeviceBusy(slot.label.clone()))
                    }
                    Some(_) => {}
                }
            }
            for kind in &kinds {
                if let Some(slot) = state.slot_mut(*kind) {
                    slot.in_use = true;
                    claimed.push((*kind, slot.label.clone()));
                }
            }
        }

        let tracks = claimed
            .into_iter()
            .map(|(kind, label)| {
                let source = VirtualSource {
                    state: Arc::clone(&self.state),
                    kind,
                };
                Arc::new(LocalTrack::new(kind, label, Some(Box::new(source))))
            })
            .collect::<Vec<_>>();

        tracing::debug!(tracks = tracks.len(), "Acquired virtual devices");
        Ok(LocalStream::new(tracks))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_audio_only() {
        let devices = VirtualDevices::new();
        let stream = devices.acquire(&MediaConstraints::audio_only()).await.unwrap();
        assert_eq!(stream.count(TrackKind::Audio), 1);
        assert_eq!(stream.count(TrackKind::Video), 0);
        assert_eq!(devices.in_use(), 1);
    }

    #[tokio::test]
    async fn test_acquire_video_claims_both() {
        let devices = VirtualDevices::new();
        let stream = devices.acquire(&MediaConstraints::video_call()).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(devices.in_use(), 2);
        stream.stop_all();
        assert_eq!(devices.in_use(), 0);
    }

    #[tokio::test]
    async fn test_second_claim_is_busy_until_release() {
        let devices = VirtualDevices::new();
        let first = devices.acquire(&MediaConstraints::audio_only()).await.unwrap();

        let second = devices.acquire(&MediaConstraints::audio_only()).await;
        assert!(matches!(second, Err(MediaError::DeviceBusy(_))));

        drop(first);
        assert_eq!(devices.in_use(), 0);
        assert!(devices.acquire(&MediaConstraints::audio_only()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_camera_claims_nothing() {
        let devices = VirtualDevices::new().without_camera();
        let result = devices.acquire(&MediaConstraints::video_call()).await;
        assert!(matches!(result, Err(MediaError::DeviceNotFound(ref k)) if k == "video"));
        assert_eq!(devices.in_use(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let devices = VirtualDevices::new();
        devices.set_permission(false);
        let result = devices.acquire(&MediaConstraints::audio_only()).await;
        assert!(matches!(result, Err(MediaError::PermissionDenied(_))));
        assert_eq!(
            result.unwrap_err().user_message(),
            "Camera/microphone access denied. Please allow permissions and try again."
        );
    }

    #[test]
    fn test_track_stop_is_idempotent() {
        let track = LocalTrack::new(TrackKind::Audio, "mic", None);
        assert!(track.is_live());
        track.stop();
        track.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn test_remote_stream_with_track_replaces_same_id() {
        let audio = RemoteTrackInfo {
            id: "a".to_string(),
            kind: TrackKind::Audio,
            stream_id: "s".to_string(),
        };
        let stream = RemoteStream::from_track(audio.clone());
        let video = RemoteTrackInfo {
            id: "v".to_string(),
            kind: TrackKind::Video,
            stream_id: "s".to_string(),
        };
        let stream = stream.with_track(video).with_track(audio);
        assert_eq!(stream.tracks.len(), 2);
        assert_eq!(stream.id, "s");
    }
}
