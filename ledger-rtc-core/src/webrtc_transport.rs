//! Peer connections backed by the `webrtc` crate
//!
//! Each local track is published as an Opus or VP8 `TrackLocalStaticSample`.
//! Kinds the call receives without sending get a `recvonly` transceiver.
//! Because the ledger only carries the offer and the answer, local
//! descriptions are reported after candidate gathering completes so the SDP
//! already lists every candidate.

use crate::config::IceConfig;
use crate::media::{LocalTrack, RemoteTrackInfo, TrackKind};
use crate::transport::{
    OfferOptions, PeerTransport, PeerTransportFactory, TransportError, TransportEvent,
};
use crate::types::{
    ConnectionPhase, IceCandidate, IceConnectionPhase, IceGatheringPhase, SdpType,
    SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Creates `webrtc` peer connections
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip_all, fields(stun_servers = ice.stun_servers.len()))]
    async fn create(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Setup(format!("registering codecs: {e}")))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::Setup(format!("registering interceptors: {e}")))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Setup(e.to_string()))?,
        );

        register_handlers(&pc, events);
        tracing::debug!("Created peer connection");

        Ok(Arc::new(WebRtcTransport {
            pc,
            wait_for_gathering: ice.wait_for_gathering,
            gathering_timeout: ice.gathering_timeout(),
            sending: Mutex::new(HashSet::new()),
            receive_only: Mutex::new(HashSet::new()),
        }))
    }
}

fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let _ = tx.send(TransportEvent::ConnectionStateChanged(connection_phase(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let _ = tx.send(TransportEvent::IceConnectionStateChanged(ice_phase(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        let _ = tx.send(TransportEvent::IceGatheringStateChanged(gathering_phase(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrackInfo {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
        }));
        Box::pin(async {})
    }));
}

fn connection_phase(state: RTCPeerConnectionState) -> ConnectionPhase {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionPhase::Connecting,
        RTCPeerConnectionState::Connected => ConnectionPhase::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionPhase::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionPhase::Failed,
        RTCPeerConnectionState::Closed => ConnectionPhase::Closed,
        _ => ConnectionPhase::New,
    }
}

fn ice_phase(state: RTCIceConnectionState) -> IceConnectionPhase {
    match state {
        RTCIceConnectionState::Checking => IceConnectionPhase::Checking,
        RTCIceConnectionState::Connected => IceConnectionPhase::Connected,
        RTCIceConnectionState::Completed => IceConnectionPhase::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionPhase::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionPhase::Failed,
        RTCIceConnectionState::Closed => IceConnectionPhase::Closed,
        _ => IceConnectionPhase::New,
    }
}

fn gathering_phase(state: RTCIceGathererState) -> IceGatheringPhase {
    match state {
        RTCIceGathererState::Gathering => IceGatheringPhase::Gathering,
        RTCIceGathererState::Complete => IceGatheringPhase::Complete,
        _ => IceGatheringPhase::New,
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|e| TransportError::Negotiation(format!("invalid SDP: {e}")))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

/// Peer connection backed by `RTCPeerConnection`
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    wait_for_gathering: bool,
    gathering_timeout: Duration,
    sending: Mutex<HashSet<TrackKind>>,
    receive_only: Mutex<HashSet<TrackKind>>,
}

impl WebRtcTransport {
    async fn ensure_receiver(&self, kind: TrackKind) -> Result<(), TransportError> {
        if self.sending.lock().contains(&kind) || !self.receive_only.lock().insert(kind) {
            return Ok(());
        }
        self.pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| TransportError::Negotiation(format!("adding {kind} receiver: {e}")))?;
        tracing::debug!(%kind, "Added receive-only transceiver");
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        let kind = track.kind();
        let local = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            track.id().to_string(),
            "ledger-rtc".to_string(),
        ));
        self.pc
            .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Negotiation(format!("adding {kind} track: {e}")))?;
        self.sending.lock().insert(kind);
        tracing::debug!(%kind, track_id = %track.id(), "Added local track");
        Ok(())
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        if options.receive_audio {
            self.ensure_receiver(TrackKind::Audio).await?;
        }
        if options.receive_video {
            self.ensure_receiver(TrackKind::Video).await?;
        }
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc(desc)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;

        if self.wait_for_gathering {
            match tokio::time::timeout(self.gathering_timeout, gathered.recv()).await {
                Ok(_) => tracing::debug!("ICE gathering complete"),
                Err(_) => tracing::warn!(
                    timeout_ms = self.gathering_timeout.as_millis() as u64,
                    "ICE gathering timed out, sending partial candidates"
                ),
            }
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(desc).ok()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::Setup(format!("closing: {e}")))
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("state", &self.pc.connection_state())
            .field("sending", &*self.sending.lock())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn offline_ice() -> IceConfig {
        IceConfig {
            stun_servers: Vec::new(),
            wait_for_gathering: true,
            gathering_timeout_ms: 3_000,
        }
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            connection_phase(RTCPeerConnectionState::Connected),
            ConnectionPhase::Connected
        );
        assert_eq!(
            connection_phase(RTCPeerConnectionState::Unspecified),
            ConnectionPhase::New
        );
        assert_eq!(ice_phase(RTCIceConnectionState::Failed), IceConnectionPhase::Failed);
        assert_eq!(
            gathering_phase(RTCIceGathererState::Complete),
            IceGatheringPhase::Complete
        );
    }

    #[test]
    fn test_codecs() {
        assert_eq!(codec_for(TrackKind::Audio).clock_rate, 48000);
        assert_eq!(codec_for(TrackKind::Video).mime_type, "video/VP8");
    }

    #[tokio::test]
    async fn test_voice_offer_and_answer() {
        let factory = WebRtcTransportFactory::new();
        let (caller_tx, _caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, _callee_rx) = mpsc::unbounded_channel();
        let caller = factory.create(&offline_ice(), caller_tx).await.unwrap();
        let callee = factory.create(&offline_ice(), callee_tx).await.unwrap();

        let mic = Arc::new(LocalTrack::new(TrackKind::Audio, "mic", None));
        caller.add_track(&mic).await.unwrap();
        let offer = caller
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: false,
            })
            .await
            .unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(!offer.sdp.contains("m=video"));
        caller.set_local_description(offer).await.unwrap();
        let offer = caller.local_description().await.unwrap();

        callee.set_remote_description(offer).await.unwrap();
        let answer = callee.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        callee.set_local_description(answer).await.unwrap();
        let answer = callee.local_description().await.unwrap();
        caller.set_remote_description(answer).await.unwrap();

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_video_offer_receives_video() {
        let factory = WebRtcTransportFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = factory.create(&offline_ice(), tx).await.unwrap();
        let mic = Arc::new(LocalTrack::new(TrackKind::Audio, "mic", None));
        transport.add_track(&mic).await.unwrap();
        let offer = transport
            .create_offer(OfferOptions {
                receive_audio: true,
                receive_video: true,
            })
            .await
            .unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        transport.close().await.unwrap();
    }
}
