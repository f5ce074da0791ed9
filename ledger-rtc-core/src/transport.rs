//! Peer connection boundary
//!
//! The negotiator drives a [`PeerTransport`] and observes it through a stream
//! of [`TransportEvent`]s delivered on the channel handed to
//! [`PeerTransportFactory::create`]. The default implementation is backed by
//! the `webrtc` crate (see `webrtc_transport`).

use crate::config::IceConfig;
use crate::media::{LocalTrack, RemoteTrackInfo};
use crate::types::{
    ConnectionPhase, IceCandidate, IceConnectionPhase, IceGatheringPhase, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer connection could not be created
    #[error("Failed to create peer connection: {0}")]
    Setup(String),

    /// Description creation or application failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Candidate rejected by the ICE agent
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Notification from the underlying peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Peer connection state changed
    ConnectionStateChanged(ConnectionPhase),
    /// ICE agent state changed
    IceConnectionStateChanged(IceConnectionPhase),
    /// Local gathering state changed
    IceGatheringStateChanged(IceGatheringPhase),
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrackInfo),
}

/// Media kinds the offer should receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    /// Receive remote audio
    pub receive_audio: bool,
    /// Receive remote video
    pub receive_video: bool,
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track for sending
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError>;

    /// Create an offer restricted to `options`
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Current local description, including any gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Apply the remote peer's description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Close the connection
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a connection configured with `ice`, reporting on `events`
    async fn create(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
