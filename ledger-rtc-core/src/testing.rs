//! Scripted peer connections for tests and offline runs
//!
//! [`ScriptedTransport`] records every call made on it, produces small
//! deterministic SDP bodies, and lets a test inject [`TransportEvent`]s or
//! make individual operations fail.

use crate::config::IceConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    OfferOptions, PeerTransport, PeerTransportFactory, TransportError, TransportEvent,
};
use crate::types::{ConnectionPhase, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Operation recorded by a [`ScriptedTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `add_track`
    AddTrack(TrackKind),
    /// `create_offer`
    CreateOffer(OfferOptions),
    /// `create_answer`
    CreateAnswer,
    /// `set_local_description`
    SetLocalDescription(SdpType),
    /// `set_remote_description`
    SetRemoteDescription(SdpType),
    /// `add_ice_candidate`, with the candidate line
    AddIceCandidate(String),
    /// `close`
    Close,
}

#[derive(Debug, Default)]
struct Failures {
    add_track: bool,
    candidates: bool,
    remote_description: bool,
    close: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<TransportCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    closed: bool,
}

/// In-memory [`PeerTransport`]
#[derive(Debug)]
pub struct ScriptedTransport {
    id: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    recorded: Mutex<Recorded>,
    failures: Mutex<Failures>,
    auto_connect: bool,
    connected: AtomicBool,
}

impl ScriptedTransport {
    fn new(id: usize, events: mpsc::UnboundedSender<TransportEvent>, auto_connect: bool) -> Self {
        Self {
            id,
            events,
            recorded: Mutex::new(Recorded::default()),
            failures: Mutex::new(Failures::default()),
            auto_connect,
            connected: AtomicBool::new(false),
        }
    }

    /// Deliver an event as if the connection produced it
    pub fn emit(&self, event: TransportEvent) {
        // Receiver gone means the negotiator has ended
        let _ = self.events.send(event);
    }

    /// Make `add_track` fail
    pub fn fail_add_track(&self) {
        self.failures.lock().add_track = true;
    }

    /// Make `add_ice_candidate` fail
    pub fn fail_candidates(&self) {
        self.failures.lock().candidates = true;
    }

    /// Make `set_remote_description` fail
    pub fn fail_remote_description(&self) {
        self.failures.lock().remote_description = true;
    }

    /// Make `close` fail (the connection still ends up closed)
    pub fn fail_close(&self) {
        self.failures.lock().close = true;
    }

    /// Every call in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.recorded.lock().calls.clone()
    }

    /// Kinds of attached local tracks
    pub fn added_tracks(&self) -> Vec<TrackKind> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::AddTrack(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    /// Options of the last offer created
    pub fn offer_options(&self) -> Option<OfferOptions> {
        self.calls().into_iter().rev().find_map(|c| match c {
            TransportCall::CreateOffer(options) => Some(options),
            _ => None,
        })
    }

    /// Candidate lines applied, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                TransportCall::AddIceCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    /// Local description as last set
    pub fn recorded_local_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().local.clone()
    }

    /// Remote description as last set
    pub fn recorded_remote_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().remote.clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.recorded.lock().closed
    }

    fn record(&self, call: TransportCall) -> Result<(), TransportError> {
        let mut recorded = self.recorded.lock();
        if recorded.closed {
            return Err(TransportError::Closed);
        }
        recorded.calls.push(call);
        Ok(())
    }

    fn sdp(&self, kind: &str, audio: bool, video: bool) -> String {
        let mut sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=ledger-rtc {kind}\r\nt=0 0\r\n", self.id);
        if audio {
            sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n");
        }
        if video {
            sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=rtpmap:96 VP8/90000\r\n");
        }
        sdp
    }

    fn maybe_connect(&self) {
        if !self.auto_connect {
            return;
        }
        let ready = {
            let recorded = self.recorded.lock();
            recorded.local.is_some() && recorded.remote.is_some()
        };
        if ready && !self.connected.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionPhase::Connecting));
            self.emit(TransportEvent::ConnectionStateChanged(ConnectionPhase::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn add_track(&self, track: &Arc<LocalTrack>) -> Result<(), TransportError> {
        if self.failures.lock().add_track {
            return Err(TransportError::Negotiation(format!(
                "cannot attach {}",
                track.id()
            )));
        }
        self.record(TransportCall::AddTrack(track.kind()))
    }

    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateOffer(options))?;
        let video = options.receive_video || self.added_tracks().contains(&TrackKind::Video);
        Ok(SessionDescription::offer(self.sdp("offer", options.receive_audio, video)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.record(TransportCall::CreateAnswer)?;
        let remote = self
            .recorded_remote_description()
            .ok_or_else(|| TransportError::Negotiation("no remote offer".to_string()))?;
        let audio = remote.sdp.contains("m=audio");
        let video = remote.sdp.contains("m=video");
        Ok(SessionDescription::answer(self.sdp("answer", audio, video)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.record(TransportCall::SetLocalDescription(desc.sdp_type))?;
        self.recorded.lock().local = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.recorded_local_description()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if self.failures.lock().remote_description {
            return Err(TransportError::Negotiation("malformed remote description".to_string()));
        }
        self.record(TransportCall::SetRemoteDescription(desc.sdp_type))?;
        self.recorded.lock().remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(TransportCall::AddIceCandidate(candidate.candidate.clone()))?;
        if self.failures.lock().candidates {
            return Err(TransportError::Candidate(candidate.candidate));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut recorded = self.recorded.lock();
            recorded.calls.push(TransportCall::Close);
            recorded.closed = true;
        }
        if self.failures.lock().close {
            return Err(TransportError::Setup("close failed".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    transports: Vec<Arc<ScriptedTransport>>,
    fail_next: bool,
}

/// Creates [`ScriptedTransport`]s and keeps a handle to each
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransportFactory {
    state: Arc<Mutex<FactoryState>>,
    auto_connect: Arc<AtomicBool>,
    created: Arc<AtomicUsize>,
}

impl ScriptedTransportFactory {
    /// Factory whose transports only change state when told to
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose transports report `connecting` then `connected` once
    /// both descriptions are set
    pub fn auto_connecting() -> Self {
        let factory = Self::default();
        factory.auto_connect.store(true, Ordering::SeqCst);
        factory
    }

    /// Fail the next `create`
    pub fn fail_next_create(&self) {
        self.state.lock().fail_next = true;
    }

    /// Number of transports created
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// All transports created, oldest first
    pub fn transports(&self) -> Vec<Arc<ScriptedTransport>> {
        self.state.lock().transports.clone()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<ScriptedTransport>> {
        self.state.lock().transports.last().cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for ScriptedTransportFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(TransportError::Setup("scripted failure".to_string()));
        }
        if ice.stun_servers.is_empty() {
            tracing::debug!("Creating scripted transport without STUN servers");
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let transport = Arc::new(ScriptedTransport::new(
            id,
            events,
            self.auto_connect.load(Ordering::SeqCst),
        ));
        state.transports.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
