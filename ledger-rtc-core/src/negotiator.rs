//! Media negotiation for a single call
//!
//! A [`MediaNegotiator`] owns one peer connection and the local capture stream
//! attached to it. It turns transport events into [`CallSnapshot`]s and holds
//! back remote ICE candidates until the remote description has been applied.
//!
//! ```text
//!   new ──► connecting ──► connected ──► disconnected | failed | closed
//! ```
//!
//! The phase is observed from the transport, never driven. Only `connected`
//! marks the call active.

use crate::call::CallError;
use crate::config::IceConfig;
use crate::identity::ObjectId;
use crate::media::{LocalStream, MediaDevices, RemoteStream, TrackKind};
use crate::observer::StatePublisher;
use crate::transport::{OfferOptions, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::types::{
    CallSnapshot, CallType, ConnectionPhase, IceCandidate, IceConnectionPhase, SdpType,
    SessionDescription,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct NegotiationState {
    session_id: Option<ObjectId>,
    call_type: Option<CallType>,
    connection_phase: ConnectionPhase,
    ice_phase: IceConnectionPhase,
    is_connected: bool,
    is_call_active: bool,
    local_stream: Option<Arc<LocalStream>>,
    remote_stream: Option<Arc<RemoteStream>>,
    audio_muted: bool,
    video_muted: bool,
    error: Option<String>,
    ended: bool,
}

/// Remote candidates waiting for the remote description
#[derive(Debug, Default)]
struct IceQueue {
    pending: VecDeque<IceCandidate>,
    remote_ready: bool,
}

/// Negotiates media for one call over one peer connection
pub struct MediaNegotiator {
    devices: Arc<dyn MediaDevices>,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    state: Mutex<NegotiationState>,
    // Held across candidate application so queued candidates keep arrival order
    ice: tokio::sync::Mutex<IceQueue>,
    publisher: Arc<StatePublisher>,
    // Snapshot and delivery happen under one lock so a stale snapshot can
    // never be delivered after a newer one
    publish_lock: Mutex<()>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl MediaNegotiator {
    /// Create a negotiator with a fresh peer connection
    ///
    /// Publishes an initial snapshot. If the connection cannot be created the
    /// error is published before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailed` if the transport cannot be created
    #[tracing::instrument(skip_all)]
    pub async fn new(
        devices: Arc<dyn MediaDevices>,
        transports: &dyn PeerTransportFactory,
        ice: &IceConfig,
        publisher: Arc<StatePublisher>,
    ) -> Result<Arc<Self>, CallError> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let transport = match transports.create(ice, event_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                let err = CallError::from(e);
                tracing::error!(error = %err, "Failed to create peer connection");
                publisher.publish(CallSnapshot {
                    error: Some(err.to_string()),
                    ..Default::default()
                });
                return Err(err);
            }
        };

        let negotiator = Arc::new(Self {
            devices,
            transport: Mutex::new(Some(transport)),
            state: Mutex::new(NegotiationState::default()),
            ice: tokio::sync::Mutex::new(IceQueue::default()),
            publisher,
            publish_lock: Mutex::new(()),
            event_pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&negotiator);
        let pump = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(negotiator) = weak.upgrade() else {
                    break;
                };
                negotiator.handle_transport_event(event);
            }
        });
        *negotiator.event_pump.lock() = Some(pump);

        tracing::debug!("Created media negotiator");
        negotiator.publish();
        Ok(negotiator)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> CallSnapshot {
        let has_connection = self.transport.lock().is_some();
        let state = self.state.lock();
        CallSnapshot {
            session_id: state.session_id.clone(),
            call_type: state.call_type,
            connection_phase: state.connection_phase,
            ice_phase: state.ice_phase,
            is_connected: state.is_connected,
            is_call_active: state.is_call_active,
            local_stream: state.local_stream.clone(),
            remote_stream: state.remote_stream.clone(),
            is_local_audio_muted: state.audio_muted,
            is_local_video_muted: state.video_muted,
            has_connection,
            error: state.error.clone(),
        }
    }

    /// Listeners run under the publish lock and must not call back into
    /// operations that publish
    fn publish(&self) {
        let _publishing = self.publish_lock.lock();
        self.publisher.publish(self.snapshot());
    }

    /// Record `err` in the snapshot, publish, and hand it back
    fn fail(&self, err: CallError) -> CallError {
        self.state.lock().error = Some(err.to_string());
        self.publish();
        err
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>, CallError> {
        self.transport
            .lock()
            .clone()
            .ok_or_else(|| CallError::InvalidState("negotiator has ended".to_string()))
    }

    /// Whether `end_call` has run
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    /// Attach the ledger call record backing this negotiation
    pub fn set_session_id(&self, session_id: ObjectId) {
        self.state.lock().session_id = Some(session_id);
        self.publish();
    }

    /// Acquire microphone (and camera for video calls) and attach the tracks
    ///
    /// # Errors
    ///
    /// Returns `Media` if the devices cannot be acquired, `NegotiationFailed`
    /// if the tracks cannot be attached, `InvalidState` if media was already
    /// acquired or the negotiator has ended
    #[tracing::instrument(skip(self), fields(call_type = %call_type))]
    pub async fn acquire_local_media(
        &self,
        call_type: CallType,
    ) -> Result<Arc<LocalStream>, CallError> {
        {
            let state = self.state.lock();
            if state.ended {
                return Err(CallError::InvalidState("negotiator has ended".to_string()));
            }
            if state.local_stream.is_some() {
                return Err(CallError::InvalidState(
                    "local media already acquired".to_string(),
                ));
            }
        }
        let transport = self.transport()?;

        let stream = match self.devices.acquire(&call_type.constraints()).await {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                tracing::error!(error = %e, "Failed to acquire local media");
                self.state.lock().error = Some(e.user_message().to_string());
                self.publish();
                return Err(CallError::Media(e));
            }
        };

        for track in stream.tracks() {
            if let Err(e) = transport.add_track(track).await {
                stream.stop_all();
                return Err(self.fail(CallError::NegotiationFailed(format!(
                    "attaching {} track: {e}",
                    track.kind()
                ))));
            }
        }

        {
            let mut state = self.state.lock();
            state.call_type = Some(call_type);
            state.local_stream = Some(Arc::clone(&stream));
            state.error = None;
        }
        tracing::debug!(tracks = stream.tracks().len(), "Local media attached");
        self.publish();
        Ok(stream)
    }

    /// Create an offer for the call type's media kinds and set it locally
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` without local media, `NegotiationFailed` if the
    /// transport rejects the offer
    #[tracing::instrument(skip(self))]
    pub async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let call_type = {
            let state = self.state.lock();
            match (&state.local_stream, state.call_type) {
                (Some(_), Some(call_type)) => call_type,
                _ => {
                    return Err(CallError::InvalidState(
                        "local media not acquired".to_string(),
                    ))
                }
            }
        };
        let transport = self.transport()?;
        let options = OfferOptions {
            receive_audio: true,
            receive_video: call_type.is_video(),
        };

        let result = async {
            let offer = transport.create_offer(options).await?;
            transport.set_local_description(offer.clone()).await?;
            Ok::<_, CallError>(transport.local_description().await.unwrap_or(offer))
        }
        .await;

        match result {
            Ok(offer) => {
                tracing::debug!(sdp_len = offer.sdp.len(), "Created offer");
                self.publish();
                Ok(offer)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to create offer");
                Err(self.fail(e))
            }
        }
    }

    /// Apply the caller's offer and produce the local answer
    ///
    /// Queued ICE candidates are applied after the answer is set.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a remote description was already applied,
    /// `NegotiationFailed` if the offer is rejected
    #[tracing::instrument(skip(self, offer))]
    pub async fn accept_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(self.fail(CallError::NegotiationFailed(
                "remote description is not an offer".to_string(),
            )));
        }
        let transport = self.transport()?;
        let mut ice = self.ice.lock().await;
        if ice.remote_ready {
            return Err(CallError::InvalidState(
                "remote description already applied".to_string(),
            ));
        }

        let result = async {
            transport.set_remote_description(offer).await?;
            ice.remote_ready = true;
            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            Ok::<_, CallError>(transport.local_description().await.unwrap_or(answer))
        }
        .await;

        match result {
            Ok(answer) => {
                Self::drain(transport.as_ref(), &mut ice).await;
                drop(ice);
                tracing::debug!(sdp_len = answer.sdp.len(), "Created answer");
                self.publish();
                Ok(answer)
            }
            Err(e) => {
                drop(ice);
                tracing::error!(error = %e, "Failed to accept offer");
                Err(self.fail(e))
            }
        }
    }

    /// Apply the callee's answer
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if a remote description was already applied,
    /// `NegotiationFailed` if the answer is rejected
    #[tracing::instrument(skip(self, answer))]
    pub async fn accept_remote_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(self.fail(CallError::NegotiationFailed(
                "remote description is not an answer".to_string(),
            )));
        }
        let transport = self.transport()?;
        let mut ice = self.ice.lock().await;
        if ice.remote_ready {
            return Err(CallError::InvalidState(
                "remote description already applied".to_string(),
            ));
        }

        if let Err(e) = transport.set_remote_description(answer).await {
            drop(ice);
            let err = CallError::from(e);
            tracing::error!(error = %err, "Failed to apply answer");
            return Err(self.fail(err));
        }
        ice.remote_ready = true;
        Self::drain(transport.as_ref(), &mut ice).await;
        drop(ice);

        tracing::debug!("Applied remote answer");
        self.publish();
        Ok(())
    }

    /// Apply a remote candidate now if the remote description is set,
    /// otherwise queue it. Failures are logged only.
    #[tracing::instrument(skip(self, candidate))]
    pub async fn queue_or_apply_ice_candidate(&self, candidate: IceCandidate) {
        let Ok(transport) = self.transport() else {
            tracing::debug!("Ignoring ICE candidate after end of call");
            return;
        };
        let mut ice = self.ice.lock().await;
        if ice.remote_ready {
            Self::apply_candidate(transport.as_ref(), candidate).await;
        } else {
            tracing::trace!(queued = ice.pending.len() + 1, "Queued ICE candidate");
            ice.pending.push_back(candidate);
        }
    }

    /// Number of candidates waiting for the remote description
    pub async fn queued_candidates(&self) -> usize {
        self.ice.lock().await.pending.len()
    }

    async fn drain(transport: &dyn PeerTransport, ice: &mut IceQueue) {
        if !ice.pending.is_empty() {
            tracing::debug!(count = ice.pending.len(), "Draining queued ICE candidates");
        }
        while let Some(candidate) = ice.pending.pop_front() {
            Self::apply_candidate(transport, candidate).await;
        }
    }

    async fn apply_candidate(transport: &dyn PeerTransport, candidate: IceCandidate) {
        tracing::trace!(candidate = %candidate.candidate, "Applying ICE candidate");
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply ICE candidate");
        }
    }

    /// Flip the first local audio track; returns its new enabled state
    pub fn toggle_audio(&self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    /// Flip the first local video track; returns its new enabled state
    pub fn toggle_video(&self) -> bool {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> bool {
        let enabled = {
            let mut state = self.state.lock();
            let Some(track) = state
                .local_stream
                .as_ref()
                .and_then(|s| s.first_track(kind))
                .cloned()
            else {
                return false;
            };
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            match kind {
                TrackKind::Audio => state.audio_muted = !enabled,
                TrackKind::Video => state.video_muted = !enabled,
            }
            enabled
        };
        tracing::debug!(%kind, enabled, "Toggled local track");
        self.publish();
        enabled
    }

    /// Fold a transport event into the snapshot and publish it
    ///
    /// Events arriving after `end_call` are ignored.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            match event {
                TransportEvent::ConnectionStateChanged(phase) => {
                    tracing::info!(%phase, "Peer connection state changed");
                    state.connection_phase = phase;
                    state.is_connected = phase == ConnectionPhase::Connected;
                    match phase {
                        ConnectionPhase::Connected => {
                            state.is_call_active = true;
                            state.error = None;
                        }
                        ConnectionPhase::Failed => {
                            state.is_call_active = false;
                            state.error = Some(CallError::ConnectionFailed.to_string());
                        }
                        p if p.ends_activity() => state.is_call_active = false,
                        _ => {}
                    }
                }
                TransportEvent::IceConnectionStateChanged(phase) => {
                    tracing::debug!(?phase, "ICE connection state changed");
                    state.ice_phase = phase;
                    if phase == IceConnectionPhase::Failed {
                        state.error = Some(CallError::IceFailure.to_string());
                    }
                }
                TransportEvent::IceGatheringStateChanged(phase) => {
                    tracing::debug!(?phase, "ICE gathering state changed");
                }
                TransportEvent::LocalCandidate(candidate) => {
                    tracing::trace!(candidate = %candidate.candidate, "Gathered local candidate");
                }
                TransportEvent::RemoteTrack(track) => {
                    tracing::info!(kind = %track.kind, track_id = %track.id, "Remote track received");
                    let stream = match &state.remote_stream {
                        Some(existing) if existing.id == track.stream_id => {
                            existing.with_track(track)
                        }
                        _ => RemoteStream::from_track(track),
                    };
                    state.remote_stream = Some(Arc::new(stream));
                }
            }
        }
        self.publish();
    }

    /// Release everything: stop local tracks, close the connection, drop
    /// queued candidates and reset flags
    ///
    /// Safe to call more than once and on a partially set up negotiator.
    ///
    /// # Errors
    ///
    /// Returns `NegotiationFailed` if closing the connection failed; cleanup
    /// has completed regardless
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) -> Result<(), CallError> {
        let (stream, first) = {
            let mut state = self.state.lock();
            let first = !state.ended;
            state.ended = true;
            (state.local_stream.take(), first)
        };
        if let Some(stream) = stream {
            stream.stop_all();
        }

        let transport = self.transport.lock().take();
        let closed = match transport {
            Some(transport) => transport.close().await.map_err(CallError::from),
            None => Ok(()),
        };

        {
            let mut ice = self.ice.lock().await;
            ice.pending.clear();
            ice.remote_ready = false;
        }

        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }

        {
            let mut state = self.state.lock();
            state.connection_phase = ConnectionPhase::Closed;
            state.is_connected = false;
            state.is_call_active = false;
            state.audio_muted = false;
            state.video_muted = false;
            state.remote_stream = None;
        }

        if first {
            tracing::debug!("Media negotiator ended");
            self.publish();
        }
        if let Err(e) = &closed {
            tracing::warn!(error = %e, "Error closing peer connection");
        }
        closed
    }
}

impl Drop for MediaNegotiator {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.get_mut().take() {
            pump.abort();
        }
        if let Some(stream) = self.state.get_mut().local_stream.take() {
            stream.stop_all();
        }
    }
}

impl std::fmt::Debug for MediaNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MediaNegotiator")
            .field("session_id", &state.session_id)
            .field("call_type", &state.call_type)
            .field("connection_phase", &state.connection_phase)
            .field("ended", &state.ended)
            .finish()
    }
}
