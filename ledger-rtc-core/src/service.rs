//! Per-party call service
//!
//! Bundles the orchestrator, poller and projector for one party and owns the
//! poll loops, so an application only holds a single handle.

use crate::call::{CallError, CallOrchestrator};
use crate::config::LedgerRtcConfig;
use crate::identity::{Address, ObjectId};
use crate::ledger::{LedgerReader, ProfileResolver, TransactionExecutor};
use crate::media::{MediaDevices, VirtualDevices};
use crate::projector::{CallStateProjector, ProjectedState};
use crate::signaling::{IncomingCall, PollTask, SignalingPoller};
use crate::transport::PeerTransportFactory;
use crate::types::CallType;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// Call error
    #[error(transparent)]
    Call(#[from] CallError),

    /// No incoming call to act on
    #[error("No incoming call")]
    NoIncomingCall,
}

/// One party's call service
pub struct LedgerRtcService {
    orchestrator: Arc<CallOrchestrator>,
    poller: Arc<SignalingPoller>,
    projector: CallStateProjector,
    incoming_task: Mutex<Option<PollTask>>,
    answer_task: Mutex<Option<PollTask>>,
}

impl LedgerRtcService {
    /// Create a builder
    #[must_use]
    pub fn builder(
        executor: Arc<dyn TransactionExecutor>,
        ledger: Arc<dyn LedgerReader>,
        profiles: Arc<dyn ProfileResolver>,
    ) -> LedgerRtcServiceBuilder {
        LedgerRtcServiceBuilder::new(executor, ledger, profiles)
    }

    /// Address of the local party
    pub fn local_address(&self) -> Address {
        self.orchestrator.local_address()
    }

    /// Start incoming-call discovery
    #[tracing::instrument(skip(self), fields(local = %self.local_address()))]
    pub fn start(&self) {
        let mut task = self.incoming_task.lock();
        if task.is_none() {
            *task = Some(self.poller.start_incoming_discovery());
            tracing::info!("Call service started");
        }
    }

    /// Stop every poll loop and hang up
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.incoming_task.lock().take();
        self.answer_task.lock().take();
        self.projector.end_call().await;
        tracing::info!("Call service stopped");
    }

    /// Call `callee` and watch the record for the answer
    ///
    /// # Errors
    ///
    /// Returns error if the call cannot be initiated
    #[tracing::instrument(skip(self), fields(callee = %callee))]
    pub async fn initiate_call(
        &self,
        caller_profile_id: &ObjectId,
        callee: &Address,
        callee_profile_id: &ObjectId,
        call_type: CallType,
    ) -> Result<ObjectId, ServiceError> {
        self.answer_task.lock().take();
        let session_id = self
            .projector
            .initiate_call(caller_profile_id, callee, callee_profile_id, call_type)
            .await?;
        *self.answer_task.lock() = Some(self.poller.watch_for_answer(session_id.clone()));
        Ok(session_id)
    }

    /// Answer the surfaced incoming call
    ///
    /// The notification is resolved whether or not answering succeeds.
    ///
    /// # Errors
    ///
    /// Returns `NoIncomingCall` if none is surfaced, otherwise the answer error
    #[tracing::instrument(skip(self))]
    pub async fn answer_incoming(&self, call_type: CallType) -> Result<IncomingCall, ServiceError> {
        let incoming = self
            .poller
            .pending_incoming()
            .ok_or(ServiceError::NoIncomingCall)?;
        self.answer_task.lock().take();
        let result = self
            .projector
            .answer_call(&incoming.session_id, call_type)
            .await;
        self.poller.resolve_incoming();
        result?;
        Ok(incoming)
    }

    /// Dismiss the surfaced incoming call without answering
    ///
    /// Nothing is written to the ledger; the caller's attempt simply goes
    /// unanswered.
    ///
    /// # Errors
    ///
    /// Returns `NoIncomingCall` if none is surfaced
    pub fn reject_incoming(&self) -> Result<IncomingCall, ServiceError> {
        let incoming = self
            .poller
            .resolve_incoming()
            .ok_or(ServiceError::NoIncomingCall)?;
        tracing::info!(session_id = %incoming.session_id, "Incoming call rejected");
        Ok(incoming)
    }

    /// Hang up the current call
    pub async fn end_call(&self) {
        self.answer_task.lock().take();
        self.projector.end_call().await;
    }

    /// Toggle local audio
    pub fn toggle_audio(&self) -> bool {
        self.projector.toggle_audio()
    }

    /// Toggle local video
    pub fn toggle_video(&self) -> bool {
        self.projector.toggle_video()
    }

    /// Projected state
    pub fn state(&self) -> ProjectedState {
        self.projector.state()
    }

    /// Follow the projected state
    pub fn watch_state(&self) -> watch::Receiver<ProjectedState> {
        self.projector.watch()
    }

    /// Receive surfaced incoming calls
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<IncomingCall> {
        self.poller.subscribe_incoming()
    }

    /// Underlying orchestrator
    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    /// Underlying poller
    pub fn poller(&self) -> &Arc<SignalingPoller> {
        &self.poller
    }
}

impl std::fmt::Debug for LedgerRtcService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerRtcService")
            .field("orchestrator", &self.orchestrator)
            .field("polling", &self.incoming_task.lock().is_some())
            .finish()
    }
}

/// Builder for [`LedgerRtcService`]
pub struct LedgerRtcServiceBuilder {
    executor: Arc<dyn TransactionExecutor>,
    ledger: Arc<dyn LedgerReader>,
    profiles: Arc<dyn ProfileResolver>,
    devices: Option<Arc<dyn MediaDevices>>,
    transports: Option<Arc<dyn PeerTransportFactory>>,
    config: LedgerRtcConfig,
}

impl LedgerRtcServiceBuilder {
    /// Create new builder
    #[must_use]
    pub fn new(
        executor: Arc<dyn TransactionExecutor>,
        ledger: Arc<dyn LedgerReader>,
        profiles: Arc<dyn ProfileResolver>,
    ) -> Self {
        Self {
            executor,
            ledger,
            profiles,
            devices: None,
            transports: None,
            config: LedgerRtcConfig::default(),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: LedgerRtcConfig) -> Self {
        self.config = config;
        self
    }

    /// Capture devices; defaults to [`VirtualDevices`]
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Peer connection factory; defaults to the `webrtc` backend when enabled
    #[must_use]
    pub fn with_transports(mut self, transports: Arc<dyn PeerTransportFactory>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if no peer connection factory is available
    pub fn build(self) -> Result<LedgerRtcService, ServiceError> {
        let transports = match self.transports {
            Some(transports) => transports,
            None => default_transports()?,
        };
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(VirtualDevices::new()));

        let orchestrator = Arc::new(CallOrchestrator::new(
            self.executor,
            Arc::clone(&self.ledger),
            devices,
            transports,
            self.config.orchestrator,
        ));
        let poller = Arc::new(SignalingPoller::new(
            Arc::clone(&orchestrator),
            self.ledger,
            self.profiles,
            self.config.poller,
        ));
        let projector = CallStateProjector::new(Arc::clone(&orchestrator));

        Ok(LedgerRtcService {
            orchestrator,
            poller,
            projector,
            incoming_task: Mutex::new(None),
            answer_task: Mutex::new(None),
        })
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    Ok(Arc::new(crate::webrtc_transport::WebRtcTransportFactory::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_transports() -> Result<Arc<dyn PeerTransportFactory>, ServiceError> {
    Err(ServiceError::InitError(
        "no peer connection factory configured".to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::testing::ScriptedTransportFactory;
    use pretty_assertions::assert_eq;

    fn service(ledger: &InMemoryLedger, address: &str) -> LedgerRtcService {
        LedgerRtcService::builder(
            Arc::new(ledger.executor(Address::new(address))),
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
        )
        .with_transports(Arc::new(ScriptedTransportFactory::new()))
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn test_answer_and_reject_need_incoming() {
        let ledger = InMemoryLedger::new();
        let svc = service(&ledger, "0xb0b");
        assert!(matches!(
            svc.answer_incoming(CallType::Voice).await,
            Err(ServiceError::NoIncomingCall)
        ));
        assert!(matches!(svc.reject_incoming(), Err(ServiceError::NoIncomingCall)));
    }

    #[tokio::test]
    async fn test_reject_keeps_record_untouched() {
        let ledger = InMemoryLedger::new();
        let alice = service(&ledger, "0xa11ce");
        let bob = service(&ledger, "0xb0b");
        let alice_profile = ledger.register_profile(Address::new("0xa11ce"), "alice");
        let bob_profile = ledger.register_profile(Address::new("0xb0b"), "bob");

        let session_id = alice
            .initiate_call(&alice_profile, &Address::new("0xb0b"), &bob_profile, CallType::Voice)
            .await
            .unwrap();
        bob.poller().poll_incoming_once().await.unwrap().unwrap();
        let rejected = bob.reject_incoming().unwrap();
        assert_eq!(rejected.session_id, session_id);

        let record = ledger.get_call_record(&session_id).await.unwrap().unwrap();
        assert_eq!(record.answer, None);
        assert_eq!(bob.poller().pending_incoming(), None);
        alice.shutdown().await;
    }
}
