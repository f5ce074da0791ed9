//! Call orchestration over the ledger
//!
//! The [`CallOrchestrator`] drives one party's side of a call: it creates a
//! [`MediaNegotiator`], writes offers and answers to the ledger, and tears the
//! negotiator down again. At most one negotiator is held at a time.
//!
//! ```text
//!              initiate_call                     connected
//!     Idle ───────────────────► Outgoing ───────────────────┐
//!       ▲                                                   ▼
//!       │      answer_call                   connected   Active
//!       ├─────────────────────► Incoming ──────────────────►│
//!       │                                                   │
//!       └──────────────────────── end_call ◄────────────────┘
//! ```

use crate::config::OrchestratorConfig;
use crate::identity::{Address, ObjectId};
use crate::ledger::{LedgerError, LedgerReader, LedgerTransaction, TransactionExecutor};
use crate::media::{MediaDevices, MediaError};
use crate::negotiator::MediaNegotiator;
use crate::observer::{ListenerId, StateListener, StatePublisher};
use crate::transport::{PeerTransportFactory, TransportError};
use crate::types::{CallSnapshot, CallType, SessionDescription};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Call errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Local media could not be acquired
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Call record missing or its offer unreadable
    #[error("Call session not found: {0}")]
    SessionNotFound(ObjectId),

    /// Ledger transaction failed
    #[error("Transaction failed: {0}")]
    TransactionFailed(#[from] LedgerError),

    /// Description exchange failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// ICE connectivity failed; the call may still recover
    #[error("ICE connection failed")]
    IceFailure,

    /// Peer connection failed
    #[error("Connection failed")]
    ConnectionFailed,

    /// Operation not valid in the current state
    #[error("Invalid call state: {0}")]
    InvalidState(String),
}

impl CallError {
    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            Self::Media(e) => e.user_message().to_string(),
            other => other.to_string(),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::NegotiationFailed(err.to_string())
    }
}

/// Which side of the call this party is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// Wrote the offer
    Caller,
    /// Wrote the answer
    Callee,
}

/// Orchestrator phase; exactly one holds at any time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// No negotiator held
    Idle,
    /// Our offer is out, not yet connected
    Outgoing,
    /// Answering a remote offer, not yet connected
    Incoming,
    /// Peer connection reached `connected`
    Active,
}

struct CurrentCall {
    negotiator: Arc<MediaNegotiator>,
    session_id: Option<ObjectId>,
    role: CallRole,
}

/// Coordinates one party's calls
pub struct CallOrchestrator {
    executor: Arc<dyn TransactionExecutor>,
    ledger: Arc<dyn LedgerReader>,
    devices: Arc<dyn MediaDevices>,
    transports: Arc<dyn PeerTransportFactory>,
    config: OrchestratorConfig,
    publisher: Arc<StatePublisher>,
    // Serializes initiate, answer and end
    op_lock: tokio::sync::Mutex<()>,
    current: RwLock<Option<CurrentCall>>,
}

impl CallOrchestrator {
    /// Create an orchestrator for the party `executor` signs as
    pub fn new(
        executor: Arc<dyn TransactionExecutor>,
        ledger: Arc<dyn LedgerReader>,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn PeerTransportFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            executor,
            ledger,
            devices,
            transports,
            config,
            publisher: Arc::new(StatePublisher::new()),
            op_lock: tokio::sync::Mutex::new(()),
            current: RwLock::new(None),
        }
    }

    /// Address of the local party
    pub fn local_address(&self) -> Address {
        self.executor.sender()
    }

    /// Configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Publisher every negotiator of this orchestrator reports through
    pub fn publisher(&self) -> &Arc<StatePublisher> {
        &self.publisher
    }

    /// Register a snapshot listener
    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> ListenerId {
        self.publisher.subscribe(listener)
    }

    /// Unregister a snapshot listener
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.publisher.unsubscribe(id)
    }

    /// Start a call: acquire media, write the offer to a new call record
    ///
    /// Any previous call is torn down first. On failure the new negotiator is
    /// disposed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `Media`, `NegotiationFailed` or `TransactionFailed`
    #[tracing::instrument(skip(self), fields(callee = %callee, call_type = %call_type))]
    pub async fn initiate_call(
        &self,
        caller_profile_id: &ObjectId,
        callee: &Address,
        callee_profile_id: &ObjectId,
        call_type: CallType,
    ) -> Result<ObjectId, CallError> {
        let _op = self.op_lock.lock().await;
        self.teardown_current().await;

        let negotiator = self.install(CallRole::Caller).await?;
        let result = async {
            negotiator.acquire_local_media(call_type).await?;
            let offer = negotiator.create_offer().await?;
            let payload = offer
                .to_payload()
                .map_err(|e| CallError::NegotiationFailed(format!("encoding offer: {e}")))?;

            let effects = self
                .executor
                .execute(LedgerTransaction::InitiateCall {
                    caller_profile: caller_profile_id.clone(),
                    callee: callee.clone(),
                    callee_profile_id: callee_profile_id.to_bytes(),
                    offer: payload,
                })
                .await?;
            effects.created_object().cloned().ok_or_else(|| {
                CallError::TransactionFailed(LedgerError::Unavailable(format!(
                    "transaction {} created no call record",
                    effects.digest
                )))
            })
        }
        .await;

        match result {
            Ok(session_id) => {
                self.record_session(&negotiator, session_id.clone());
                tracing::info!(session_id = %session_id, "Call initiated");
                Ok(session_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to initiate call");
                self.discard(&negotiator).await;
                Err(e)
            }
        }
    }

    /// Answer a call: acquire media, apply the record's offer, write the answer
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the record or its offer cannot be read,
    /// otherwise as [`initiate_call`](Self::initiate_call)
    #[tracing::instrument(skip(self), fields(session_id = %session_id, call_type = %call_type))]
    pub async fn answer_call(
        &self,
        session_id: &ObjectId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let _op = self.op_lock.lock().await;
        self.teardown_current().await;

        let negotiator = self.install(CallRole::Callee).await?;
        let result = async {
            negotiator.acquire_local_media(call_type).await?;
            let offer = self.read_offer(session_id).await?;
            let answer = negotiator.accept_remote_offer(offer).await?;
            let payload = answer
                .to_payload()
                .map_err(|e| CallError::NegotiationFailed(format!("encoding answer: {e}")))?;
            self.executor
                .execute(LedgerTransaction::AnswerCall {
                    session: session_id.clone(),
                    answer: payload,
                })
                .await?;
            Ok::<_, CallError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.record_session(&negotiator, session_id.clone());
                tracing::info!("Call answered");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to answer call");
                self.discard(&negotiator).await;
                Err(e)
            }
        }
    }

    /// Hang up. Always clears local state; teardown errors are only logged.
    #[tracing::instrument(skip(self))]
    pub async fn end_call(&self) {
        let _op = self.op_lock.lock().await;
        let Some(current) = self.current.write().take() else {
            tracing::debug!("No call to end");
            return;
        };

        if self.config.record_hangup {
            if let Some(session_id) = &current.session_id {
                if let Err(e) = self
                    .executor
                    .execute(LedgerTransaction::EndCall {
                        session: session_id.clone(),
                    })
                    .await
                {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to record hangup");
                }
            }
        }

        if let Err(e) = current.negotiator.end_call().await {
            tracing::warn!(error = %e, "Error ending call");
        }
        match &current.session_id {
            Some(session_id) => tracing::info!(session_id = %session_id, "Call ended"),
            None => tracing::info!("Call attempt ended"),
        }
    }

    /// Negotiator held and session id recorded
    pub fn is_call_active(&self) -> bool {
        self.current
            .read()
            .as_ref()
            .map(|c| c.session_id.is_some())
            .unwrap_or(false)
    }

    /// Session id of the current call, once recorded
    pub fn current_session_id(&self) -> Option<ObjectId> {
        self.current.read().as_ref().and_then(|c| c.session_id.clone())
    }

    /// Current phase
    pub fn phase(&self) -> CallPhase {
        let current = self.current.read();
        match current.as_ref() {
            None => CallPhase::Idle,
            Some(c) if c.negotiator.snapshot().is_call_active => CallPhase::Active,
            Some(c) => match c.role {
                CallRole::Caller => CallPhase::Outgoing,
                CallRole::Callee => CallPhase::Incoming,
            },
        }
    }

    /// Current negotiator
    pub fn negotiator(&self) -> Option<Arc<MediaNegotiator>> {
        self.current.read().as_ref().map(|c| Arc::clone(&c.negotiator))
    }

    /// Snapshot of the current negotiator
    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.negotiator().map(|n| n.snapshot())
    }

    /// Read the answer from a call record, if written
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the record does not exist,
    /// `TransactionFailed` if the ledger cannot be read, `NegotiationFailed`
    /// if the answer is not a session description
    pub async fn check_for_answer(
        &self,
        session_id: &ObjectId,
    ) -> Result<Option<SessionDescription>, CallError> {
        let record = self
            .ledger
            .get_call_record(session_id)
            .await?
            .ok_or_else(|| CallError::SessionNotFound(session_id.clone()))?;
        record
            .answer
            .as_deref()
            .map(|bytes| {
                SessionDescription::from_payload(bytes)
                    .map_err(|e| CallError::NegotiationFailed(format!("decoding answer: {e}")))
            })
            .transpose()
    }

    /// Feed a discovered answer to the current negotiator
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` with no call in progress, otherwise as
    /// [`MediaNegotiator::accept_remote_answer`]
    pub async fn apply_remote_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        let negotiator = self
            .negotiator()
            .ok_or_else(|| CallError::InvalidState("no call in progress".to_string()))?;
        negotiator.accept_remote_answer(answer).await
    }

    /// Toggle local audio; false without a call
    pub fn toggle_audio(&self) -> bool {
        self.negotiator().map(|n| n.toggle_audio()).unwrap_or(false)
    }

    /// Toggle local video; false without a call
    pub fn toggle_video(&self) -> bool {
        self.negotiator().map(|n| n.toggle_video()).unwrap_or(false)
    }

    async fn read_offer(&self, session_id: &ObjectId) -> Result<SessionDescription, CallError> {
        let record = match self.ledger.get_call_record(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(CallError::SessionNotFound(session_id.clone())),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read call record");
                return Err(CallError::SessionNotFound(session_id.clone()));
            }
        };
        if record.offer.is_empty() {
            return Err(CallError::SessionNotFound(session_id.clone()));
        }
        SessionDescription::from_payload(&record.offer).map_err(|e| {
            tracing::warn!(error = %e, "Unreadable offer");
            CallError::SessionNotFound(session_id.clone())
        })
    }

    async fn install(&self, role: CallRole) -> Result<Arc<MediaNegotiator>, CallError> {
        let negotiator = MediaNegotiator::new(
            Arc::clone(&self.devices),
            self.transports.as_ref(),
            &self.config.ice,
            Arc::clone(&self.publisher),
        )
        .await?;
        *self.current.write() = Some(CurrentCall {
            negotiator: Arc::clone(&negotiator),
            session_id: None,
            role,
        });
        Ok(negotiator)
    }

    fn record_session(&self, negotiator: &Arc<MediaNegotiator>, session_id: ObjectId) {
        if let Some(current) = self.current.write().as_mut() {
            if Arc::ptr_eq(&current.negotiator, negotiator) {
                current.session_id = Some(session_id.clone());
            }
        }
        negotiator.set_session_id(session_id);
    }

    /// End the held negotiator so its devices are free before the next one
    async fn teardown_current(&self) {
        let previous = self.current.write().take();
        if let Some(previous) = previous {
            tracing::debug!("Tearing down previous call");
            if let Err(e) = previous.negotiator.end_call().await {
                tracing::warn!(error = %e, "Error ending previous call");
            }
        }
    }

    async fn discard(&self, negotiator: &Arc<MediaNegotiator>) {
        {
            let mut current = self.current.write();
            if current
                .as_ref()
                .map(|c| Arc::ptr_eq(&c.negotiator, negotiator))
                .unwrap_or(false)
            {
                *current = None;
            }
        }
        if let Err(e) = negotiator.end_call().await {
            tracing::warn!(error = %e, "Error disposing negotiator");
        }
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("local", &self.local_address())
            .field("phase", &self.phase())
            .field("session_id", &self.current_session_id())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ledger::{CallStatus, InMemoryLedger};
    use crate::media::{TrackKind, VirtualDevices};
    use crate::testing::ScriptedTransportFactory;
    use crate::types::SdpType;
    use pretty_assertions::assert_eq;

    struct Party {
        orchestrator: CallOrchestrator,
        devices: VirtualDevices,
        factory: ScriptedTransportFactory,
        profile: ObjectId,
    }

    fn party(ledger: &InMemoryLedger, address: &str, config: OrchestratorConfig) -> Party {
        let devices = VirtualDevices::new();
        let factory = ScriptedTransportFactory::new();
        let profile = ledger.register_profile(Address::new(address), address);
        let orchestrator = CallOrchestrator::new(
            Arc::new(ledger.executor(Address::new(address))),
            Arc::new(ledger.clone()),
            Arc::new(devices.clone()),
            Arc::new(factory.clone()),
            config,
        );
        Party {
            orchestrator,
            devices,
            factory,
            profile,
        }
    }

    fn pair() -> (InMemoryLedger, Party, Party) {
        let ledger = InMemoryLedger::new();
        let caller = party(&ledger, "0xa11ce", OrchestratorConfig::default());
        let callee = party(&ledger, "0xabc", OrchestratorConfig::default());
        (ledger, caller, callee)
    }

    #[tokio::test]
    async fn test_initiate_voice_call_writes_offer() {
        let (ledger, caller, callee) = pair();
        let session_id = caller
            .orchestrator
            .initiate_call(
                &caller.profile,
                &Address::new("0xABC"),
                &callee.profile,
                CallType::Voice,
            )
            .await
            .unwrap();

        assert!(caller.orchestrator.is_call_active());
        assert_eq!(caller.orchestrator.current_session_id(), Some(session_id.clone()));
        assert_eq!(caller.orchestrator.phase(), CallPhase::Outgoing);

        let stream = caller.orchestrator.snapshot().unwrap().local_stream.unwrap();
        assert_eq!(stream.count(TrackKind::Audio), 1);
        assert_eq!(stream.count(TrackKind::Video), 0);

        let record = ledger.get_call_record(&session_id).await.unwrap().unwrap();
        let offer = SessionDescription::from_payload(&record.offer).unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(record.answer, None);
        assert_eq!(record.status, CallStatus::Initiated);
        assert_eq!(record.callee_profile_id, callee.profile);
    }

    #[tokio::test]
    async fn test_answer_writes_answer_once() {
        let (ledger, caller, callee) = pair();
        let session_id = caller
            .orchestrator
            .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Video)
            .await
            .unwrap();

        callee
            .orchestrator
            .answer_call(&session_id, CallType::Video)
            .await
            .unwrap();
        assert!(callee.orchestrator.is_call_active());
        assert_eq!(callee.orchestrator.phase(), CallPhase::Incoming);

        let answer = caller
            .orchestrator
            .check_for_answer(&session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);

        let record = ledger.get_call_record(&session_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Answered);

        // A second answer from a fresh attempt is refused and cleaned up
        let again = callee.orchestrator.answer_call(&session_id, CallType::Voice).await;
        assert!(matches!(again, Err(CallError::TransactionFailed(_))));
        assert_eq!(callee.devices.in_use(), 0);
        assert_eq!(callee.orchestrator.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_answer_missing_session_releases_media() {
        let (_ledger, _caller, callee) = pair();
        let result = callee
            .orchestrator
            .answer_call(&ObjectId::new("0xmissing"), CallType::Video)
            .await;
        assert!(matches!(result, Err(CallError::SessionNotFound(_))));
        assert_eq!(callee.devices.in_use(), 0);
        assert!(!callee.orchestrator.is_call_active());
        assert!(callee.orchestrator.negotiator().is_none());
        assert!(callee.factory.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_media_failure_cleans_up_and_reraises() {
        let (ledger, caller, callee) = pair();
        caller.devices.set_permission(false);
        let result = caller
            .orchestrator
            .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Voice)
            .await;
        assert!(matches!(result, Err(CallError::Media(MediaError::PermissionDenied(_)))));
        assert_eq!(caller.orchestrator.phase(), CallPhase::Idle);
        assert_eq!(ledger.record_count(), 0);
        assert!(caller.orchestrator.publisher().latest().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_transaction_failure_cleans_up() {
        let (ledger, caller, callee) = pair();
        // Profile owned by someone else
        let result = caller
            .orchestrator
            .initiate_call(&callee.profile, &Address::new("0xabc"), &callee.profile, CallType::Video)
            .await;
        assert!(matches!(result, Err(CallError::TransactionFailed(_))));
        assert_eq!(caller.devices.in_use(), 0);
        assert_eq!(ledger.record_count(), 0);
        assert!(!caller.orchestrator.is_call_active());
    }

    #[tokio::test]
    async fn test_new_initiate_replaces_previous_attempt() {
        let (_ledger, caller, callee) = pair();
        for _ in 0..2 {
            caller
                .orchestrator
                .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Video)
                .await
                .unwrap();
        }
        // Devices are exclusive, so the second attempt only succeeds if the
        // first released them
        assert_eq!(caller.devices.in_use(), 2);
        assert_eq!(caller.factory.created(), 2);
        assert!(caller.factory.transports()[0].is_closed());
        assert!(!caller.factory.transports()[1].is_closed());
    }

    #[tokio::test]
    async fn test_end_call_always_clears() {
        let (_ledger, caller, callee) = pair();
        caller.orchestrator.end_call().await;

        caller
            .orchestrator
            .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Video)
            .await
            .unwrap();
        caller.factory.last().unwrap().fail_close();
        caller.orchestrator.end_call().await;

        assert!(!caller.orchestrator.is_call_active());
        assert_eq!(caller.orchestrator.current_session_id(), None);
        assert_eq!(caller.orchestrator.phase(), CallPhase::Idle);
        assert_eq!(caller.devices.in_use(), 0);
        let last = caller.orchestrator.publisher().latest().unwrap();
        assert_eq!(last.live_local_tracks(), 0);
        assert!(!last.has_connection);
    }

    #[tokio::test]
    async fn test_record_hangup_marks_record_ended() {
        let ledger = InMemoryLedger::new();
        let caller = party(
            &ledger,
            "0xa11ce",
            OrchestratorConfig {
                record_hangup: true,
                ..Default::default()
            },
        );
        let callee = party(&ledger, "0xabc", OrchestratorConfig::default());
        let session_id = caller
            .orchestrator
            .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Voice)
            .await
            .unwrap();
        caller.orchestrator.end_call().await;

        let record = ledger.get_call_record(&session_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_check_for_answer_absent_and_missing() {
        let (_ledger, caller, callee) = pair();
        let session_id = caller
            .orchestrator
            .initiate_call(&caller.profile, &Address::new("0xabc"), &callee.profile, CallType::Voice)
            .await
            .unwrap();
        assert_eq!(caller.orchestrator.check_for_answer(&session_id).await.unwrap(), None);
        assert!(matches!(
            caller.orchestrator.check_for_answer(&ObjectId::new("0xnone")).await,
            Err(CallError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_toggles_without_call() {
        let (_ledger, caller, _callee) = pair();
        assert!(!caller.orchestrator.toggle_audio());
        assert!(!caller.orchestrator.toggle_video());
        assert!(matches!(
            caller
                .orchestrator
                .apply_remote_answer(SessionDescription::answer("v=0"))
                .await,
            Err(CallError::InvalidState(_))
        ));
    }
}
