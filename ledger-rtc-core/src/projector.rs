//! UI-facing call state
//!
//! [`CallStateProjector`] wraps the orchestrator's user actions with
//! loading/error bookkeeping and folds negotiator snapshots into a single
//! [`ProjectedState`] on a watch channel.

use crate::call::{CallError, CallOrchestrator};
use crate::identity::{Address, ObjectId};
use crate::observer::ListenerId;
use crate::types::{CallSnapshot, CallType};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Consolidated state for presentation
#[derive(Debug, Clone, Default)]
pub struct ProjectedState {
    /// Latest call snapshot, `None` when no call is held
    pub call: Option<CallSnapshot>,
    /// An operation is running
    pub loading: bool,
    /// Message of the last failed operation
    pub error: Option<String>,
}

/// Projects orchestrator state for a presentation layer
pub struct CallStateProjector {
    orchestrator: Arc<CallOrchestrator>,
    state: Arc<watch::Sender<ProjectedState>>,
    listener: ListenerId,
}

impl CallStateProjector {
    /// Start projecting `orchestrator`
    pub fn new(orchestrator: Arc<CallOrchestrator>) -> Self {
        let (tx, _) = watch::channel(ProjectedState {
            call: orchestrator.snapshot(),
            ..Default::default()
        });
        let state = Arc::new(tx);
        let sink = Arc::clone(&state);
        let listener = orchestrator.subscribe(Arc::new(move |snapshot: &CallSnapshot| {
            sink.send_modify(|s| {
                // Failures reported by the connection itself surface too
                if let Some(error) = &snapshot.error {
                    s.error = Some(error.clone());
                }
                s.call = Some(snapshot.clone());
            });
        }));
        Self {
            orchestrator,
            state,
            listener,
        }
    }

    /// Current projected state
    pub fn state(&self) -> ProjectedState {
        self.state.borrow().clone()
    }

    /// Follow the projected state
    pub fn watch(&self) -> watch::Receiver<ProjectedState> {
        self.state.subscribe()
    }

    /// Underlying orchestrator
    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    async fn tracked<T, F>(&self, op: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, CallError>>,
    {
        self.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });
        let result = op.await;
        self.state.send_modify(|s| {
            s.loading = false;
            if let Err(e) = &result {
                s.error = Some(e.user_message());
            }
        });
        result
    }

    /// Start a call
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error after recording its message
    pub async fn initiate_call(
        &self,
        caller_profile_id: &ObjectId,
        callee: &Address,
        callee_profile_id: &ObjectId,
        call_type: CallType,
    ) -> Result<ObjectId, CallError> {
        self.tracked(self.orchestrator.initiate_call(
            caller_profile_id,
            callee,
            callee_profile_id,
            call_type,
        ))
        .await
    }

    /// Answer a call
    ///
    /// # Errors
    ///
    /// Returns the orchestrator's error after recording its message
    pub async fn answer_call(&self, session_id: &ObjectId, call_type: CallType) -> Result<(), CallError> {
        self.tracked(self.orchestrator.answer_call(session_id, call_type))
            .await
    }

    /// Hang up and drop the call from the projection
    pub async fn end_call(&self) {
        let _ = self
            .tracked(async {
                self.orchestrator.end_call().await;
                Ok(())
            })
            .await;
        self.state.send_modify(|s| s.call = None);
    }

    /// Toggle local audio
    pub fn toggle_audio(&self) -> bool {
        self.orchestrator.toggle_audio()
    }

    /// Toggle local video
    pub fn toggle_video(&self) -> bool {
        self.orchestrator.toggle_video()
    }

    /// Dismiss the recorded error
    pub fn clear_error(&self) {
        self.state.send_modify(|s| s.error = None);
    }
}

impl Drop for CallStateProjector {
    fn drop(&mut self) {
        self.orchestrator.unsubscribe(self.listener);
    }
}

impl std::fmt::Debug for CallStateProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("CallStateProjector")
            .field("loading", &state.loading)
            .field("error", &state.error)
            .field("has_call", &state.call.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::ledger::InMemoryLedger;
    use crate::media::VirtualDevices;
    use crate::testing::ScriptedTransportFactory;
    use crate::transport::TransportEvent;
    use crate::types::ConnectionPhase;
    use pretty_assertions::assert_eq;

    fn projector(devices: VirtualDevices) -> (CallStateProjector, ObjectId, ObjectId) {
        let ledger = InMemoryLedger::new();
        let mine = ledger.register_profile(Address::new("0xa11ce"), "alice");
        let theirs = ledger.register_profile(Address::new("0xb0b"), "bob");
        let orchestrator = Arc::new(CallOrchestrator::new(
            Arc::new(ledger.executor(Address::new("0xa11ce"))),
            Arc::new(ledger),
            Arc::new(devices),
            Arc::new(ScriptedTransportFactory::new()),
            OrchestratorConfig::default(),
        ));
        (CallStateProjector::new(orchestrator), mine, theirs)
    }

    #[tokio::test]
    async fn test_successful_call_is_projected() {
        let (projector, mine, theirs) = projector(VirtualDevices::new());
        let rx = projector.watch();
        let session_id = projector
            .initiate_call(&mine, &Address::new("0xb0b"), &theirs, CallType::Voice)
            .await
            .unwrap();

        let state = projector.state();
        assert!(!state.loading);
        assert_eq!(state.error, None);
        assert_eq!(state.call.unwrap().session_id, Some(session_id));
        assert!(rx.has_changed().unwrap());

        projector.end_call().await;
        let state = projector.state();
        assert!(state.call.is_none());
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn test_failure_records_user_message() {
        let (projector, mine, theirs) = projector(VirtualDevices::new().without_camera());
        let result = projector
            .initiate_call(&mine, &Address::new("0xb0b"), &theirs, CallType::Video)
            .await;
        assert!(result.is_err());

        let state = projector.state();
        assert!(!state.loading);
        assert_eq!(
            state.error.as_deref(),
            Some("No camera/microphone found. Please check your devices.")
        );

        projector.clear_error();
        assert_eq!(projector.state().error, None);
    }

    #[tokio::test]
    async fn test_connection_failure_reaches_projected_error() {
        let (projector, mine, theirs) = projector(VirtualDevices::new());
        projector
            .initiate_call(&mine, &Address::new("0xb0b"), &theirs, CallType::Voice)
            .await
            .unwrap();
        assert_eq!(projector.state().error, None);

        let negotiator = projector.orchestrator().negotiator().unwrap();
        negotiator.handle_transport_event(TransportEvent::ConnectionStateChanged(
            ConnectionPhase::Failed,
        ));

        let state = projector.state();
        assert_eq!(state.error.as_deref(), Some("Connection failed"));
        assert!(!state.loading);
        assert!(!state.call.unwrap().is_call_active);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (projector, _, _) = projector(VirtualDevices::new());
        let orchestrator = Arc::clone(projector.orchestrator());
        assert_eq!(orchestrator.publisher().listener_count(), 1);
        drop(projector);
        assert_eq!(orchestrator.publisher().listener_count(), 0);
    }
}
