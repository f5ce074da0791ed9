//! Ledger polling for call signaling
//!
//! The ledger offers no push channel, so both directions of signaling are
//! discovered by polling:
//!
//! - incoming-call discovery reads recent call-created events addressed to
//!   the local party and surfaces the first unseen one as an [`IncomingCall`]
//! - answer discovery watches the outgoing call record until the callee's
//!   answer appears and hands it to the negotiator
//!
//! Both loops run as tasks owned by a [`PollTask`]; dropping the handle stops
//! the loop and any tick that still fires afterwards does nothing.

use crate::call::{CallError, CallOrchestrator, CallPhase};
use crate::config::PollerConfig;
use crate::identity::{Address, ObjectId};
use crate::ledger::{LedgerReader, ProfileResolver};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Call addressed to the local party, not yet answered or rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    /// Call record
    pub session_id: ObjectId,
    /// Calling party
    pub caller: Address,
    /// Caller's profile record
    pub caller_profile_id: ObjectId,
    /// Caller display name, if the profile could be read
    pub caller_name: Option<String>,
    /// Caller avatar URL
    pub caller_avatar: Option<String>,
}

/// Handle to a running poll loop; dropping it cancels the loop
#[derive(Debug)]
pub struct PollTask {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PollTask {
    fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (cancel, mut cancelled) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancelled.changed() => break,
                }
                if *cancelled.borrow() {
                    break;
                }
                if !tick().await {
                    tracing::debug!(task = name, "Poll loop finished");
                    break;
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the loop
    pub fn cancel(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }
}

impl Drop for PollTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Default)]
struct IncomingState {
    seen: HashSet<ObjectId>,
    pending: Option<IncomingCall>,
}

/// Discovers incoming calls and answers by polling the ledger
pub struct SignalingPoller {
    orchestrator: Arc<CallOrchestrator>,
    ledger: Arc<dyn LedgerReader>,
    profiles: Arc<dyn ProfileResolver>,
    config: PollerConfig,
    local: Address,
    incoming: Mutex<IncomingState>,
    incoming_tx: broadcast::Sender<IncomingCall>,
}

impl SignalingPoller {
    /// Create a poller for the orchestrator's party
    pub fn new(
        orchestrator: Arc<CallOrchestrator>,
        ledger: Arc<dyn LedgerReader>,
        profiles: Arc<dyn ProfileResolver>,
        config: PollerConfig,
    ) -> Self {
        let local = orchestrator.local_address();
        let (incoming_tx, _) = broadcast::channel(16);
        Self {
            orchestrator,
            ledger,
            profiles,
            config,
            local,
            incoming: Mutex::new(IncomingState::default()),
            incoming_tx,
        }
    }

    /// Receive every surfaced incoming call
    pub fn subscribe_incoming(&self) -> broadcast::Receiver<IncomingCall> {
        self.incoming_tx.subscribe()
    }

    /// Incoming call currently surfaced
    pub fn pending_incoming(&self) -> Option<IncomingCall> {
        self.incoming.lock().pending.clone()
    }

    /// Clear the surfaced call after it was answered or rejected
    ///
    /// Its session id stays seen, so it is not surfaced again.
    pub fn resolve_incoming(&self) -> Option<IncomingCall> {
        self.incoming.lock().pending.take()
    }

    /// Run incoming-call discovery now and then every `incoming_interval`
    pub fn start_incoming_discovery(self: &Arc<Self>) -> PollTask {
        let poller = Arc::clone(self);
        PollTask::spawn("incoming", self.config.incoming_interval(), move || {
            let poller = Arc::clone(&poller);
            async move {
                if let Err(e) = poller.poll_incoming_once().await {
                    tracing::warn!(error = %e, "Incoming call poll failed");
                }
                true
            }
        })
    }

    /// Run answer discovery for `session_id` now and then every
    /// `answer_interval`, until the answer has been applied
    pub fn watch_for_answer(self: &Arc<Self>, session_id: ObjectId) -> PollTask {
        let poller = Arc::clone(self);
        PollTask::spawn("answer", self.config.answer_interval(), move || {
            let poller = Arc::clone(&poller);
            let session_id = session_id.clone();
            async move {
                match poller.poll_answer_once(&session_id).await {
                    Ok(applied) => !applied,
                    Err(e) => {
                        tracing::warn!(session_id = %session_id, error = %e, "Answer poll failed");
                        true
                    }
                }
            }
        })
    }

    /// One incoming-call discovery pass
    ///
    /// Returns the newly surfaced call, if any.
    ///
    /// # Errors
    ///
    /// Returns `TransactionFailed` if the ledger cannot be queried
    #[tracing::instrument(skip(self), fields(local = %self.local))]
    pub async fn poll_incoming_once(&self) -> Result<Option<IncomingCall>, CallError> {
        if self.orchestrator.phase() == CallPhase::Outgoing {
            tracing::trace!("Outgoing call pending, skipping incoming poll");
            return Ok(None);
        }
        if self.incoming.lock().pending.is_some() {
            return Ok(None);
        }

        let events = self
            .ledger
            .query_call_created(self.config.event_query_limit)
            .await?;
        let candidate = {
            let mut state = self.incoming.lock();
            // Ids outside the query window are never returned again
            state
                .seen
                .retain(|id| events.iter().any(|event| &event.session_id == id));
            events.into_iter().find(|event| {
                event.callee.matches(&self.local)
                    && !event.caller.matches(&self.local)
                    && !state.seen.contains(&event.session_id)
            })
        };
        let Some(event) = candidate else {
            return Ok(None);
        };

        let profile = match self.profiles.profile(&event.caller_profile).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve caller profile");
                None
            }
        };
        let call = IncomingCall {
            session_id: event.session_id,
            caller: event.caller,
            caller_profile_id: event.caller_profile,
            caller_name: profile.as_ref().map(|p| p.name.clone()),
            caller_avatar: profile.and_then(|p| p.avatar),
        };

        {
            let mut state = self.incoming.lock();
            // Another pass may have surfaced it while the profile was read
            if state.pending.is_some() || !state.seen.insert(call.session_id.clone()) {
                return Ok(None);
            }
            state.pending = Some(call.clone());
        }
        tracing::info!(session_id = %call.session_id, caller = %call.caller, "Incoming call");
        let _ = self.incoming_tx.send(call.clone());
        Ok(Some(call))
    }

    /// One answer discovery pass for `session_id`
    ///
    /// Returns true once the answer has been applied (or there is nothing
    /// left to wait for).
    ///
    /// # Errors
    ///
    /// Returns the error from reading the record or applying the answer
    #[tracing::instrument(skip(self), fields(session_id = %session_id))]
    pub async fn poll_answer_once(&self, session_id: &ObjectId) -> Result<bool, CallError> {
        if self.orchestrator.current_session_id().as_ref() != Some(session_id) {
            tracing::debug!("Call no longer current, stopping answer poll");
            return Ok(true);
        }
        let connected = self
            .orchestrator
            .snapshot()
            .map(|s| s.is_connected)
            .unwrap_or(false);
        if connected {
            return Ok(true);
        }

        let Some(answer) = self.orchestrator.check_for_answer(session_id).await? else {
            return Ok(false);
        };
        tracing::info!("Answer received");
        self.orchestrator.apply_remote_answer(answer).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for SignalingPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingPoller")
            .field("local", &self.local)
            .field("pending", &self.pending_incoming())
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
    use crate::testing::{settle, ScriptedTransportFactory};
    use crate::types::CallType;
    use pretty_assertions::assert_eq;

    struct Side {
        orchestrator: Arc<CallOrchestrator>,
        poller: Arc<SignalingPoller>,
        profile: ObjectId,
    }

    fn side(ledger: &InMemoryLedger, address: &str) -> Side {
        let profile = ledger.register_profile(Address::new(address), format!("user {address}"));
        let orchestrator = Arc::new(CallOrchestrator::new(
            Arc::new(ledger.executor(Address::new(address))),
            Arc::new(ledger.clone()),
            Arc::new(VirtualDevices::new()),
            Arc::new(ScriptedTransportFactory::new()),
            OrchestratorConfig::default(),
        ));
        let poller = Arc::new(SignalingPoller::new(
            Arc::clone(&orchestrator),
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            PollerConfig::default(),
        ));
        Side {
            orchestrator,
            poller,
            profile,
        }
    }

    async fn call(caller: &Side, callee: &Side, callee_address: &str) -> ObjectId {
        caller
            .orchestrator
            .initiate_call(
                &caller.profile,
                &Address::new(callee_address),
                &callee.profile,
                CallType::Voice,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_incoming_surfaced_once() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let session_id = call(&alice, &bob, "0xb0b").await;

        let incoming = bob.poller.poll_incoming_once().await.unwrap().unwrap();
        assert_eq!(incoming.session_id, session_id);
        assert_eq!(incoming.caller, Address::new("0xa11ce"));
        assert_eq!(incoming.caller_name.as_deref(), Some("user 0xa11ce"));
        assert_eq!(bob.poller.pending_incoming(), Some(incoming));

        // Held until resolved, and never surfaced again afterwards
        assert_eq!(bob.poller.poll_incoming_once().await.unwrap(), None);
        assert!(bob.poller.resolve_incoming().is_some());
        assert_eq!(bob.poller.poll_incoming_once().await.unwrap(), None);
        assert_eq!(bob.poller.pending_incoming(), None);
    }

    #[tokio::test]
    async fn test_calls_for_others_are_ignored() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let carol = side(&ledger, "0xca201");
        call(&alice, &carol, "0xca201").await;
        assert_eq!(bob.poller.poll_incoming_once().await.unwrap(), None);
        // The caller does not see its own call as incoming
        assert_eq!(alice.poller.poll_incoming_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incoming_suspended_while_outgoing() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        call(&bob, &alice, "0xa11ce").await;
        call(&alice, &bob, "0xb0b").await;

        assert_eq!(bob.orchestrator.phase(), CallPhase::Outgoing);
        assert_eq!(bob.poller.poll_incoming_once().await.unwrap(), None);

        bob.orchestrator.end_call().await;
        assert!(bob.poller.poll_incoming_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_answer_poll_applies_answer_once() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let session_id = call(&alice, &bob, "0xb0b").await;

        assert!(!alice.poller.poll_answer_once(&session_id).await.unwrap());
        bob.orchestrator
            .answer_call(&session_id, CallType::Voice)
            .await
            .unwrap();
        assert!(alice.poller.poll_answer_once(&session_id).await.unwrap());

        // Stale session: nothing to do
        assert!(alice
            .poller
            .poll_answer_once(&ObjectId::new("0xother"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_seen_sessions_pruned_to_query_window() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let poller = SignalingPoller::new(
            Arc::clone(&bob.orchestrator),
            Arc::new(ledger.clone()),
            Arc::new(ledger.clone()),
            PollerConfig {
                event_query_limit: 2,
                ..Default::default()
            },
        );

        let first = call(&alice, &bob, "0xb0b").await;
        let second = call(&alice, &bob, "0xb0b").await;
        let third = call(&alice, &bob, "0xb0b").await;

        let mut surfaced = Vec::new();
        for _ in 0..3 {
            if let Some(incoming) = poller.poll_incoming_once().await.unwrap() {
                surfaced.push(incoming.session_id);
            }
            poller.resolve_incoming();
        }
        // The oldest call was already outside the window
        assert_eq!(surfaced, vec![third.clone(), second.clone()]);
        assert_eq!(poller.incoming.lock().seen.len(), 2);

        let fourth = call(&alice, &bob, "0xb0b").await;
        let incoming = poller.poll_incoming_once().await.unwrap().unwrap();
        assert_eq!(incoming.session_id, fourth);
        let seen = poller.incoming.lock().seen.clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&third));
        assert!(!seen.contains(&second));
        assert!(!seen.contains(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_runs_immediately_and_on_interval() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let mut incoming = bob.poller.subscribe_incoming();
        let _task = bob.poller.start_incoming_discovery();

        settle().await;
        assert!(incoming.try_recv().is_err());

        call(&alice, &bob, "0xb0b").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        let surfaced = incoming.try_recv().unwrap();
        assert_eq!(bob.poller.pending_incoming(), Some(surfaced));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_task_stops_polling() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let task = bob.poller.start_incoming_discovery();
        settle().await;
        drop(task);

        call(&alice, &bob, "0xb0b").await;
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(bob.poller.pending_incoming(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_watch_finishes_after_apply() {
        let ledger = InMemoryLedger::new();
        let alice = side(&ledger, "0xa11ce");
        let bob = side(&ledger, "0xb0b");
        let session_id = call(&alice, &bob, "0xb0b").await;
        let task = alice.poller.watch_for_answer(session_id.clone());
        settle().await;
        assert!(!task.is_finished());

        bob.orchestrator
            .answer_call(&session_id, CallType::Voice)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(task.is_finished());

        let negotiator = alice.orchestrator.negotiator().unwrap();
        // Remote description already applied by the watcher
        assert!(matches!(
            negotiator
                .accept_remote_answer(crate::types::SessionDescription::answer("v=0"))
                .await,
            Err(CallError::InvalidState(_))
        ));
    }
}
