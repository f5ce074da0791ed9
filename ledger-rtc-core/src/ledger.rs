//! Ledger boundary: call records, transactions and events
//!
//! The ledger is the only channel between the two parties. This module defines
//! the typed contracts the call subsystem consumes ([`TransactionExecutor`],
//! [`LedgerReader`], [`ProfileResolver`]) and [`InMemoryLedger`], an
//! in-process ledger that enforces the call-record rules.

use crate::identity::{Address, ObjectId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Ledger access errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Object does not exist
    #[error("Object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// Transaction rejected by the ledger
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// Ledger unreachable or returned garbage
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Call record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Offer written, waiting for the callee
    Initiated,
    /// Answer written
    Answered,
    /// Call over
    Ended,
}

impl CallStatus {
    /// Whether moving to `next` keeps the status monotonic
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        next > self
    }
}

/// Ledger-resident call record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Record id, assigned by the ledger
    pub session_id: ObjectId,
    /// Calling party
    pub caller: Address,
    /// Called party
    pub callee: Address,
    /// Caller's profile record
    pub caller_profile_id: ObjectId,
    /// Callee's profile record
    pub callee_profile_id: ObjectId,
    /// Serialized offer, write-once at creation
    pub offer: Vec<u8>,
    /// Serialized answer, written at most once by the callee
    pub answer: Option<Vec<u8>>,
    /// Status
    pub status: CallStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Mutations understood by the call-session module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerTransaction {
    /// `initiate_call_entry(caller_profile, callee, callee_profile_id_bytes, offer_bytes)`
    InitiateCall {
        /// Caller's profile object
        caller_profile: ObjectId,
        /// Callee address
        callee: Address,
        /// Callee profile id, UTF-8 bytes
        callee_profile_id: Vec<u8>,
        /// Serialized offer
        offer: Vec<u8>,
    },
    /// `answer_call_entry(call_session, answer_bytes)`
    AnswerCall {
        /// Call record
        session: ObjectId,
        /// Serialized answer
        answer: Vec<u8>,
    },
    /// `end_call_entry(call_session)`
    EndCall {
        /// Call record
        session: ObjectId,
    },
}

impl LedgerTransaction {
    /// Entry function name, for logging
    pub fn entry_name(&self) -> &'static str {
        match self {
            Self::InitiateCall { .. } => "initiate_call_entry",
            Self::AnswerCall { .. } => "answer_call_entry",
            Self::EndCall { .. } => "end_call_entry",
        }
    }
}

/// Event emitted when a call record is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCreated {
    /// New record
    pub session_id: ObjectId,
    /// Calling party
    pub caller: Address,
    /// Called party
    pub callee: Address,
    /// Caller's profile record
    pub caller_profile: ObjectId,
    /// Digest of the creating transaction
    pub tx_digest: String,
}

/// Event emitted when a profile is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileCreated {
    /// Profile record
    pub object_id: ObjectId,
    /// Owner address
    pub owner: Address,
}

/// Events the call subsystem understands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    /// Call record created
    CallCreated(CallCreated),
    /// Profile created
    ProfileCreated(ProfileCreated),
}

/// Effects of an executed transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionEffects {
    /// Transaction digest
    pub digest: String,
    /// Objects created, in creation order
    pub created: Vec<ObjectId>,
    /// Objects mutated
    pub mutated: Vec<ObjectId>,
    /// Events emitted
    pub events: Vec<LedgerEvent>,
}

impl TransactionEffects {
    /// First object created by the transaction
    pub fn created_object(&self) -> Option<&ObjectId> {
        self.created.first()
    }
}

/// Display data of a profile record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Profile record
    pub id: ObjectId,
    /// Owner address
    pub owner: Address,
    /// Display name
    pub name: String,
    /// Avatar URL
    pub avatar: Option<String>,
}

/// Signs and submits ledger mutations for one account
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// Address transactions are signed by
    fn sender(&self) -> Address;

    /// Sign, submit and wait for effects
    async fn execute(&self, tx: LedgerTransaction) -> Result<TransactionEffects, LedgerError>;
}

/// Read access to call records and events
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Fetch a call record; `Ok(None)` if the object does not exist
    async fn get_call_record(&self, id: &ObjectId) -> Result<Option<CallRecord>, LedgerError>;

    /// Most recent call-created events, newest first
    async fn query_call_created(&self, limit: usize) -> Result<Vec<CallCreated>, LedgerError>;
}

/// Maps parties to their profile records
#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Profile record owned by `owner`
    async fn profile_id_for(&self, owner: &Address) -> Result<Option<ObjectId>, LedgerError>;

    /// Profile display data
    async fn profile(&self, id: &ObjectId) -> Result<Option<Profile>, LedgerError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<ObjectId, CallRecord>,
    profiles: HashMap<ObjectId, Profile>,
    events: Vec<LedgerEvent>,
    tx_count: u64,
}

impl LedgerState {
    fn next_digest(&mut self) -> String {
        self.tx_count += 1;
        format!("tx-{:08}", self.tx_count)
    }
}

/// In-process ledger holding call records and profiles
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl InMemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor signing as `sender`
    pub fn executor(&self, sender: Address) -> LedgerAccount {
        LedgerAccount {
            ledger: self.clone(),
            sender,
        }
    }

    /// Create a profile record owned by `owner`
    pub fn register_profile(&self, owner: Address, name: impl Into<String>) -> ObjectId {
        let mut state = self.state.lock();
        let id = ObjectId::random();
        state.profiles.insert(
            id.clone(),
            Profile {
                id: id.clone(),
                owner: owner.clone(),
                name: name.into(),
                avatar: None,
            },
        );
        state.events.push(LedgerEvent::ProfileCreated(ProfileCreated {
            object_id: id.clone(),
            owner,
        }));
        id
    }

    /// Number of call records
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Number of executed transactions
    pub fn transaction_count(&self) -> u64 {
        self.state.lock().tx_count
    }

    fn apply(
        &self,
        sender: &Address,
        tx: LedgerTransaction,
    ) -> Result<TransactionEffects, LedgerError> {
        let mut state = self.state.lock();
        match tx {
            LedgerTransaction::InitiateCall {
                caller_profile,
                callee,
                callee_profile_id,
                offer,
            } => {
                let owner_matches = state
                    .profiles
                    .get(&caller_profile)
                    .map(|p| p.owner.matches(sender));
                match owner_matches {
                    None => return Err(LedgerError::ObjectNotFound(caller_profile)),
                    Some(false) => {
                        return Err(LedgerError::Rejected(format!(
                            "profile {caller_profile} is not owned by {sender}"
                        )))
                    }
                    Some(true) => {}
                }
                if offer.is_empty() {
                    return Err(LedgerError::Rejected("empty offer".to_string()));
                }
                let callee_profile_id = ObjectId::from_bytes(&callee_profile_id)
                    .map_err(|e| LedgerError::Rejected(format!("callee profile id: {e}")))?;

                let digest = state.next_digest();
                let session_id = ObjectId::random();
                let record = CallRecord {
                    session_id: session_id.clone(),
                    caller: sender.clone(),
                    callee: callee.clone(),
                    caller_profile_id: caller_profile.clone(),
                    callee_profile_id,
                    offer,
                    answer: None,
                    status: CallStatus::Initiated,
                    created_at: Utc::now(),
                };
                state.records.insert(session_id.clone(), record);
                let event = LedgerEvent::CallCreated(CallCreated {
                    session_id: session_id.clone(),
                    caller: sender.clone(),
                    callee,
                    caller_profile,
                    tx_digest: digest.clone(),
                });
                state.events.push(event.clone());
                Ok(TransactionEffects {
                    digest,
                    created: vec![session_id],
                    mutated: Vec::new(),
                    events: vec![event],
                })
            }
            LedgerTransaction::AnswerCall { session, answer } => {
                let record = state
                    .records
                    .get_mut(&session)
                    .ok_or_else(|| LedgerError::ObjectNotFound(session.clone()))?;
                if !record.callee.matches(sender) {
                    return Err(LedgerError::Rejected(format!(
                        "only the callee may answer {session}"
                    )));
                }
                if record.answer.is_some() || record.status != CallStatus::Initiated {
                    return Err(LedgerError::Rejected(format!(
                        "call {session} already {:?}",
                        record.status
                    )));
                }
                if answer.is_empty() {
                    return Err(LedgerError::Rejected("empty answer".to_string()));
                }
                record.answer = Some(answer);
                record.status = CallStatus::Answered;
                let digest = state.next_digest();
                Ok(TransactionEffects {
                    digest,
                    created: Vec::new(),
                    mutated: vec![session],
                    events: Vec::new(),
                })
            }
            LedgerTransaction::EndCall { session } => {
                let record = state
                    .records
                    .get_mut(&session)
                    .ok_or_else(|| LedgerError::ObjectNotFound(session.clone()))?;
                if !record.caller.matches(sender) && !record.callee.matches(sender) {
                    return Err(LedgerError::Rejected(format!(
                        "{sender} is not a party to {session}"
                    )));
                }
                if !record.status.can_advance_to(CallStatus::Ended) {
                    return Err(LedgerError::Rejected(format!("call {session} already ended")));
                }
                record.status = CallStatus::Ended;
                let digest = state.next_digest();
                Ok(TransactionEffects {
                    digest,
                    created: Vec::new(),
                    mutated: vec![session],
                    events: Vec::new(),
                })
            }
        }
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedger {
    async fn get_call_record(&self, id: &ObjectId) -> Result<Option<CallRecord>, LedgerError> {
        Ok(self.state.lock().records.get(id).cloned())
    }

    async fn query_call_created(&self, limit: usize) -> Result<Vec<CallCreated>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .rev()
            .filter_map(|event| match event {
                LedgerEvent::CallCreated(created) => Some(created.clone()),
                LedgerEvent::ProfileCreated(_) => None,
            })
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl ProfileResolver for InMemoryLedger {
    async fn profile_id_for(&self, owner: &Address) -> Result<Option<ObjectId>, LedgerError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .filter_map(|event| match event {
                LedgerEvent::ProfileCreated(created) if created.owner.matches(owner) => {
                    Some(created.object_id.clone())
                }
                _ => None,
            })
            .next())
    }

    async fn profile(&self, id: &ObjectId) -> Result<Option<Profile>, LedgerError> {
        Ok(self.state.lock().profiles.get(id).cloned())
    }
}

/// [`InMemoryLedger`] executor bound to one account
#[derive(Debug, Clone)]
pub struct LedgerAccount {
    ledger: InMemoryLedger,
    sender: Address,
}

#[async_trait]
impl TransactionExecutor for LedgerAccount {
    fn sender(&self) -> Address {
        self.sender.clone()
    }

    #[tracing::instrument(skip(self, tx), fields(sender = %self.sender, entry = tx.entry_name()))]
    async fn execute(&self, tx: LedgerTransaction) -> Result<TransactionEffects, LedgerError> {
        let effects = self.ledger.apply(&self.sender, tx)?;
        tracing::debug!(digest = %effects.digest, "Transaction executed");
        Ok(effects)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Parties {
        ledger: InMemoryLedger,
        alice: LedgerAccount,
        bob: LedgerAccount,
        alice_profile: ObjectId,
        bob_profile: ObjectId,
    }

    fn parties() -> Parties {
        let ledger = InMemoryLedger::new();
        let alice_profile = ledger.register_profile(Address::new("0xa11ce"), "alice");
        let bob_profile = ledger.register_profile(Address::new("0xb0b"), "bob");
        Parties {
            alice: ledger.executor(Address::new("0xa11ce")),
            bob: ledger.executor(Address::new("0xb0b")),
            ledger,
            alice_profile,
            bob_profile,
        }
    }

    async fn initiate(p: &Parties) -> ObjectId {
        let effects = p
            .alice
            .execute(LedgerTransaction::InitiateCall {
                caller_profile: p.alice_profile.clone(),
                callee: Address::new("0xb0b"),
                callee_profile_id: p.bob_profile.to_bytes(),
                offer: b"offer".to_vec(),
            })
            .await
            .unwrap();
        effects.created_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_initiate_creates_record_and_event() {
        let p = parties();
        let session = initiate(&p).await;

        let record = p.ledger.get_call_record(&session).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Initiated);
        assert_eq!(record.offer, b"offer".to_vec());
        assert_eq!(record.answer, None);
        assert_eq!(record.callee_profile_id, p.bob_profile);

        let events = p.ledger.query_call_created(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, session);
        assert_eq!(events[0].callee, Address::new("0xb0b"));
    }

    #[tokio::test]
    async fn test_answer_is_write_once() {
        let p = parties();
        let session = initiate(&p).await;

        p.bob
            .execute(LedgerTransaction::AnswerCall {
                session: session.clone(),
                answer: b"answer".to_vec(),
            })
            .await
            .unwrap();

        let second = p
            .bob
            .execute(LedgerTransaction::AnswerCall {
                session: session.clone(),
                answer: b"other".to_vec(),
            })
            .await;
        assert!(matches!(second, Err(LedgerError::Rejected(_))));

        let record = p.ledger.get_call_record(&session).await.unwrap().unwrap();
        assert_eq!(record.answer, Some(b"answer".to_vec()));
        assert_eq!(record.status, CallStatus::Answered);
    }

    #[tokio::test]
    async fn test_only_callee_may_answer() {
        let p = parties();
        let session = initiate(&p).await;
        let result = p
            .alice
            .execute(LedgerTransaction::AnswerCall {
                session,
                answer: b"answer".to_vec(),
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_initiate_requires_owned_profile() {
        let p = parties();
        let result = p
            .alice
            .execute(LedgerTransaction::InitiateCall {
                caller_profile: p.bob_profile.clone(),
                callee: Address::new("0xb0b"),
                callee_profile_id: p.bob_profile.to_bytes(),
                offer: b"offer".to_vec(),
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Rejected(_))));
        assert_eq!(p.ledger.record_count(), 0);
    }

    #[tokio::test]
    async fn test_status_is_monotonic() {
        let p = parties();
        let session = initiate(&p).await;
        p.alice
            .execute(LedgerTransaction::EndCall {
                session: session.clone(),
            })
            .await
            .unwrap();

        let again = p
            .bob
            .execute(LedgerTransaction::EndCall {
                session: session.clone(),
            })
            .await;
        assert!(matches!(again, Err(LedgerError::Rejected(_))));

        let answer = p
            .bob
            .execute(LedgerTransaction::AnswerCall {
                session,
                answer: b"late".to_vec(),
            })
            .await;
        assert!(matches!(answer, Err(LedgerError::Rejected(_))));
        assert!(CallStatus::Initiated.can_advance_to(CallStatus::Answered));
        assert!(!CallStatus::Answered.can_advance_to(CallStatus::Initiated));
    }

    #[tokio::test]
    async fn test_call_created_newest_first_with_limit() {
        let p = parties();
        let first = initiate(&p).await;
        let second = initiate(&p).await;
        let events = p.ledger.query_call_created(1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].session_id, second);
        let all = p.ledger.query_call_created(10).await.unwrap();
        assert_eq!(all[1].session_id, first);
        assert_eq!(p.ledger.transaction_count(), 2);
    }

    #[tokio::test]
    async fn test_profile_resolution() {
        let p = parties();
        let id = p
            .ledger
            .profile_id_for(&Address::new("0xB0B"))
            .await
            .unwrap();
        assert_eq!(id, Some(p.bob_profile.clone()));
        let profile = p.ledger.profile(&p.bob_profile).await.unwrap().unwrap();
        assert_eq!(profile.name, "bob");
        assert_eq!(
            p.ledger.profile_id_for(&Address::new("0xdead")).await.unwrap(),
            None
        );
    }
}
