//! Ledger RTC - WebRTC calls signaled through a shared ledger
//!
//! Two parties negotiate a peer-to-peer audio/video session without a
//! signaling server: the caller writes an offer into a call record on the
//! ledger, the callee discovers it by polling, writes an answer into the same
//! record, and the caller discovers the answer the same way. Media then flows
//! directly between the peers.
//!
//! - [`MediaNegotiator`]: one peer connection and its local media
//! - [`CallOrchestrator`]: initiate, answer and end calls over the ledger
//! - [`SignalingPoller`]: discover incoming calls and answers
//! - [`CallStateProjector`]: loading/error bookkeeping for a UI
//!
//! # Examples
//!
//! ```rust,no_run
//! use ledger_rtc_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ledger = InMemoryLedger::new();
//! let alice = Address::new("0xa11ce");
//! let bob = Address::new("0xb0b");
//! let alice_profile = ledger.register_profile(alice.clone(), "alice");
//! let bob_profile = ledger.register_profile(bob.clone(), "bob");
//!
//! let service = LedgerRtcService::builder(
//!     Arc::new(ledger.executor(alice)),
//!     Arc::new(ledger.clone()),
//!     Arc::new(ledger.clone()),
//! )
//! .build()?;
//!
//! let session_id = service
//!     .initiate_call(&alice_profile, &bob, &bob_profile, CallType::Video)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Call negotiation types and data structures
pub mod types;

/// Configuration
pub mod config;

/// Party and object identifiers
pub mod identity;

/// Local and remote media
pub mod media;

/// Peer connection boundary
pub mod transport;

/// `webrtc` crate backend (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_transport;

/// Ledger records, transactions and events
pub mod ledger;

/// Call state subscriptions
pub mod observer;

/// Per-call media negotiation
pub mod negotiator;

/// Call orchestration
pub mod call;

/// Ledger polling
pub mod signaling;

/// UI-facing state projection
pub mod projector;

/// Per-party service facade
pub mod service;

/// Scripted transports for tests
pub mod testing;

// Re-export main types at crate root
pub use call::{CallError, CallOrchestrator, CallPhase, CallRole};
pub use config::{IceConfig, LedgerRtcConfig, OrchestratorConfig, PollerConfig};
pub use identity::{Address, ObjectId};
pub use ledger::{
    CallCreated, CallRecord, CallStatus, InMemoryLedger, LedgerAccount, LedgerError,
    LedgerEvent, LedgerReader, LedgerTransaction, Profile, ProfileCreated, ProfileResolver,
    TransactionEffects, TransactionExecutor,
};
pub use media::{
    LocalStream, LocalTrack, MediaDevices, MediaError, RemoteStream, RemoteTrackInfo, TrackKind,
    TrackSource, VirtualDevices,
};
pub use negotiator::MediaNegotiator;
pub use observer::{ListenerId, StateListener, StatePublisher};
pub use projector::{CallStateProjector, ProjectedState};
pub use service::{LedgerRtcService, LedgerRtcServiceBuilder, ServiceError};
pub use signaling::{IncomingCall, PollTask, SignalingPoller};
pub use transport::{OfferOptions, PeerTransport, PeerTransportFactory, TransportError, TransportEvent};
#[cfg(feature = "webrtc-backend")]
pub use webrtc_transport::{WebRtcTransport, WebRtcTransportFactory};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallOrchestrator, CallPhase};
    pub use crate::config::LedgerRtcConfig;
    pub use crate::identity::{Address, ObjectId};
    pub use crate::ledger::{InMemoryLedger, LedgerReader, ProfileResolver, TransactionExecutor};
    pub use crate::media::{MediaDevices, VirtualDevices};
    pub use crate::projector::{CallStateProjector, ProjectedState};
    pub use crate::service::{LedgerRtcService, ServiceError};
    pub use crate::signaling::{IncomingCall, SignalingPoller};
    pub use crate::types::{CallSnapshot, CallType, ConnectionPhase, SessionDescription};
}
