//! Configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Public STUN endpoints used when no configuration is given
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// ICE transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// Hold local descriptions until candidate gathering completes, so the
    /// payload written to the ledger carries every candidate
    pub wait_for_gathering: bool,
    /// Upper bound on that wait
    pub gathering_timeout_ms: u64,
}

impl IceConfig {
    /// Gathering wait as a duration
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect(),
            wait_for_gathering: true,
            gathering_timeout_ms: 10_000,
        }
    }
}

/// Ledger polling configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Incoming-call discovery period
    pub incoming_interval_ms: u64,
    /// Answer discovery period
    pub answer_interval_ms: u64,
    /// Maximum call-created events fetched per discovery tick
    pub event_query_limit: usize,
}

impl PollerConfig {
    /// Incoming-call discovery period as a duration
    pub fn incoming_interval(&self) -> Duration {
        Duration::from_millis(self.incoming_interval_ms.max(1))
    }

    /// Answer discovery period as a duration
    pub fn answer_interval(&self) -> Duration {
        Duration::from_millis(self.answer_interval_ms.max(1))
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            incoming_interval_ms: 5_000,
            answer_interval_ms: 2_000,
            event_query_limit: 10,
        }
    }
}

/// Call orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// ICE configuration for every negotiation
    pub ice: IceConfig,
    /// Mark the call record `Ended` on the ledger when hanging up
    pub record_hangup: bool,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LedgerRtcConfig {
    /// Orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Poller settings
    pub poller: PollerConfig,
}

impl LedgerRtcConfig {
    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Parse from a JSON string
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
