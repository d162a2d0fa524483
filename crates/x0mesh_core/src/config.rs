//! Mesh configuration.
//!
//! Section structs with serde defaults so a partial TOML file deserializes
//! into a fully populated config. The daemon owns file I/O; the core only
//! defines the recognized keys and their defaults.

use serde::{Deserialize, Serialize};

use crate::pqc::{KemAlgorithm, SigAlgorithm};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    #[serde(default)]
    pub slots: SlotConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub quorum: QuorumConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// TDMA slot clock and beacon timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    /// Slot width in milliseconds.
    #[serde(default = "default_slot_ms")]
    pub slot_ms: u64,
    /// Drift beyond which a clock correction is applied.
    #[serde(default = "default_drift_threshold_ms")]
    pub drift_threshold_ms: u64,
    /// Fraction of the measured drift applied per correction.
    #[serde(default = "default_drift_damping")]
    pub drift_damping: f64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            slot_ms: default_slot_ms(),
            drift_threshold_ms: default_drift_threshold_ms(),
            drift_damping: default_drift_damping(),
        }
    }
}

fn default_slot_ms() -> u64 {
    100
}
fn default_drift_threshold_ms() -> u64 {
    50
}
fn default_drift_damping() -> f64 {
    0.3
}

/// Key exchange, signing, rotation and fallback policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default)]
    pub kem_algorithm: KemAlgorithm,
    #[serde(default)]
    pub sig_algorithm: SigAlgorithm,
    /// Session lifetime in slots before rotation.
    #[serde(default = "default_session_ttl_slots")]
    pub session_ttl_slots: u64,
    /// Identity (epoch) rotation interval in seconds.
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,
    /// Previous keypair retention after rotation, seconds.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Workers in the bounded PQ compute pool.
    #[serde(default = "default_pqc_workers")]
    pub pqc_workers: usize,
    /// Permit the deterministic stub backend (tests only).
    #[serde(default)]
    pub allow_mock_pqc: bool,
    /// Refuse mock crypto and make missing backends fatal at startup.
    #[serde(default)]
    pub production_mode: bool,
    /// Classical-only fallback lifetime in seconds once PQC is lost at runtime.
    #[serde(default = "default_fallback_ttl_secs")]
    pub fallback_ttl_secs: u64,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            kem_algorithm: KemAlgorithm::default(),
            sig_algorithm: SigAlgorithm::default(),
            session_ttl_slots: default_session_ttl_slots(),
            rotation_interval_secs: default_rotation_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            pqc_workers: default_pqc_workers(),
            allow_mock_pqc: false,
            production_mode: false,
            fallback_ttl_secs: default_fallback_ttl_secs(),
        }
    }
}

fn default_session_ttl_slots() -> u64 {
    36_000 // one hour of 100ms slots
}
fn default_rotation_interval_secs() -> u64 {
    86_400
}
fn default_grace_period_secs() -> u64 {
    600
}
fn default_pqc_workers() -> usize {
    2
}
fn default_fallback_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Peers below this score are quarantined.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: f32,
    /// Quarantined peers transition to Gone after this many seconds.
    #[serde(default = "default_quarantine_ttl_secs")]
    pub quarantine_ttl_secs: u64,
    /// Idle decay rate toward the neutral score, per hour.
    #[serde(default = "default_decay_per_hour")]
    pub decay_per_hour: f32,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: default_quarantine_threshold(),
            quarantine_ttl_secs: default_quarantine_ttl_secs(),
            decay_per_hour: default_decay_per_hour(),
        }
    }
}

fn default_quarantine_threshold() -> f32 {
    0.2
}
fn default_quarantine_ttl_secs() -> u64 {
    3_600
}
fn default_decay_per_hour() -> f32 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Accepted control messages per peer per slot; excess is dropped.
    #[serde(default = "default_max_msgs_per_peer_per_slot")]
    pub max_msgs_per_peer_per_slot: u32,
    /// Cap on total rate-limit penalty charged in one slot.
    #[serde(default = "default_rate_penalty_cap")]
    pub rate_penalty_cap: f32,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_msgs_per_peer_per_slot: default_max_msgs_per_peer_per_slot(),
            rate_penalty_cap: default_rate_penalty_cap(),
        }
    }
}

fn default_max_msgs_per_peer_per_slot() -> u32 {
    50
}
fn default_rate_penalty_cap() -> f32 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Attestation collection window in slots.
    #[serde(default = "default_quorum_window_slots")]
    pub quorum_window_slots: u64,
    /// Required sum of attester reputations.
    #[serde(default = "default_reputation_quorum_threshold")]
    pub reputation_quorum_threshold: f32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            quorum_window_slots: default_quorum_window_slots(),
            reputation_quorum_threshold: default_reputation_quorum_threshold(),
        }
    }
}

fn default_quorum_window_slots() -> u64 {
    3
}
fn default_reputation_quorum_threshold() -> f32 {
    1.5
}

/// MAPE-K loop pacing and execution windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Post-execution observation window before classifying the outcome.
    #[serde(default = "default_verification_window_secs")]
    pub verification_window_secs: u64,
    #[serde(default = "default_graceful_shutdown_deadline_secs")]
    pub graceful_shutdown_deadline_secs: u64,
    /// Exploration probability for knowledge-driven action choice.
    #[serde(default = "default_exploration_epsilon")]
    pub exploration_epsilon: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            verification_window_secs: default_verification_window_secs(),
            graceful_shutdown_deadline_secs: default_graceful_shutdown_deadline_secs(),
            exploration_epsilon: default_exploration_epsilon(),
        }
    }
}

fn default_tick_interval_secs() -> u64 {
    30
}
fn default_verification_window_secs() -> u64 {
    30
}
fn default_graceful_shutdown_deadline_secs() -> u64 {
    10
}
fn default_exploration_epsilon() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Ring buffer capacity in events.
    #[serde(default = "default_window_events")]
    pub window_events: usize,
    /// Events older than this are evicted.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    /// Accepted peer-reported events per peer per slot.
    #[serde(default = "default_peer_telemetry_rate")]
    pub peer_telemetry_rate: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window_events: default_window_events(),
            window_seconds: default_window_seconds(),
            peer_telemetry_rate: default_peer_telemetry_rate(),
        }
    }
}

fn default_window_events() -> usize {
    4_096
}
fn default_window_seconds() -> u64 {
    300
}
fn default_peer_telemetry_rate() -> u32 {
    8
}
