//! x0mesh core: self-healing post-quantum mesh overlay.
//!
//! Three tightly coupled layers:
//!
//! - **Membership and secure channels**: beacon-driven discovery on a TDMA
//!   slot clock ([`beacon`]), per-peer lifecycle ([`peers`]), a hybrid
//!   X25519+ML-KEM handshake ([`handshake`]) installing rotating sessions
//!   ([`session`]), and signed anti-replay gossip ([`gossip`]).
//! - **MAPE-K control loop**: telemetry windowing ([`telemetry`]),
//!   deterministic pattern detection ([`analyzer`]), utility-ranked
//!   planning ([`planner`]), transactional execution with rollback
//!   ([`executor`]) and outcome learning ([`knowledge`]), orchestrated by
//!   [`orchestrator`].
//! - **Byzantine-tolerant primitives**: reputation scoring
//!   ([`reputation`]) and reputation-weighted quorum validation
//!   ([`quorum`]) shared by both layers.
//!
//! The daemon crate owns transport and process lifecycle; everything here
//! is transport-agnostic and driven through injected clocks and contracts,
//! so the whole protocol is testable in virtual time.

pub mod analyzer;
pub mod beacon;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod gossip;
pub mod handshake;
pub mod identity;
pub mod knowledge;
pub mod metrics;
pub mod orchestrator;
pub mod peers;
pub mod planner;
pub mod pqc;
pub mod quorum;
pub mod reputation;
pub mod session;
pub mod telemetry;
pub mod types;
pub mod wire;

pub use clock::{ClockSource, SystemClock};
pub use config::MeshConfig;
pub use error::{HandshakeFailure, MeshError, PqcError};
pub use metrics::MeshMetrics;
pub use types::{NodeId, Slot};
