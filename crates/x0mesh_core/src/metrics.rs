//! Observability surface.
//!
//! Counters and gauges the core computes, rendered on demand as a flat map
//! for the pull endpoint. The registry is constructed once at startup and
//! passed by handle; there is no process-global.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

pub const MESH_ACTIVE_PEERS: &str = "mesh_active_peers";
pub const MESH_QUARANTINED_PEERS: &str = "mesh_quarantined_peers";
pub const MESH_MTTD_SECONDS: &str = "mesh_mttd_seconds";
pub const MESH_RECONVERGENCE_SECONDS: &str = "mesh_reconvergence_seconds";
pub const PQC_HANDSHAKE_SUCCESS_TOTAL: &str = "pqc_handshake_success_total";
pub const PQC_HANDSHAKE_FAILURE_TOTAL: &str = "pqc_handshake_failure_total";
pub const PQC_HANDSHAKE_LATENCY_SECONDS: &str = "pqc_handshake_latency_seconds";
pub const PQC_FALLBACK_ENABLED: &str = "pqc_fallback_enabled";
pub const MAPE_K_CYCLES_TOTAL: &str = "mape_k_cycles_total";
pub const MAPE_K_CYCLE_DURATION_SECONDS: &str = "mape_k_cycle_duration_seconds";
pub const MAPE_K_TICKS_SKIPPED_TOTAL: &str = "mape_k_ticks_skipped_total";
pub const POLICIES_EXECUTED_TOTAL: &str = "policies_executed_total";
pub const REPUTATION_QUARANTINES_TOTAL: &str = "reputation_quarantines_total";
pub const GOSSIP_REPLAYS_DROPPED_TOTAL: &str = "gossip_replays_dropped_total";

/// Point-in-time copy of every metric, suitable for serialization.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

/// Shared counter/gauge registry.
#[derive(Debug, Default)]
pub struct MeshMetrics {
    inner: Mutex<Inner>,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Increment a labeled counter, rendered as `name{label="value"}`.
    pub fn inc_labeled(&self, name: &str, label: &str, value: &str) {
        let key = format!("{name}{{{label}=\"{value}\"}}");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.counters.entry(key).or_insert(0) += 1;
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.gauges.get(name).copied()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
        }
    }

    /// Text exposition, one `name value` line per metric.
    pub fn render_text(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        for (name, value) in &snap.counters {
            out.push_str(&format!("{name} {value}\n"));
        }
        for (name, value) in &snap.gauges {
            out.push_str(&format!("{name} {value}\n"));
        }
        out
    }
}
