//! Telemetry window (Monitor phase).
//!
//! Pulls local gauges through the `MetricSource` contract, ingests
//! peer-reported events under a per-peer-per-slot budget, and keeps a
//! bounded ring of recent events. The analyzer reads copy-on-read
//! snapshots, never the live ring.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TelemetryConfig;
use crate::types::{NodeId, Slot};

/// One observed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub at_ms: u64,
    pub source: NodeId,
    pub kind: String,
    pub magnitude: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TelemetryEvent {
    pub fn new(at_ms: u64, source: NodeId, kind: impl Into<String>, magnitude: f64) -> Self {
        Self {
            at_ms,
            source,
            kind: kind.into(),
            magnitude,
            labels: BTreeMap::new(),
        }
    }
}

/// Local gauges pulled each monitor pass. Supplied by the embedding
/// process; not part of the core.
pub trait MetricSource: Send + Sync {
    fn collect(&self) -> HashMap<String, f64>;
}

/// Consistent copy of the window for one analysis pass.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub taken_at_ms: u64,
    pub events: Vec<TelemetryEvent>,
}

pub struct TelemetryCollector {
    config: TelemetryConfig,
    local_id: NodeId,
    sources: Vec<Box<dyn MetricSource>>,
    window: VecDeque<TelemetryEvent>,
    /// Peer-reported events accepted in the current slot.
    peer_counts: HashMap<NodeId, u32>,
    counted_slot: Slot,
    dropped_peer_events: u64,
}

impl TelemetryCollector {
    pub fn new(config: TelemetryConfig, local_id: NodeId) -> Self {
        Self {
            config,
            local_id,
            sources: Vec::new(),
            window: VecDeque::new(),
            peer_counts: HashMap::new(),
            counted_slot: 0,
            dropped_peer_events: 0,
        }
    }

    pub fn register_source(&mut self, source: Box<dyn MetricSource>) {
        self.sources.push(source);
    }

    /// Monitor pass: sample every registered source into the window.
    pub fn collect(&mut self, now_ms: u64) {
        let local = self.local_id;
        let mut sampled = Vec::new();
        for source in &self.sources {
            for (name, value) in source.collect() {
                sampled.push(TelemetryEvent::new(now_ms, local, name, value));
            }
        }
        for event in sampled {
            self.push(event);
        }
        self.evict(now_ms);
    }

    /// Record a locally generated event (protocol observations, violations
    /// on self, handshake outcomes).
    pub fn record_local(&mut self, event: TelemetryEvent) {
        self.push(event);
    }

    /// Ingest a peer-reported event, subject to the per-slot budget.
    /// Returns false when the event was dropped.
    pub fn ingest_peer(&mut self, event: TelemetryEvent, slot: Slot) -> bool {
        if slot != self.counted_slot {
            self.counted_slot = slot;
            self.peer_counts.clear();
        }
        let count = self.peer_counts.entry(event.source).or_insert(0);
        if *count >= self.config.peer_telemetry_rate {
            self.dropped_peer_events += 1;
            debug!(peer = %event.source, "peer telemetry budget exhausted, dropping event");
            return false;
        }
        *count += 1;
        self.push(event);
        true
    }

    fn push(&mut self, event: TelemetryEvent) {
        // Writes are total-ordered by timestamp; out-of-order arrivals land
        // at their sorted position from the back.
        let pos = self
            .window
            .iter()
            .rposition(|e| e.at_ms <= event.at_ms)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.window.insert(pos, event);
        while self.window.len() > self.config.window_events {
            self.window.pop_front();
        }
    }

    fn evict(&mut self, now_ms: u64) {
        let horizon = now_ms.saturating_sub(self.config.window_seconds * 1_000);
        while self.window.front().is_some_and(|e| e.at_ms < horizon) {
            self.window.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn dropped_peer_events(&self) -> u64 {
        self.dropped_peer_events
    }

    /// Any event of `kind` at or after `horizon_ms`? The window is
    /// time-sorted, so the scan walks the recent tail only.
    pub fn has_recent(&self, kind: &str, horizon_ms: u64) -> bool {
        self.window
            .iter()
            .rev()
            .take_while(|e| e.at_ms >= horizon_ms)
            .any(|e| e.kind == kind)
    }

    /// Copy-on-read snapshot; stale events are evicted first so no torn or
    /// expired reads are possible.
    pub fn snapshot(&mut self, now_ms: u64) -> TelemetrySnapshot {
        self.evict(now_ms);
        TelemetrySnapshot {
            taken_at_ms: now_ms,
            events: self.window.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u8) -> NodeId {
        let mut bytes = [0u8; 32];
        bytes[0] = id;
        NodeId(bytes)
    }

    struct FixedSource;

    impl MetricSource for FixedSource {
        fn collect(&self) -> HashMap<String, f64> {
            HashMap::from([("cpu_load".to_string(), 0.75)])
        }
    }

    fn collector() -> TelemetryCollector {
        TelemetryCollector::new(TelemetryConfig::default(), node(0))
    }

    #[test]
    fn test_collect_samples_sources() {
        let mut c = collector();
        c.register_source(Box::new(FixedSource));
        c.collect(1_000);

        let snap = c.snapshot(1_000);
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].kind, "cpu_load");
        assert_eq!(snap.events[0].magnitude, 0.75);
        assert_eq!(snap.events[0].source, node(0));
    }

    #[test]
    fn test_peer_rate_budget_per_slot() {
        let mut c = collector();
        let rate = TelemetryConfig::default().peer_telemetry_rate;

        for i in 0..rate + 3 {
            let accepted = c.ingest_peer(
                TelemetryEvent::new(1_000 + i as u64, node(1), "lat", 1.0),
                5,
            );
            assert_eq!(accepted, i < rate);
        }
        assert_eq!(c.dropped_peer_events(), 3);

        // Budget resets on the next slot.
        assert!(c.ingest_peer(TelemetryEvent::new(2_000, node(1), "lat", 1.0), 6));
    }

    #[test]
    fn test_stale_events_evicted() {
        let mut c = collector();
        c.record_local(TelemetryEvent::new(0, node(0), "old", 1.0));
        c.record_local(TelemetryEvent::new(400_000, node(0), "new", 1.0));

        let snap = c.snapshot(400_000); // horizon = 100_000
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].kind, "new");
    }

    #[test]
    fn test_capacity_bound_drops_oldest() {
        let mut config = TelemetryConfig::default();
        config.window_events = 4;
        let mut c = TelemetryCollector::new(config, node(0));
        for i in 0..6u64 {
            c.record_local(TelemetryEvent::new(i, node(0), format!("e{i}"), 1.0));
        }
        let snap = c.snapshot(5);
        assert_eq!(snap.events.len(), 4);
        assert_eq!(snap.events[0].kind, "e2");
    }

    #[test]
    fn test_out_of_order_arrivals_sorted_by_timestamp() {
        let mut c = collector();
        c.record_local(TelemetryEvent::new(300, node(0), "c", 1.0));
        c.record_local(TelemetryEvent::new(100, node(0), "a", 1.0));
        c.record_local(TelemetryEvent::new(200, node(0), "b", 1.0));

        let snap = c.snapshot(300);
        let kinds: Vec<&str> = snap.events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut c = collector();
        c.record_local(TelemetryEvent::new(100, node(0), "x", 1.0));
        let snap = c.snapshot(100);
        c.record_local(TelemetryEvent::new(200, node(0), "y", 1.0));
        assert_eq!(snap.events.len(), 1);
    }
}
