//! Pattern analysis (Analyze phase).
//!
//! Four deterministic detectors run over each telemetry snapshot: temporal
//! burst, spatial co-occurrence, causal correlation and frequency anomaly.
//! External detectors plug in through `AnomalyDetector`. Results merge by
//! (kind, involved peers) and rank by severity, confidence and recency.
//! A detector that panics is isolated: the pass is skipped and the
//! detector's health knob drops until it effectively unplugs itself.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::telemetry::TelemetrySnapshot;
use crate::types::{blake2b256, NodeId};

/// Burst detector: window and same-kind/same-source event count.
const BURST_WINDOW_MS: u64 = 60_000;
const BURST_MIN_EVENTS: usize = 3;
const BURST_CONFIDENCE: f64 = 0.85;

/// Spatial detector: same kind across distinct peers in the snapshot.
const SPATIAL_MIN_PEERS: usize = 3;
const SPATIAL_CONFIDENCE: f64 = 0.80;

/// Causal detector: correlation window, Pearson bound and max lag.
const CAUSAL_WINDOW_MS: u64 = 120_000;
const CAUSAL_MIN_R: f64 = 0.7;
const CAUSAL_MAX_LAG_S: i64 = 5;
const CAUSAL_MIN_BUCKETS: usize = 8;
const CAUSAL_CONFIDENCE: f64 = 0.75;

/// Frequency detector: window, sigma bound and absolute cap (events/min).
const FREQ_WINDOW_MS: u64 = 300_000;
const FREQ_SIGMA: f64 = 3.0;
const FREQ_HARD_CAP_PER_MIN: f64 = 120.0;
const FREQ_CONFIDENCE: f64 = 0.70;

/// Health floor below which a detector is no longer run.
const DETECTOR_HEALTH_FLOOR: f32 = 0.2;
const DETECTOR_PANIC_PENALTY: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

/// Detector output describing one anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: [u8; 32],
    pub kind: String,
    pub severity: Severity,
    pub confidence: f64,
    /// Indices into the snapshot's event list.
    pub evidence_refs: Vec<usize>,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub involved_peers: Vec<NodeId>,
}

impl Violation {
    pub fn new(
        kind: String,
        severity: Severity,
        confidence: f64,
        evidence_refs: Vec<usize>,
        first_seen_ms: u64,
        last_seen_ms: u64,
        mut involved_peers: Vec<NodeId>,
    ) -> Self {
        involved_peers.sort();
        involved_peers.dedup();
        let peer_bytes: Vec<u8> = involved_peers
            .iter()
            .flat_map(|p| p.as_bytes().iter().copied())
            .collect();
        let id = blake2b256(&[kind.as_bytes(), &peer_bytes, &first_seen_ms.to_be_bytes()]);
        Self {
            id,
            kind,
            severity,
            confidence,
            evidence_refs,
            first_seen_ms,
            last_seen_ms,
            involved_peers,
        }
    }
}

/// External (e.g. ML-based) detector contract; not part of the core.
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, snapshot: &TelemetrySnapshot) -> Vec<Violation>;
}

pub struct PatternAnalyzer {
    external: Vec<Box<dyn AnomalyDetector>>,
    detector_health: HashMap<String, f32>,
}

impl Default for PatternAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternAnalyzer {
    pub fn new() -> Self {
        Self {
            external: Vec::new(),
            detector_health: HashMap::new(),
        }
    }

    pub fn register_detector(&mut self, detector: Box<dyn AnomalyDetector>) {
        self.detector_health
            .insert(detector.name().to_string(), 1.0);
        self.external.push(detector);
    }

    pub fn detector_health(&self, name: &str) -> Option<f32> {
        self.detector_health.get(name).copied()
    }

    /// Run all detectors over the snapshot, merge and rank.
    pub fn analyze(&mut self, snapshot: &TelemetrySnapshot) -> Vec<Violation> {
        let mut violations = Vec::new();

        type BuiltIn = (&'static str, fn(&TelemetrySnapshot) -> Vec<Violation>);
        let built_ins: [BuiltIn; 4] = [
            ("temporal-burst", detect_temporal_burst),
            ("spatial-cooccurrence", detect_spatial_cooccurrence),
            ("causal-correlation", detect_causal_correlation),
            ("frequency-anomaly", detect_frequency_anomaly),
        ];
        for (name, detector) in built_ins {
            match catch_unwind(AssertUnwindSafe(|| detector(snapshot))) {
                Ok(found) => violations.extend(found),
                Err(_) => warn!(detector = name, "built-in detector panicked, skipping pass"),
            }
        }

        for detector in &self.external {
            let name = detector.name().to_string();
            let health = self.detector_health.get(&name).copied().unwrap_or(1.0);
            if health < DETECTOR_HEALTH_FLOOR {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| detector.analyze(snapshot))) {
                Ok(found) => violations.extend(found),
                Err(_) => {
                    let health = (health - DETECTOR_PANIC_PENALTY).max(0.0);
                    warn!(detector = %name, health, "external detector panicked, reducing health");
                    self.detector_health.insert(name, health);
                }
            }
        }

        let mut merged = merge_violations(violations);
        merged.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.confidence.total_cmp(&a.confidence))
                .then(b.last_seen_ms.cmp(&a.last_seen_ms))
        });
        merged
    }
}

/// Merge by kind + involved peer set: union evidence, widen the time span,
/// keep the highest severity and confidence.
fn merge_violations(violations: Vec<Violation>) -> Vec<Violation> {
    let mut by_key: BTreeMap<(String, Vec<NodeId>), Violation> = BTreeMap::new();
    for v in violations {
        let key = (v.kind.clone(), v.involved_peers.clone());
        match by_key.get_mut(&key) {
            None => {
                by_key.insert(key, v);
            }
            Some(existing) => {
                existing.evidence_refs.extend(v.evidence_refs);
                existing.evidence_refs.sort_unstable();
                existing.evidence_refs.dedup();
                existing.first_seen_ms = existing.first_seen_ms.min(v.first_seen_ms);
                existing.last_seen_ms = existing.last_seen_ms.max(v.last_seen_ms);
                existing.severity = existing.severity.max(v.severity);
                existing.confidence = existing.confidence.max(v.confidence);
            }
        }
    }
    by_key.into_values().collect()
}

fn detect_temporal_burst(snapshot: &TelemetrySnapshot) -> Vec<Violation> {
    let horizon = snapshot.taken_at_ms.saturating_sub(BURST_WINDOW_MS);
    let mut groups: BTreeMap<(&str, NodeId), Vec<usize>> = BTreeMap::new();
    for (idx, event) in snapshot.events.iter().enumerate() {
        if event.at_ms >= horizon {
            groups
                .entry((event.kind.as_str(), event.source))
                .or_default()
                .push(idx);
        }
    }

    groups
        .into_iter()
        .filter(|(_, refs)| refs.len() >= BURST_MIN_EVENTS)
        .map(|((kind, source), refs)| {
            let first = refs.iter().map(|&i| snapshot.events[i].at_ms).min().unwrap_or(0);
            let last = refs.iter().map(|&i| snapshot.events[i].at_ms).max().unwrap_or(0);
            Violation::new(
                format!("temporal-burst:{kind}"),
                Severity::Warn,
                BURST_CONFIDENCE,
                refs,
                first,
                last,
                vec![source],
            )
        })
        .collect()
}

fn detect_spatial_cooccurrence(snapshot: &TelemetrySnapshot) -> Vec<Violation> {
    let mut groups: BTreeMap<&str, (BTreeSet<NodeId>, Vec<usize>)> = BTreeMap::new();
    for (idx, event) in snapshot.events.iter().enumerate() {
        let entry = groups.entry(event.kind.as_str()).or_default();
        entry.0.insert(event.source);
        entry.1.push(idx);
    }

    groups
        .into_iter()
        .filter(|(_, (peers, _))| peers.len() >= SPATIAL_MIN_PEERS)
        .map(|(kind, (peers, refs))| {
            let first = refs.iter().map(|&i| snapshot.events[i].at_ms).min().unwrap_or(0);
            let last = refs.iter().map(|&i| snapshot.events[i].at_ms).max().unwrap_or(0);
            Violation::new(
                format!("spatial-cooccurrence:{kind}"),
                Severity::Warn,
                SPATIAL_CONFIDENCE,
                refs,
                first,
                last,
                peers.into_iter().collect(),
            )
        })
        .collect()
}

/// Per-second event-count series for one kind over the causal window.
fn bucket_series(snapshot: &TelemetrySnapshot, kind: &str, horizon_ms: u64) -> Vec<f64> {
    let start = snapshot.taken_at_ms.saturating_sub(horizon_ms);
    let buckets = (horizon_ms / 1_000) as usize;
    let mut series = vec![0.0; buckets.max(1)];
    for event in &snapshot.events {
        if event.kind == kind && event.at_ms >= start {
            let idx = ((event.at_ms - start) / 1_000) as usize;
            if idx < series.len() {
                series[idx] += 1.0;
            }
        }
    }
    series
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < CAUSAL_MIN_BUCKETS {
        return None;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

fn detect_causal_correlation(snapshot: &TelemetrySnapshot) -> Vec<Violation> {
    let horizon = snapshot.taken_at_ms.saturating_sub(CAUSAL_WINDOW_MS);
    let mut kinds: Vec<&str> = Vec::new();
    for event in &snapshot.events {
        if event.at_ms >= horizon && !kinds.contains(&event.kind.as_str()) {
            kinds.push(event.kind.as_str());
        }
    }
    kinds.sort_unstable();

    let mut violations = Vec::new();
    for i in 0..kinds.len() {
        for j in (i + 1)..kinds.len() {
            let series_a = bucket_series(snapshot, kinds[i], CAUSAL_WINDOW_MS);
            let series_b = bucket_series(snapshot, kinds[j], CAUSAL_WINDOW_MS);

            let mut best: Option<(f64, i64)> = None;
            for lag in -CAUSAL_MAX_LAG_S..=CAUSAL_MAX_LAG_S {
                let (a, b) = if lag >= 0 {
                    (&series_a[lag as usize..], &series_b[..])
                } else {
                    (&series_a[..], &series_b[(-lag) as usize..])
                };
                if let Some(r) = pearson(a, b) {
                    if best.is_none_or(|(br, _)| r.abs() > br.abs()) {
                        best = Some((r, lag));
                    }
                }
            }

            if let Some((r, lag)) = best {
                if r.abs() >= CAUSAL_MIN_R {
                    let (refs, peers, first, last) =
                        evidence_for_kinds(snapshot, &[kinds[i], kinds[j]], horizon);
                    let mut v = Violation::new(
                        format!("causal-correlation:{}~{}", kinds[i], kinds[j]),
                        Severity::Info,
                        CAUSAL_CONFIDENCE,
                        refs,
                        first,
                        last,
                        peers,
                    );
                    v.kind.push_str(&format!(":lag{lag}s"));
                    violations.push(v);
                }
            }
        }
    }
    violations
}

fn detect_frequency_anomaly(snapshot: &TelemetrySnapshot) -> Vec<Violation> {
    let horizon = snapshot.taken_at_ms.saturating_sub(FREQ_WINDOW_MS);
    let mut kinds: Vec<&str> = Vec::new();
    for event in &snapshot.events {
        if event.at_ms >= horizon && !kinds.contains(&event.kind.as_str()) {
            kinds.push(event.kind.as_str());
        }
    }
    kinds.sort_unstable();

    let mut violations = Vec::new();
    for kind in kinds {
        // Per-minute buckets; the newest bucket is the rate under test.
        let minutes = (FREQ_WINDOW_MS / 60_000) as usize;
        let mut buckets = vec![0.0f64; minutes];
        for event in &snapshot.events {
            if event.kind == kind && event.at_ms >= horizon {
                let idx = ((event.at_ms - horizon) / 60_000) as usize;
                if idx < buckets.len() {
                    buckets[idx] += 1.0;
                }
            }
        }
        let current = buckets[minutes - 1];
        let history = &buckets[..minutes - 1];
        let mean = history.iter().sum::<f64>() / history.len() as f64;
        let var = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / history.len() as f64;
        let bound = mean + FREQ_SIGMA * var.sqrt();

        let over_cap = current > FREQ_HARD_CAP_PER_MIN;
        // A flat history gives a degenerate bound; the cap still applies.
        let over_sigma = var > 0.0 && current > bound;
        if over_cap || over_sigma {
            let (refs, peers, first, last) = evidence_for_kinds(snapshot, &[kind], horizon);
            violations.push(Violation::new(
                format!("frequency-anomaly:{kind}"),
                if over_cap { Severity::Critical } else { Severity::Warn },
                FREQ_CONFIDENCE,
                refs,
                first,
                last,
                peers,
            ));
        }
    }
    violations
}

fn evidence_for_kinds(
    snapshot: &TelemetrySnapshot,
    kinds: &[&str],
    horizon_ms: u64,
) -> (Vec<usize>, Vec<NodeId>, u64, u64) {
    let mut refs = Vec::new();
    let mut peers = BTreeSet::new();
    let mut first = u64::MAX;
    let mut last = 0;
    for (idx, event) in snapshot.events.iter().enumerate() {
        if event.at_ms >= horizon_ms && kinds.contains(&event.kind.as_str()) {
            refs.push(idx);
            peers.insert(event.source);
            first = first.min(event.at_ms);
            last = last.max(event.at_ms);
        }
    }
    if first == u64::MAX {
        first = 0;
    }
    (refs, peers.into_iter().collect(), first, last)
}
