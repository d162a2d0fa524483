//! Default implementations of the pluggable contracts.
//!
//! These keep a standalone node operational without external
//! collaborators: process gauges as the metric source, a pass-through
//! anomaly detector, and action handlers that log non-mesh actions while
//! routing `Quarantine` back into the network plane.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::mpsc;
use tracing::info;
use x0mesh_core::analyzer::{AnomalyDetector, Violation};
use x0mesh_core::executor::{ActionError, ActionHandler, ActionResult};
use x0mesh_core::planner::RemediationAction;
use x0mesh_core::telemetry::{MetricSource, TelemetrySnapshot};
use x0mesh_core::NodeId;

use crate::node::NetCommand;

/// Process-level gauges from sysinfo.
pub struct SystemMetricSource {
    system: std::sync::Mutex<System>,
}

impl SystemMetricSource {
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMetricSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for SystemMetricSource {
    fn collect(&self) -> HashMap<String, f64> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_all();
        let mut out = HashMap::new();
        out.insert("mem_used_bytes".to_string(), system.used_memory() as f64);
        out.insert("mem_total_bytes".to_string(), system.total_memory() as f64);
        let cpu_avg = {
            let cpus = system.cpus();
            if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
            }
        };
        out.insert("cpu_usage_pct".to_string(), cpu_avg);
        out
    }
}

/// Placeholder for an external ML detector; finds nothing.
pub struct NoopAnomalyDetector;

impl AnomalyDetector for NoopAnomalyDetector {
    fn name(&self) -> &str {
        "noop"
    }

    fn analyze(&self, _snapshot: &TelemetrySnapshot) -> Vec<Violation> {
        Vec::new()
    }
}

/// Applies non-mesh actions by logging them; rollback is symmetric. Real
/// deployments substitute handlers that touch the managed system.
pub struct LoggingActionHandler;

#[async_trait]
impl ActionHandler for LoggingActionHandler {
    async fn apply(&self, action: &RemediationAction) -> Result<ActionResult, ActionError> {
        info!(?action, "applying remediation action");
        Ok(ActionResult {
            detail: format!("{action:?}"),
            state_token: None,
        })
    }

    async fn rollback(
        &self,
        action: &RemediationAction,
        _result: &ActionResult,
    ) -> Result<(), ActionError> {
        info!(?action, "rolling back remediation action");
        Ok(())
    }
}

/// Puts the PQC engine into its TTL-bounded classical fallback window.
pub struct FallbackHandler {
    engine: Arc<x0mesh_core::pqc::PqcEngine>,
    clock: Arc<dyn x0mesh_core::clock::ClockSource>,
}

impl FallbackHandler {
    pub fn new(
        engine: Arc<x0mesh_core::pqc::PqcEngine>,
        clock: Arc<dyn x0mesh_core::clock::ClockSource>,
    ) -> Arc<Self> {
        Arc::new(Self { engine, clock })
    }
}

#[async_trait]
impl ActionHandler for FallbackHandler {
    async fn apply(&self, action: &RemediationAction) -> Result<ActionResult, ActionError> {
        let RemediationAction::ActivateFallback { reason, ttl_secs } = action else {
            return Err(ActionError("handler only accepts fallback actions".into()));
        };
        info!(reason = %reason, ttl_secs, "activating classical fallback");
        self.engine.enter_fallback(self.clock.now_ms());
        Ok(ActionResult {
            detail: format!("fallback active: {reason}"),
            state_token: None,
        })
    }

    async fn rollback(
        &self,
        _action: &RemediationAction,
        _result: &ActionResult,
    ) -> Result<(), ActionError> {
        // Fallback expires by TTL; there is no early exit to undo.
        Ok(())
    }
}

/// Routes approved quarantines into the network plane, which owns the peer
/// table.
pub struct QuarantineHandler {
    commands: mpsc::Sender<NetCommand>,
}

impl QuarantineHandler {
    pub fn new(commands: mpsc::Sender<NetCommand>) -> Arc<Self> {
        Arc::new(Self { commands })
    }
}

#[async_trait]
impl ActionHandler for QuarantineHandler {
    async fn apply(&self, action: &RemediationAction) -> Result<ActionResult, ActionError> {
        let RemediationAction::Quarantine { peer } = action else {
            return Err(ActionError("handler only accepts quarantine actions".into()));
        };
        self.commands
            .send(NetCommand::QuarantinePeer { peer: *peer })
            .await
            .map_err(|_| ActionError("network plane gone".into()))?;
        Ok(ActionResult {
            detail: format!("quarantine requested for {peer}"),
            state_token: Some(peer.to_hex()),
        })
    }

    async fn rollback(
        &self,
        _action: &RemediationAction,
        result: &ActionResult,
    ) -> Result<(), ActionError> {
        let Some(peer_hex) = &result.state_token else {
            return Ok(());
        };
        let Some(peer) = NodeId::from_hex(peer_hex) else {
            return Err(ActionError("malformed quarantine state token".into()));
        };
        self.commands
            .send(NetCommand::LiftQuarantine { peer })
            .await
            .map_err(|_| ActionError("network plane gone".into()))
    }
}
