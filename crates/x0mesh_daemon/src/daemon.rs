//! Background process control.
//!
//! The pid file under `run/` belongs to the node process itself: `x0mesh
//! run` claims it once its identity and transport are up and releases it
//! on clean teardown, so a pid file pointing at a dead process always
//! means a crash. `stop` delivers an interrupt first and waits for the
//! drain (in-flight actions finish, sessions zeroize, state persists)
//! before resorting to a hard kill. `status` renders the node's own state
//! report, the same JSON the network plane writes each persistence pass.

use std::fs;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, Signal, System};
use tracing::{info, warn};

use crate::config::DataLayout;

/// How long `stop` waits for a graceful drain before a hard kill. Sized to
/// the control plane's shutdown deadline plus slack.
const DRAIN_WAIT: Duration = Duration::from_secs(12);
/// How long `start` waits for the spawned node to claim its pid file.
const SPAWN_WAIT: Duration = Duration::from_secs(5);
/// A state report older than this is reported as stale (the node writes
/// one roughly every minute at the default slot width).
const STATE_FRESH: Duration = Duration::from_secs(180);

/// What the pid file says about the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Running { pid: usize },
    /// Pid file present but the process is gone: unclean shutdown.
    Crashed { pid: usize },
    Stopped,
}

fn processes() -> System {
    System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()))
}

fn read_pid(layout: &DataLayout) -> Option<usize> {
    fs::read_to_string(layout.pid()).ok()?.trim().parse().ok()
}

pub fn probe(layout: &DataLayout) -> NodeHealth {
    match read_pid(layout) {
        None => NodeHealth::Stopped,
        Some(pid) if processes().process(Pid::from(pid)).is_some() => NodeHealth::Running { pid },
        Some(pid) => NodeHealth::Crashed { pid },
    }
}

/// Claim the pid file for this process. Called by the `run` entry before
/// the planes start; refuses to double-run against the same data dir.
pub fn claim_pid_file(layout: &DataLayout) -> anyhow::Result<()> {
    match probe(layout) {
        NodeHealth::Running { pid } => {
            anyhow::bail!("another node is already running on this data dir (pid {pid})")
        }
        NodeHealth::Crashed { pid } => {
            warn!(stale_pid = pid, "previous node did not shut down cleanly");
        }
        NodeHealth::Stopped => {}
    }
    fs::write(layout.pid(), std::process::id().to_string())?;
    Ok(())
}

/// Drop the claim on clean teardown.
pub fn release_pid_file(layout: &DataLayout) {
    let _ = fs::remove_file(layout.pid());
}

/// Spawn `x0mesh run` detached and wait until it claims the pid file.
pub fn start(layout: &DataLayout) -> anyhow::Result<()> {
    if let NodeHealth::Running { pid } = probe(layout) {
        anyhow::bail!("node already running (pid {pid})");
    }

    let exe = std::env::current_exe()?;
    Command::new(exe)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let deadline = Instant::now() + SPAWN_WAIT;
    while Instant::now() < deadline {
        if let NodeHealth::Running { pid } = probe(layout) {
            info!(pid, "mesh node started");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    anyhow::bail!(
        "node did not claim {} within {:?}; check its logs",
        layout.pid().display(),
        SPAWN_WAIT
    )
}

/// Interrupt the node and wait for its drain; kill hard only past the
/// deadline.
pub fn stop(layout: &DataLayout) -> anyhow::Result<()> {
    let pid = match probe(layout) {
        NodeHealth::Running { pid } => pid,
        NodeHealth::Crashed { pid } => {
            release_pid_file(layout);
            anyhow::bail!("node (pid {pid}) already gone; removed its stale pid file");
        }
        NodeHealth::Stopped => anyhow::bail!("no node is running"),
    };

    let system = processes();
    let Some(process) = system.process(Pid::from(pid)) else {
        release_pid_file(layout);
        return Ok(());
    };
    // Interrupt first so the node finishes its action boundary, zeroizes
    // sessions and persists reputation and knowledge.
    if process.kill_with(Signal::Interrupt).is_none() {
        process.kill();
    }

    let deadline = Instant::now() + DRAIN_WAIT;
    while Instant::now() < deadline {
        if probe(layout) != (NodeHealth::Running { pid }) {
            info!(pid, "mesh node stopped");
            release_pid_file(layout);
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
    }

    warn!(pid, "node ignored the interrupt past the drain deadline, killing");
    if let Some(process) = processes().process(Pid::from(pid)) {
        process.kill();
    }
    release_pid_file(layout);
    Ok(())
}

/// Report liveness plus the node's own state file: node id, epoch, slot,
/// peer counts and fallback status.
pub fn status(layout: &DataLayout) {
    match probe(layout) {
        NodeHealth::Stopped => {
            info!(status = "STOPPED", "node status");
            return;
        }
        NodeHealth::Crashed { pid } => {
            warn!(status = "CRASHED", pid, "node status; pid file left behind");
            return;
        }
        NodeHealth::Running { pid } => {
            info!(status = "RUNNING", pid, "node status");
        }
    }

    let state_path = layout.state();
    let Ok(raw) = fs::read_to_string(&state_path) else {
        info!("no state report yet (first persistence pass pending)");
        return;
    };
    let Ok(state) = serde_json::from_str::<serde_json::Value>(&raw) else {
        warn!(path = %state_path.display(), "state report unreadable");
        return;
    };

    let age = fs::metadata(&state_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok());
    if age.is_some_and(|a| a > STATE_FRESH) {
        warn!(age_s = age.map(|a| a.as_secs()).unwrap_or(0), "state report is stale");
    }

    let peers = state.get("peers").and_then(|v| v.as_array());
    let active = peers
        .map(|list| {
            list.iter()
                .filter(|p| p.get("state").and_then(|s| s.as_str()) == Some("Active"))
                .count()
        })
        .unwrap_or(0);
    info!(
        node_id = state.get("node_id").and_then(|v| v.as_str()).unwrap_or("?"),
        epoch = state.get("epoch").and_then(|v| v.as_u64()).unwrap_or(0),
        slot = state.get("slot").and_then(|v| v.as_u64()).unwrap_or(0),
        peers = peers.map(|l| l.len()).unwrap_or(0),
        active_peers = active,
        fallback = state
            .get("fallback_active")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        "mesh state"
    );
}
