//! Daemon configuration and on-disk layout.
//!
//! The data directory resolves from `$X0MESH_HOME`, else `~/.x0mesh`, else
//! `./.x0mesh` for homeless environments. Key material lives under `keys/`
//! (owner-only on unix), runtime artifacts (pid, state report) under
//! `run/`, so wiping `run/` never touches identity or learned knowledge.
//!
//! Loading validates what the mesh cannot tolerate late: trusted-peer key
//! material is decoded eagerly, and protocol parameters that would wedge
//! the slot clock or the quorum rule are rejected before any socket opens.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use x0mesh_core::pqc::SigPublicKey;
use x0mesh_core::types::NodeId;
use x0mesh_core::MeshConfig;

/// Where this node keeps everything it persists.
#[derive(Debug, Clone)]
pub struct DataLayout {
    base: PathBuf,
}

impl DataLayout {
    /// Pure path construction; nothing is created. `resolve` is the entry
    /// that also prepares the directories.
    pub fn at(base: PathBuf) -> Self {
        Self { base }
    }

    /// `$X0MESH_HOME` > `~/.x0mesh` > `./.x0mesh`, with `keys/` and `run/`
    /// created and key storage tightened to the owner.
    pub fn resolve() -> Self {
        let base = std::env::var_os("X0MESH_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".x0mesh")))
            .unwrap_or_else(|| PathBuf::from(".x0mesh"));
        let layout = Self::at(base);
        layout.prepare();
        layout
    }

    fn prepare(&self) {
        for dir in [self.base.clone(), self.keys_dir(), self.run_dir()] {
            if let Err(e) = fs::create_dir_all(&dir) {
                warn!(dir = %dir.display(), error = %e, "could not create data directory");
            }
        }
        // Identity secrets are only ever read by this node.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(self.keys_dir(), fs::Permissions::from_mode(0o700));
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn keys_dir(&self) -> PathBuf {
        self.base.join("keys")
    }

    fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    pub fn config(&self) -> PathBuf {
        self.base.join("config.toml")
    }

    pub fn identity(&self) -> PathBuf {
        self.keys_dir().join("identity.json")
    }

    pub fn reputation(&self) -> PathBuf {
        self.base.join("reputation.json")
    }

    pub fn knowledge(&self) -> PathBuf {
        self.base.join("knowledge.json")
    }

    pub fn pid(&self) -> PathBuf {
        self.run_dir().join("node.pid")
    }

    pub fn state(&self) -> PathBuf {
        self.run_dir().join("node.state")
    }
}

/// A peer whose signing keys are known ahead of time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedPeer {
    /// Hex-encoded long-lived signing public key.
    pub sig_pubkey: String,
    /// Hex-encoded ed25519 verification key for the classical fallback.
    #[serde(default)]
    pub classical_pubkey: Option<String>,
    pub addr: SocketAddr,
}

/// A trusted peer with its key material decoded and its node id derived.
#[derive(Debug, Clone)]
pub struct ResolvedPeer {
    pub id: NodeId,
    pub sig_public: SigPublicKey,
    pub classical_public: Option<[u8; 32]>,
    pub addr: SocketAddr,
}

impl TrustedPeer {
    pub fn resolve(&self) -> anyhow::Result<ResolvedPeer> {
        let sig_bytes = hex::decode(&self.sig_pubkey)
            .map_err(|e| anyhow::anyhow!("trusted peer {}: bad sig_pubkey hex: {e}", self.addr))?;
        if sig_bytes.is_empty() {
            anyhow::bail!("trusted peer {}: empty sig_pubkey", self.addr);
        }
        let classical_public = match &self.classical_pubkey {
            None => None,
            Some(hex_key) => {
                let bytes = hex::decode(hex_key).map_err(|e| {
                    anyhow::anyhow!("trusted peer {}: bad classical_pubkey hex: {e}", self.addr)
                })?;
                Some(<[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    anyhow::anyhow!(
                        "trusted peer {}: classical_pubkey must be 32 bytes",
                        self.addr
                    )
                })?)
            }
        };
        Ok(ResolvedPeer {
            id: NodeId::from_signing_public(&sig_bytes),
            sig_public: SigPublicKey(sig_bytes),
            classical_public,
            addr: self.addr,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Serve the API beyond loopback.
    #[serde(default)]
    pub api_public: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            api_port: default_api_port(),
            api_public: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:7940".parse().expect("static socket address")
}

fn default_api_port() -> u16 {
    7941
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default)]
    pub trusted_peers: Vec<TrustedPeer>,
}

impl DaemonConfig {
    /// Read the config file, writing defaults on first run, and reject
    /// anything the mesh cannot start with.
    pub fn load_or_init(layout: &DataLayout) -> anyhow::Result<Self> {
        let path = layout.config();
        let config = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = DaemonConfig::default();
                fs::write(&path, toml::to_string_pretty(&config)?)?;
                info!(path = %path.display(), "wrote default configuration");
                config
            }
            Err(e) => return Err(anyhow::anyhow!("{}: {e}", path.display())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Decode every trusted peer, failing on the first malformed entry.
    pub fn resolved_peers(&self) -> anyhow::Result<Vec<ResolvedPeer>> {
        self.trusted_peers.iter().map(TrustedPeer::resolve).collect()
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mesh = &self.mesh;
        if mesh.slots.slot_ms == 0 {
            anyhow::bail!("slots.slot_ms must be non-zero");
        }
        if !(0.0..=1.0).contains(&mesh.slots.drift_damping) || mesh.slots.drift_damping == 0.0 {
            anyhow::bail!("slots.drift_damping must be in (0, 1]");
        }
        if !(0.0..1.0).contains(&mesh.reputation.quarantine_threshold) {
            anyhow::bail!("reputation.quarantine_threshold must be in [0, 1)");
        }
        if mesh.crypto.pqc_workers == 0 {
            anyhow::bail!("crypto.pqc_workers must be at least 1");
        }
        if mesh.crypto.session_ttl_slots == 0 {
            anyhow::bail!("crypto.session_ttl_slots must be non-zero");
        }
        if mesh.quorum.reputation_quorum_threshold <= 0.0 {
            anyhow::bail!("quorum.reputation_quorum_threshold must be positive");
        }
        // Surface key problems at startup, not at first beacon.
        self.resolved_peers()?;
        Ok(())
    }
}
