//! Per-install identity: a peer id generated once and the last display name used.

use std::path::{Path, PathBuf};

use anyhow::Context;
use hive_core::PeerId;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
}

pub fn default_path() -> Option<PathBuf> {
    crate::config::config_dir().map(|d| d.join("identity.toml"))
}

/// Load the identity at `path`, creating it on first run. A non-empty `name` replaces
/// the saved display name.
pub fn load_or_create(path: &Path, name: Option<&str>) -> anyhow::Result<StoredIdentity> {
    let mut identity = if path.exists() {
        let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str::<StoredIdentity>(&s).with_context(|| format!("parsing {}", path.display()))?
    } else {
        let fresh = StoredIdentity {
            peer_id: PeerId::generate(),
            display_name: default_name(),
        };
        info!(peer = %fresh.peer_id, path = %path.display(), "generated new identity");
        fresh
    };
    let renamed = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) if n != identity.display_name => {
            identity.display_name = n.to_string();
            true
        }
        _ => false,
    };
    if renamed || !path.exists() {
        save(path, &identity)?;
    }
    Ok(identity)
}

fn save(path: &Path, identity: &StoredIdentity) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let s = toml::to_string(identity)?;
    std::fs::write(path, s).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn default_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "hive user".to_string())
}
