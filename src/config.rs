// src/config.rs
// Application configuration for the mesh control plane.
//
// Loaded from an optional TOML file; every field has a documented default
// matching the constants named throughout the original design.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::PeerNsError;

/// Application-wide configuration, independent of any single namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Short application name used as the prefix on every signaling endpoint
    /// string (e.g. `"peerns"` -> `peerns-<32hex>`).
    pub prefix: String,
    /// Custom namespaces this device should also join, in addition to the
    /// public-IP namespace (when IP detection succeeds).
    pub custom_namespaces: Vec<CustomNamespaceConfig>,
    /// When true, the user has gone offline: no namespace joins, rendezvous
    /// sweeps, or session reconnects should be attempted.
    pub offline: bool,
    /// Disables public-IP namespace participation even if IP detection
    /// succeeds (manual/custom connects still work).
    pub disable_public_namespace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomNamespaceConfig {
    pub name: String,
    /// Advanced mode uses the namespace name verbatim in endpoint strings
    /// instead of sanitizing/lowercasing it.
    pub advanced: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            prefix: "peerns".to_string(),
            custom_namespaces: Vec::new(),
            offline: false,
            disable_public_namespace: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits. A missing file is not an error: defaults apply.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PeerNsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| PeerNsError::Config(format!("reading {}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| PeerNsError::Config(format!("parsing {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PeerNsError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| PeerNsError::Config(format!("serializing config: {}", e)))?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| PeerNsError::Config(format!("writing {}: {}", path.as_ref().display(), e)))
    }
}
