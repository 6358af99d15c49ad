//! Container manifest: the persisted declarative template for a container.
//!
//! A manifest is stored as `manifest.json` next to each container's
//! filesystem root. Loading yields a [`ManifestPatch`] (only the fields the
//! file actually sets); callers merge it over the explicit default manifest
//! when defaults are wanted. There is no silent fallback: a missing or
//! malformed file is a fatal error.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cage_protocol::RuleValue;

/// Result type for manifest operations.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors that can occur while loading or saving a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file does not exist.
    #[error("manifest not found: {0}")]
    NotFound(String),

    /// The manifest file is not valid JSON for the schema.
    #[error("malformed manifest {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A named volume declared by a manifest, mounted at `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDecl {
    pub name: String,
    pub to: String,
}

/// A container template: defaults for one container, persisted alongside its
/// filesystem root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Schema version of the persisted document.
    pub version: String,
    pub name: String,
    /// Base image reference this container was created from.
    pub from: Option<String>,
    pub workdir: String,
    pub cpus: String,
    pub cpuset: String,
    pub quota: String,
    pub rlimits: BTreeMap<String, String>,
    pub entry: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeDecl>,
    /// Low-level isolation/capability toggles. An open map: unknown keys are
    /// preserved verbatim and values are never type-coerced.
    pub rules: BTreeMap<String, RuleValue>,
}

/// Current manifest schema version.
pub const MANIFEST_VERSION: &str = "0.0.2";

impl Default for Manifest {
    fn default() -> Self {
        let mut rules: BTreeMap<String, RuleValue> = BTreeMap::new();
        rules.insert("allow.raw_sockets".into(), true.into());
        rules.insert("allow.socket_af".into(), true.into());
        rules.insert("allow.sysvipc".into(), true.into());
        rules.insert("host.hostname".into(), "name.local.net".into());
        rules.insert("sysvmsg".into(), true.into());
        rules.insert("sysvsem".into(), true.into());
        rules.insert("sysvshm".into(), true.into());
        rules.insert("persist".into(), true.into());
        rules.insert("vnet".into(), "new".into());

        Self {
            version: MANIFEST_VERSION.to_string(),
            name: String::new(),
            from: None,
            workdir: "/".to_string(),
            cpus: String::new(),
            cpuset: String::new(),
            quota: String::new(),
            rlimits: BTreeMap::new(),
            entry: String::new(),
            command: String::new(),
            env: BTreeMap::new(),
            volumes: Vec::new(),
            rules,
        }
    }
}

/// A partial manifest: exactly the fields a source (file or override) sets.
/// Deserializing applies no defaults; absent fields stay `None`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestPatch {
    pub version: Option<String>,
    pub name: Option<String>,
    pub from: Option<String>,
    pub workdir: Option<String>,
    pub cpus: Option<String>,
    pub cpuset: Option<String>,
    pub quota: Option<String>,
    pub rlimits: Option<BTreeMap<String, String>>,
    pub entry: Option<String>,
    pub command: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub volumes: Option<Vec<VolumeDecl>>,
    pub rules: Option<BTreeMap<String, RuleValue>>,
}

impl ManifestPatch {
    /// Load a persisted manifest snapshot. Fields absent in the file stay
    /// unset; callers merge against [`Manifest::default`] when defaults are
    /// desired.
    pub fn load(path: &Path) -> ManifestResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound(path.display().to_string())
            } else {
                ManifestError::Io(err)
            }
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestError::Malformed {
            path: path.display().to_string(),
            source,
        })
    }
}

impl Manifest {
    /// Return a new manifest equal to `self` with each patch's set fields
    /// shallow-overwriting matching fields, applied left to right. Later
    /// patches strictly win per field; a field no patch sets keeps the
    /// receiver's value.
    pub fn merge(&self, patches: &[ManifestPatch]) -> Manifest {
        let mut out = self.clone();
        for patch in patches {
            if let Some(v) = &patch.version {
                out.version = v.clone();
            }
            if let Some(v) = &patch.name {
                out.name = v.clone();
            }
            if let Some(v) = &patch.from {
                out.from = Some(v.clone());
            }
            if let Some(v) = &patch.workdir {
                out.workdir = v.clone();
            }
            if let Some(v) = &patch.cpus {
                out.cpus = v.clone();
            }
            if let Some(v) = &patch.cpuset {
                out.cpuset = v.clone();
            }
            if let Some(v) = &patch.quota {
                out.quota = v.clone();
            }
            if let Some(v) = &patch.rlimits {
                out.rlimits = v.clone();
            }
            if let Some(v) = &patch.entry {
                out.entry = v.clone();
            }
            if let Some(v) = &patch.command {
                out.command = v.clone();
            }
            if let Some(v) = &patch.env {
                out.env = v.clone();
            }
            if let Some(v) = &patch.volumes {
                out.volumes = v.clone();
            }
            if let Some(v) = &patch.rules {
                out.rules = v.clone();
            }
        }
        out
    }

    /// Serialize the full field set to `path`. All fields round-trip.
    pub fn save(&self, path: &Path) -> ManifestResult<()> {
        let text = serde_json::to_string(self).map_err(|source| ManifestError::Malformed {
            path: path.display().to_string(),
            source,
        })?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
