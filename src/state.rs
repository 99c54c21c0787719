//! Design State - Immutable View Bundles
//!
//! A state maps view identifiers to content-hashed artifacts. States are
//! never edited: `with_views` returns a new state that shares every untouched
//! artifact with its parent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::hashing::{hash_file, sha256_hex};

/// The closed set of design views a flow can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewId {
    Netlist,
    Sdc,
    Floorplan,
    PlacedDef,
    RoutedDef,
    Spef,
    Lib,
    Gds,
    TimingReport,
    PowerReport,
}

impl ViewId {
    pub const ALL: [ViewId; 10] = [
        ViewId::Netlist,
        ViewId::Sdc,
        ViewId::Floorplan,
        ViewId::PlacedDef,
        ViewId::RoutedDef,
        ViewId::Spef,
        ViewId::Lib,
        ViewId::Gds,
        ViewId::TimingReport,
        ViewId::PowerReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewId::Netlist => "netlist",
            ViewId::Sdc => "sdc",
            ViewId::Floorplan => "floorplan",
            ViewId::PlacedDef => "placed_def",
            ViewId::RoutedDef => "routed_def",
            ViewId::Spef => "spef",
            ViewId::Lib => "lib",
            ViewId::Gds => "gds",
            ViewId::TimingReport => "timing_report",
            ViewId::PowerReport => "power_report",
        }
    }

    /// Name used when the view path is exported to a tool environment.
    pub fn env_suffix(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown design view: {0}")]
pub struct UnknownView(pub String);

impl FromStr for ViewId {
    type Err = UnknownView;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewId::ALL
            .iter()
            .copied()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownView(s.to_string()))
    }
}

/// A file on disk plus the hash of its content when it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub hash: String,
}

impl Artifact {
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let hash = hash_file(&path)?;
        Ok(Self { path, hash })
    }

    /// True if the file still exists with the recorded content.
    pub fn verify(&self) -> bool {
        match hash_file(&self.path) {
            Ok(h) => h == self.hash,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateManifest {
    pub version: u64,
    pub views: BTreeMap<ViewId, Artifact>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "StateManifest", from = "StateManifest")]
pub struct DesignState {
    version: u64,
    views: BTreeMap<ViewId, Arc<Artifact>>,
}

impl DesignState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state by hashing the given files.
    pub fn from_files<I, P>(files: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = (ViewId, P)>,
        P: Into<PathBuf>,
    {
        let mut views = BTreeMap::new();
        for (view, path) in files {
            views.insert(view, Arc::new(Artifact::from_path(path)?));
        }
        Ok(Self { version: 0, views })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, view: ViewId) -> Option<&Artifact> {
        self.views.get(&view).map(|a| a.as_ref())
    }

    pub fn contains(&self, view: ViewId) -> bool {
        self.views.contains_key(&view)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn views(&self) -> impl Iterator<Item = (ViewId, &Artifact)> {
        self.views.iter().map(|(k, v)| (*k, v.as_ref()))
    }

    /// Views from `required` that are absent, in the given order.
    pub fn missing(&self, required: &[ViewId]) -> Vec<ViewId> {
        required.iter().copied().filter(|v| !self.contains(*v)).collect()
    }

    /// Copy-with-overrides. Untouched views stay shared with `self`.
    pub fn with_views<I>(&self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (ViewId, Artifact)>,
    {
        let mut views = self.views.clone();
        for (view, artifact) in overrides {
            views.insert(view, Arc::new(artifact));
        }
        Self { version: self.version + 1, views }
    }

    /// True if both states hold the very same artifact allocation for `view`.
    pub fn shares_view(&self, other: &DesignState, view: ViewId) -> bool {
        match (self.views.get(&view), other.views.get(&view)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `(view, hash)` pairs for the given views, sorted by view.
    pub fn input_hashes(&self, views: &[ViewId]) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = views
            .iter()
            .filter_map(|v| self.get(*v).map(|a| (v.to_string(), a.hash.clone())))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }

    /// Digest over view contents only; paths and version do not participate.
    pub fn content_digest(&self) -> String {
        let lines: String = self
            .views
            .iter()
            .map(|(k, v)| format!("{}={}\n", k.as_str(), v.hash))
            .collect();
        sha256_hex(lines.as_bytes())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl From<DesignState> for StateManifest {
    fn from(state: DesignState) -> Self {
        Self {
            version: state.version,
            views: state
                .views
                .into_iter()
                .map(|(k, v)| (k, Arc::unwrap_or_clone(v)))
                .collect(),
        }
    }
}

impl From<StateManifest> for DesignState {
    fn from(manifest: StateManifest) -> Self {
        Self {
            version: manifest.version,
            views: manifest
                .views
                .into_iter()
                .map(|(k, v)| (k, Arc::new(v)))
                .collect(),
        }
    }
}
