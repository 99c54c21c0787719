//! Checkpoints - durable run records and run directory ownership
//!
//! The checkpoint is the only thing resume and caching depend on. Its layout
//! is versioned by `format_version`; a different major version is refused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::StepAction;
use crate::state::{Artifact, DesignState, ViewId};

pub const CHECKPOINT_FORMAT_VERSION: &str = "1.0.0";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed checkpoint {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Checkpoint format {found} is incompatible with supported format {supported}")]
    IncompatibleCheckpoint { found: String, supported: String },

    #[error("Run directory {0} is in use by another run")]
    RunDirectoryLocked(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: usize,
    pub fingerprint: String,
    pub outputs: BTreeMap<ViewId, Artifact>,
    pub metrics: BTreeMap<String, f64>,
    pub action: StepAction,
    pub runtime_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

impl StepRecord {
    /// Every recorded output still exists with its recorded content.
    pub fn outputs_intact(&self) -> bool {
        self.outputs.values().all(Artifact::verify)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub index: usize,
    pub step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: semver::Version,
    pub flow: String,
    pub run_id: Uuid,
    pub updated_at: DateTime<Utc>,
    pub state: DesignState,
    pub last_completed: Option<CompletedStep>,
    pub steps: BTreeMap<String, StepRecord>,
}

fn supported_version() -> semver::Version {
    // constant literal, always parses
    semver::Version::parse(CHECKPOINT_FORMAT_VERSION).unwrap_or_else(|_| semver::Version::new(1, 0, 0))
}

impl Checkpoint {
    pub fn new(flow: &str, run_id: Uuid, state: DesignState) -> Self {
        Self {
            format_version: supported_version(),
            flow: flow.to_string(),
            run_id,
            updated_at: Utc::now(),
            state,
            last_completed: None,
            steps: BTreeMap::new(),
        }
    }

    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join(CHECKPOINT_FILE)
    }

    /// Load the checkpoint of a run directory, if there is one.
    pub fn load(run_dir: &Path) -> Result<Option<Self>, CheckpointError> {
        let path = Self::path(run_dir);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|source| CheckpointError::Malformed { path, source })?;
        checkpoint.check_version()?;
        Ok(Some(checkpoint))
    }

    fn check_version(&self) -> Result<(), CheckpointError> {
        let supported = supported_version();
        if self.format_version.major != supported.major {
            return Err(CheckpointError::IncompatibleCheckpoint {
                found: self.format_version.to_string(),
                supported: supported.to_string(),
            });
        }
        Ok(())
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&mut self, run_dir: &Path) -> Result<(), CheckpointError> {
        self.updated_at = Utc::now();
        let path = Self::path(run_dir);
        let tmp = run_dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        let io_err = |source| CheckpointError::Io { path: path.clone(), source };

        let json = serde_json::to_string_pretty(self)
            .map_err(|source| CheckpointError::Malformed { path: path.clone(), source })?;
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    /// A record that can stand in for running `step_id` again.
    pub fn reusable(&self, step_id: &str, fingerprint: &str) -> Option<&StepRecord> {
        self.steps
            .get(step_id)
            .filter(|r| r.fingerprint == fingerprint && r.outputs_intact())
    }

    pub fn record(&mut self, step_id: &str, record: StepRecord, state: DesignState) {
        self.last_completed = Some(CompletedStep { index: record.index, step_id: step_id.to_string() });
        self.steps.insert(step_id.to_string(), record);
        self.state = state;
    }

    pub fn forget(&mut self, step_id: &str) -> Option<StepRecord> {
        self.steps.remove(step_id)
    }
}

/// Exclusive ownership of a run directory for the lifetime of the guard.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the run directory. A lock left behind by a process that no
    /// longer exists is taken over.
    pub fn acquire(run_dir: &Path, run_id: Uuid) -> Result<Self, CheckpointError> {
        let path = run_dir.join(LOCK_FILE);
        match Self::create(&path, run_id) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let Some(pid) = stale_owner(&path) else {
                    return Err(CheckpointError::RunDirectoryLocked(run_dir.to_path_buf()));
                };
                tracing::warn!(path = %path.display(), pid, "taking over lock of a dead run");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => return Err(CheckpointError::Io { path, source }),
                }
                match Self::create(&path, run_id) {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        Err(CheckpointError::RunDirectoryLocked(run_dir.to_path_buf()))
                    }
                    Err(source) => Err(CheckpointError::Io { path, source }),
                    Ok(lock) => Ok(lock),
                }
            }
            Err(source) => Err(CheckpointError::Io { path, source }),
            Ok(lock) => Ok(lock),
        }
    }

    fn create(path: &Path, run_id: Uuid) -> io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let lock = Self { path: path.to_path_buf() };
        // dropping `lock` removes a half-written file
        writeln!(file, "pid={} run={}", std::process::id(), run_id)?;
        Ok(lock)
    }
}

/// Pid recorded in the lock at `path`, if that process is gone.
fn stale_owner(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    let pid = content
        .split_whitespace()
        .find_map(|field| field.strip_prefix("pid="))
        .and_then(|pid| pid.parse::<u32>().ok())?;
    (!process_alive(pid)).then_some(pid)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return true;
    }
    // SAFETY: signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
