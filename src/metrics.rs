//! Metrics - per-run ordered metric table

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Whether a step's outputs were produced now or reattached from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step_id: String,
    pub action: StepAction,
    pub runtime_seconds: f64,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTable {
    rows: Vec<StepMetrics>,
}

impl MetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: StepMetrics) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[StepMetrics] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, step_id: &str) -> Option<&StepMetrics> {
        self.rows.iter().find(|r| r.step_id == step_id)
    }

    /// The value reported by the latest step that reported `name`.
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.rows.iter().rev().find_map(|r| r.values.get(name).copied())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)
    }
}

/// Parse a flat JSON object of numeric metrics. Non-numeric entries are
/// ignored; anything other than an object is malformed.
pub fn read_metrics_file(path: &Path) -> Result<BTreeMap<String, f64>, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let parsed: JsonValue = serde_json::from_str(&content).map_err(|e| format!("{}: {}", path.display(), e))?;
    let JsonValue::Object(map) = parsed else {
        return Err(format!("{}: expected a JSON object", path.display()));
    };
    Ok(map
        .into_iter()
        .filter_map(|(k, v)| v.as_f64().map(|n| (k, n)))
        .collect())
}
