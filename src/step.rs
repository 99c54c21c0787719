//! Step - The Unit of Work
//!
//! CRITICAL: steps are only ever executed through `run_step`, which enforces
//! the input/output contract around `Step::run`.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::state::{Artifact, DesignState, ViewId};
use crate::toolbox::{CancelToken, ToolError, Toolbox};
use crate::variables::Variable;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step {step} requires view '{view}' which is not in the design state")]
    MissingInputView { step: String, view: ViewId },

    #[error("Step {step} did not produce declared view '{view}'")]
    MissingOutputView { step: String, view: ViewId },

    #[error("Step {step} is misdefined: {reason}")]
    InvalidStepDefinition { step: String, reason: String },

    #[error("Step {step} produced malformed output: {reason}")]
    MalformedOutput { step: String, reason: String },

    #[error("Step {step} failed: {reason}")]
    Failed { step: String, reason: String },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("I/O error in step {step}: {source}")]
    Io {
        step: String,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a step may look at while it runs.
pub struct StepContext<'a> {
    pub state: &'a DesignState,
    pub config: &'a Config,
    pub step_dir: &'a Path,
    pub toolbox: &'a Toolbox,
    pub cancel: &'a CancelToken,
    pub timeout: Duration,
}

impl StepContext<'_> {
    /// Path of a required input view.
    pub fn input(&self, step: &str, view: ViewId) -> Result<&Path, StepError> {
        self.state
            .get(view)
            .map(|a| a.path.as_path())
            .ok_or_else(|| StepError::MissingInputView { step: step.to_string(), view })
    }

    pub fn step_file(&self, name: &str) -> PathBuf {
        self.step_dir.join(name)
    }
}

/// What a step hands back: produced files per view, and scalar metrics.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub views: BTreeMap<ViewId, PathBuf>,
    pub metrics: BTreeMap<String, f64>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, view: ViewId, path: impl Into<PathBuf>) -> Self {
        self.views.insert(view, path.into());
        self
    }

    pub fn metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Stateless step descriptor.
pub trait Step: Send + Sync {
    /// Stable identifier, unique within a flow.
    fn id(&self) -> &str;

    fn inputs(&self) -> &[ViewId];

    fn outputs(&self) -> &[ViewId];

    /// Variables this step declares (type, default, constraints).
    fn variables(&self) -> Vec<Variable> {
        vec![]
    }

    /// Names of every configuration variable the step reads, including
    /// globals it does not declare itself.
    fn config_vars(&self) -> Vec<String> {
        self.variables().into_iter().map(|v| v.name).collect()
    }

    /// Extra fingerprint material describing how the step works.
    fn definition(&self) -> JsonValue {
        JsonValue::Null
    }

    fn skippable(&self) -> bool {
        true
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError>;
}

/// Result of a contract-checked step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub state: DesignState,
    pub outputs: BTreeMap<ViewId, Artifact>,
    pub metrics: BTreeMap<String, f64>,
}

/// Run a step under its contract: inputs present before, every declared
/// output present and hashed after.
pub fn run_step(step: &dyn Step, ctx: &StepContext<'_>) -> Result<StepResult, StepError> {
    if let Some(view) = ctx.state.missing(step.inputs()).into_iter().next() {
        return Err(StepError::MissingInputView { step: step.id().to_string(), view });
    }

    let output = step.run(ctx)?;

    let mut outputs = BTreeMap::new();
    for view in step.outputs() {
        let path = output
            .views
            .get(view)
            .filter(|p| p.is_file())
            .ok_or_else(|| StepError::MissingOutputView { step: step.id().to_string(), view: *view })?;
        let artifact = Artifact::from_path(path.clone())
            .map_err(|source| StepError::Io { step: step.id().to_string(), source })?;
        outputs.insert(*view, artifact);
    }

    for extra in output.views.keys().filter(|v| !step.outputs().contains(v)) {
        tracing::warn!(step = step.id(), view = %extra, "undeclared output view ignored");
    }

    Ok(StepResult {
        state: ctx.state.with_views(outputs.clone()),
        outputs,
        metrics: output.metrics,
    })
}
