//! Flow Engine - Single Entry Point for Running Steps
//!
//! Steps run strictly in declaration order. After each step the checkpoint
//! is rewritten; a step whose fingerprint matches its checkpoint record is
//! skipped and its recorded outputs are reattached. From the first step that
//! re-executes onwards every step runs again. The first failure halts the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointError, RunLock, StepRecord};
use crate::config::{Config, ConfigError, InvalidConfig};
use crate::hashing::{compute_fingerprint, FingerprintInput};
use crate::metrics::{MetricsTable, StepAction, StepMetrics};
use crate::state::DesignState;
use crate::step::{run_step, Step, StepContext, StepError};
use crate::steps::sanitize;
use crate::toolbox::{CancelToken, ToolError, Toolbox};
use crate::variables::{Variable, VariableRegistry};

pub const STATE_IN_FILE: &str = "state_in.json";
pub const STATE_OUT_FILE: &str = "state_out.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const RESOLVED_CONFIG_FILE: &str = "resolved.json";

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Config(#[from] InvalidConfig),

    #[error("Duplicate step id in flow: {0}")]
    DuplicateStep(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Unknown flow '{name}', known flows: {}", .known.join(", "))]
    UnknownFlow { name: String, known: Vec<String> },

    #[error("Step {index} ({step_id}) failed: {source}")]
    Step {
        index: usize,
        step_id: String,
        #[source]
        source: StepError,
    },

    #[error("Run cancelled before step {step_id}")]
    Cancelled { step_id: String },

    #[error("No checkpointed output to start past step {step_id}")]
    NoCheckpointedOutput { step_id: String },

    #[error("Step window is empty: '{from}' comes after '{to}'")]
    EmptyWindow { from: String, to: String },

    #[error("Could not fingerprint step {step_id}: {source}")]
    Fingerprint {
        step_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Coarse failure classes, each with its own process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Configuration,
    Tool,
    Timeout,
    Cancelled,
    Internal,
}

impl FailureClass {
    pub fn exit_code(&self) -> u8 {
        match self {
            FailureClass::Internal => 1,
            FailureClass::Configuration => 2,
            FailureClass::Tool => 3,
            FailureClass::Timeout => 4,
            FailureClass::Cancelled => 130,
        }
    }
}

impl FlowError {
    pub fn class(&self) -> FailureClass {
        match self {
            FlowError::Config(_) => FailureClass::Configuration,
            FlowError::Step { source, .. } => match source {
                StepError::Tool(ToolError::Timeout { .. }) => FailureClass::Timeout,
                StepError::Tool(ToolError::Cancelled { .. }) => FailureClass::Cancelled,
                StepError::Tool(ToolError::Io { .. }) => FailureClass::Internal,
                StepError::Tool(_) | StepError::MalformedOutput { .. } | StepError::Failed { .. } => {
                    FailureClass::Tool
                }
                StepError::MissingInputView { .. }
                | StepError::MissingOutputView { .. }
                | StepError::InvalidStepDefinition { .. }
                | StepError::Io { .. } => FailureClass::Internal,
            },
            FlowError::Cancelled { .. } => FailureClass::Cancelled,
            _ => FailureClass::Internal,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }

    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> FlowError {
        let context = context.into();
        move |source| FlowError::Io { context, source }
    }
}

/// An ordered list of steps with unique ids.
pub struct Flow {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("steps", &self.step_ids())
            .finish()
    }
}

impl Flow {
    pub fn new(name: &str, steps: Vec<Box<dyn Step>>) -> Result<Self, FlowError> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id().to_string()) {
                return Err(FlowError::DuplicateStep(step.id().to_string()));
            }
        }
        Ok(Self { name: name.to_string(), steps })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id()).collect()
    }

    pub fn position(&self, step_id: &str) -> Result<usize, FlowError> {
        self.steps
            .iter()
            .position(|s| s.id() == step_id)
            .ok_or_else(|| FlowError::UnknownStep(step_id.to_string()))
    }

    /// Registry holding `globals` plus every step's declarations.
    pub fn variable_registry<I>(&self, globals: I) -> Result<VariableRegistry, ConfigError>
    where
        I: IntoIterator<Item = Variable>,
    {
        let mut registry = VariableRegistry::new();
        registry.register_all(globals)?;
        for step in &self.steps {
            registry.register_all(step.variables())?;
        }
        Ok(registry)
    }

    /// Walk the declared contracts against `initial` without running
    /// anything; the first step whose inputs cannot exist yet is reported.
    pub fn check_order(&self, initial: &DesignState) -> Result<(), FlowError> {
        let mut available: HashSet<_> = initial.views().map(|(v, _)| v).collect();
        for (index, step) in self.steps.iter().enumerate() {
            if let Some(view) = step.inputs().iter().find(|v| !available.contains(*v)) {
                return Err(FlowError::Step {
                    index,
                    step_id: step.id().to_string(),
                    source: StepError::MissingInputView { step: step.id().to_string(), view: *view },
                });
            }
            available.extend(step.outputs().iter().copied());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    Running,
    Resumed,
    Succeeded,
    Cancelled { before: String },
    Failed { step_index: usize, step_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub step_id: String,
    pub status: StepStatus,
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub flow: String,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepReport>,
    pub state: DesignState,
    pub metrics: MetricsTable,
}

impl RunReport {
    pub fn step(&self, step_id: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.step(step_id).map(|s| s.status)
    }

    /// Ids of the steps that ended in `status`, in flow order.
    pub fn steps_with(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.step_id.as_str())
            .collect()
    }
}

/// A failed run: the error plus everything produced before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FlowFailure {
    #[source]
    pub error: FlowError,
    pub report: Option<Box<RunReport>>,
}

impl FlowFailure {
    fn early(error: FlowError) -> Self {
        Self { error, report: None }
    }
}

impl From<FlowError> for FlowFailure {
    fn from(error: FlowError) -> Self {
        Self::early(error)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_dir: PathBuf,
    /// Re-execute from this step; earlier steps are reattached from the checkpoint.
    pub from: Option<String>,
    /// Stop after this step.
    pub to: Option<String>,
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl RunOptions {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            from: None,
            to: None,
            timeout: Duration::from_secs(3600),
            cancel: CancelToken::new(),
        }
    }

    pub fn from_step(mut self, step_id: &str) -> Self {
        self.from = Some(step_id.to_string());
        self
    }

    pub fn to_step(mut self, step_id: &str) -> Self {
        self.to = Some(step_id.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs flows with a given toolbox.
#[derive(Debug, Clone)]
pub struct FlowEngine {
    toolbox: Toolbox,
}

impl FlowEngine {
    pub fn new(toolbox: Toolbox) -> Self {
        Self { toolbox }
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    /// Fingerprint of `step` against the current state and configuration.
    pub fn fingerprint(step: &dyn Step, state: &DesignState, config: &Config) -> Result<String, FlowError> {
        let definition = step.definition();
        let subset = config.subset(&step.config_vars());
        let inputs = state.input_hashes(step.inputs());
        compute_fingerprint(&FingerprintInput {
            step_id: step.id(),
            definition: &definition,
            config: &subset,
            inputs: &inputs,
        })
        .map_err(|source| FlowError::Fingerprint { step_id: step.id().to_string(), source })
    }

    /// Run `flow` in `options.run_dir`, resuming from its checkpoint if any.
    pub fn run(
        &self,
        flow: &Flow,
        config: &Config,
        initial: DesignState,
        options: &RunOptions,
    ) -> Result<RunReport, FlowFailure> {
        let run_dir = &options.run_dir;
        fs::create_dir_all(run_dir).map_err(FlowError::io(format!("create {}", run_dir.display())))?;

        let from = options.from.as_deref().map(|s| flow.position(s)).transpose()?;
        let to = options.to.as_deref().map(|s| flow.position(s)).transpose()?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(FlowError::EmptyWindow {
                    from: flow.steps()[f].id().to_string(),
                    to: flow.steps()[t].id().to_string(),
                }
                .into());
            }
        }
        flow.check_order(&initial)?;

        let fresh_id = Uuid::new_v4();
        let _lock = RunLock::acquire(run_dir, fresh_id).map_err(FlowError::from)?;
        let loaded = Checkpoint::load(run_dir).map_err(FlowError::from)?;
        let resumed = loaded.is_some();
        let run_id = loaded.as_ref().map(|c| c.run_id).unwrap_or(fresh_id);

        if let Some(cp) = &loaded {
            if cp.flow != flow.name() {
                tracing::warn!(previous = %cp.flow, current = flow.name(), "checkpoint was written by another flow");
            }
        }
        let mut checkpoint = loaded.unwrap_or_else(|| Checkpoint::new(flow.name(), run_id, initial.clone()));

        initial
            .save(&run_dir.join(STATE_IN_FILE))
            .map_err(FlowError::io("write input state"))?;
        let resolved = serde_json::to_string_pretty(&config.to_json())
            .map_err(|e| FlowError::Io { context: "render resolved configuration".to_string(), source: e.into() })?;
        fs::write(run_dir.join(RESOLVED_CONFIG_FILE), resolved).map_err(FlowError::io("write resolved configuration"))?;

        let mut run = Run {
            engine: self,
            flow,
            config,
            options,
            checkpoint: &mut checkpoint,
            report: RunReport {
                run_id,
                flow: flow.name().to_string(),
                run_dir: run_dir.clone(),
                status: if resumed { RunStatus::Resumed } else { RunStatus::Running },
                resumed,
                started_at: Utc::now(),
                finished_at: None,
                steps: flow
                    .steps()
                    .iter()
                    .enumerate()
                    .map(|(index, s)| StepReport {
                        index,
                        step_id: s.id().to_string(),
                        status: StepStatus::Pending,
                        fingerprint: None,
                    })
                    .collect(),
                state: initial,
                metrics: MetricsTable::new(),
            },
        };

        tracing::info!(flow = flow.name(), run_dir = %run_dir.display(), resumed, "starting flow");
        let outcome = run.execute(from, to);
        let mut report = run.report;
        report.finished_at = Some(Utc::now());

        let persisted = report
            .state
            .save(&run_dir.join(STATE_OUT_FILE))
            .and_then(|_| report.metrics.save(&run_dir.join(METRICS_FILE)));

        match outcome {
            Ok(()) => {
                persisted.map_err(FlowError::io("write run results"))?;
                report.status = RunStatus::Succeeded;
                tracing::info!(flow = flow.name(), "flow completed");
                Ok(report)
            }
            Err(error) => {
                if let Err(e) = persisted {
                    tracing::warn!(error = %e, "could not write partial results");
                }
                tracing::error!(flow = flow.name(), error = %error, "flow failed");
                Err(FlowFailure { error, report: Some(Box::new(report)) })
            }
        }
    }
}

/// State of one in-progress run.
struct Run<'a> {
    engine: &'a FlowEngine,
    flow: &'a Flow,
    config: &'a Config,
    options: &'a RunOptions,
    checkpoint: &'a mut Checkpoint,
    report: RunReport,
}

impl Run<'_> {
    fn execute(&mut self, from: Option<usize>, to: Option<usize>) -> Result<(), FlowError> {
        let flow = self.flow;
        let last = to.unwrap_or(flow.steps().len().saturating_sub(1));
        // once a step re-executes, everything after it re-executes too
        let mut rerun = false;

        for (index, step) in flow.steps().iter().enumerate() {
            if index > last {
                break;
            }
            if self.options.cancel.is_cancelled() {
                tracing::warn!(step = step.id(), "cancelled between steps");
                self.report.status = RunStatus::Cancelled { before: step.id().to_string() };
                return Err(FlowError::Cancelled { step_id: step.id().to_string() });
            }
            let step = step.as_ref();

            if from.is_some_and(|f| index < f) {
                self.reattach_unconditionally(index, step)?;
                continue;
            }

            if let Some(view) = self.report.state.missing(step.inputs()).into_iter().next() {
                return Err(self.fail(index, step, StepError::MissingInputView { step: step.id().to_string(), view }));
            }

            let fingerprint = FlowEngine::fingerprint(step, &self.report.state, self.config)?;
            self.report.steps[index].fingerprint = Some(fingerprint.clone());
            tracing::debug!(step = step.id(), %fingerprint, "fingerprint");

            let forced = rerun || from == Some(index) || !step.skippable();
            let cached = if forced { None } else { self.checkpoint.reusable(step.id(), &fingerprint).cloned() };

            match cached {
                Some(record) => self.skip(index, step, record)?,
                None => {
                    rerun = true;
                    self.execute_step(index, step, fingerprint)?
                }
            }
        }
        Ok(())
    }

    fn step_dir(&self, index: usize, step: &dyn Step) -> PathBuf {
        self.options
            .run_dir
            .join(format!("{:02}-{}", index + 1, sanitize(step.id())))
    }

    fn fail(&mut self, index: usize, step: &dyn Step, source: StepError) -> FlowError {
        self.report.steps[index].status = StepStatus::Failed;
        self.report.status = RunStatus::Failed { step_index: index, step_id: step.id().to_string() };
        FlowError::Step { index, step_id: step.id().to_string(), source }
    }

    fn reattach(&mut self, index: usize, step: &dyn Step, record: StepRecord) -> Result<(), FlowError> {
        self.report.state = self.report.state.with_views(record.outputs.clone());
        self.report.steps[index].status = StepStatus::Skipped;
        self.report.metrics.push(StepMetrics {
            step_id: step.id().to_string(),
            action: StepAction::Skipped,
            runtime_seconds: record.runtime_seconds,
            values: record.metrics.clone(),
        });
        let record = StepRecord { index, action: StepAction::Skipped, ..record };
        self.checkpoint.record(step.id(), record, self.report.state.clone());
        self.checkpoint.save(&self.options.run_dir)?;
        Ok(())
    }

    fn skip(&mut self, index: usize, step: &dyn Step, record: StepRecord) -> Result<(), FlowError> {
        tracing::info!(step = step.id(), "fingerprint unchanged, skipping");
        self.reattach(index, step, record)
    }

    fn reattach_unconditionally(&mut self, index: usize, step: &dyn Step) -> Result<(), FlowError> {
        let record = self
            .checkpoint
            .steps
            .get(step.id())
            .filter(|r| r.outputs_intact())
            .cloned()
            .ok_or_else(|| FlowError::NoCheckpointedOutput { step_id: step.id().to_string() })?;
        tracing::info!(step = step.id(), "before start step, reusing checkpointed outputs");
        self.reattach(index, step, record)
    }

    fn execute_step(&mut self, index: usize, step: &dyn Step, fingerprint: String) -> Result<(), FlowError> {
        let step_dir = self.step_dir(index, step);

        if self.checkpoint.forget(step.id()).is_some() {
            self.checkpoint.save(&self.options.run_dir)?;
        }
        if step_dir.exists() {
            fs::remove_dir_all(&step_dir).map_err(FlowError::io(format!("clear {}", step_dir.display())))?;
        }
        fs::create_dir_all(&step_dir).map_err(FlowError::io(format!("create {}", step_dir.display())))?;

        tracing::info!(step = step.id(), index, "running step");
        self.report.steps[index].status = StepStatus::Running;

        let ctx = StepContext {
            state: &self.report.state,
            config: self.config,
            step_dir: &step_dir,
            toolbox: &self.engine.toolbox,
            cancel: &self.options.cancel,
            timeout: self.options.timeout,
        };
        let started = Instant::now();
        let result = run_step(step, &ctx);
        let runtime = started.elapsed().as_secs_f64();

        let result = match result {
            Ok(r) => r,
            Err(source) => {
                log_failure(step, &source);
                return Err(self.fail(index, step, source));
            }
        };

        self.report.state = result.state;
        self.report.steps[index].status = StepStatus::Succeeded;
        self.report.metrics.push(StepMetrics {
            step_id: step.id().to_string(),
            action: StepAction::Ran,
            runtime_seconds: runtime,
            values: result.metrics.clone(),
        });

        let record = StepRecord {
            index,
            fingerprint,
            outputs: result.outputs,
            metrics: result.metrics,
            action: StepAction::Ran,
            runtime_seconds: runtime,
            completed_at: Utc::now(),
        };
        self.checkpoint.record(step.id(), record, self.report.state.clone());
        self.checkpoint.save(&self.options.run_dir)?;
        tracing::info!(step = step.id(), runtime_seconds = runtime, "step succeeded");
        Ok(())
    }
}

fn log_failure(step: &dyn Step, error: &StepError) {
    match error {
        StepError::Tool(ToolError::ToolFailure { tail, log, .. }) | StepError::Tool(ToolError::Timeout { tail, log, .. }) => {
            tracing::error!(step = step.id(), log = %log.display(), "{}", error);
            for line in tail {
                tracing::error!(step = step.id(), "| {}", line);
            }
        }
        _ => tracing::error!(step = step.id(), "{}", error),
    }
}

/// Most recently modified run directory under `runs_dir`.
pub fn latest_run(runs_dir: &Path) -> Option<PathBuf> {
    fs::read_dir(runs_dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.metadata().and_then(|m| m.modified()).ok().map(|t| (t, e.path())))
        .max_by_key(|(t, _)| *t)
        .map(|(_, p)| p)
}

/// Default tag for a new run.
pub fn default_run_tag(now: DateTime<Utc>) -> String {
    format!("RUN_{}", now.format("%Y-%m-%d_%H-%M-%S"))
}
