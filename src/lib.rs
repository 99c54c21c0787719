//! asicflow Core - ASIC Flow Orchestration Engine
//!
//! # The Five Rules
//! 1. Design State Is Immutable: every step returns a new state
//! 2. Steps Declare Contracts: inputs checked before, outputs after
//! 3. Configuration Is Typed: one registry, validated before any tool runs
//! 4. Fingerprints Decide Reuse: unchanged inputs and config never rerun
//! 5. Checkpoints Enable Resume

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod flow;
pub mod hashing;
pub mod metrics;
pub mod process;
pub mod state;
pub mod step;
pub mod steps;
pub mod toolbox;
pub mod validation;
pub mod variables;

pub use catalog::{builtin_validator, global_variables, FlowRegistry, StepRegistry};
pub use checkpoint::{Checkpoint, CheckpointError, RunLock, StepRecord};
pub use config::{Config, ConfigError, ConfigResolver, InvalidConfig, RawConfig};
pub use flow::{FailureClass, Flow, FlowEngine, FlowError, FlowFailure, RunOptions, RunReport, RunStatus, StepStatus};
pub use hashing::{canonical_json, compute_fingerprint, hash_file};
pub use metrics::{MetricsTable, StepAction, StepMetrics};
pub use process::{KitRegistry, ProcessKit};
pub use state::{Artifact, DesignState, ViewId};
pub use step::{run_step, Step, StepContext, StepError, StepOutput};
pub use steps::{FnStep, ToolStep};
pub use toolbox::{CancelToken, Invocation, ToolEnvironment, ToolError, Toolbox};
pub use validation::{ConfigRule, Validator, ValidationViolation, ViolationSeverity};
pub use variables::{Value, Variable, VariableRegistry, VariableType};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
