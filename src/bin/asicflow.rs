//! asicflow CLI - run a flow over a design configuration
//!
//! Logs go to stderr (RUST_LOG, default info); the run summary is printed as
//! JSON to stdout. The exit code encodes the failure class.

use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use asicflow_core::catalog::{build_custom, CLASSIC_FLOW};
use asicflow_core::config::FlowSpec;
use asicflow_core::flow::{default_run_tag, latest_run};
use asicflow_core::{
    builtin_validator, global_variables, CancelToken, ConfigResolver, DesignState, FailureClass, Flow,
    FlowEngine, FlowError, FlowRegistry, InvalidConfig, KitRegistry, RawConfig, RunOptions, StepRegistry,
    ToolEnvironment, Toolbox, ViewId,
};

#[derive(Parser)]
#[command(name = "asicflow")]
#[command(about = "asicflow - ASIC Flow Runner", version)]
struct Cli {
    /// Process design kit to use
    #[arg(long, default_value = "sky130A")]
    pdk: String,

    /// Standard cell library to use (defaults to the kit's own)
    #[arg(long)]
    scl: Option<String>,

    /// Flow to run; overrides meta.flow in the configuration
    #[arg(short, long)]
    flow: Option<String>,

    /// Directory the process kits are installed in (falls back to $PDK_ROOT)
    #[arg(long)]
    pdk_root: Option<PathBuf>,

    /// Name of the run directory under <design_dir>/runs
    #[arg(long, conflicts_with = "last_run")]
    run_tag: Option<String>,

    /// Reuse the most recently modified run directory
    #[arg(long)]
    last_run: bool,

    /// Start from this step, reusing checkpointed outputs of earlier steps
    #[arg(short = 'F', long = "from")]
    from: Option<String>,

    /// Stop after this step
    #[arg(short = 'T', long = "to")]
    to: Option<String>,

    /// JSON design state manifest to start from
    #[arg(short = 'I', long)]
    with_initial_state: Option<PathBuf>,

    /// Override a configuration variable, KEY=VALUE (VALUE read as JSON)
    #[arg(short = 'c', long = "override-config")]
    overrides: Vec<String>,

    /// Directory to search for tools; repeatable, searched in order
    #[arg(long = "tool-dir")]
    tool_dirs: Vec<PathBuf>,

    /// Also search the inherited PATH for tools
    #[arg(long)]
    inherit_path: bool,

    /// Per-invocation tool timeout in seconds
    #[arg(long, default_value_t = 3600)]
    timeout: u64,

    /// Design configuration file (JSON)
    config_file: PathBuf,
}

/// A CLI failure: a message and the class it exits with.
struct Failure {
    class: FailureClass,
    message: String,
}

impl Failure {
    fn config(message: impl Into<String>) -> Self {
        Self { class: FailureClass::Configuration, message: message.into() }
    }
}

impl From<FlowError> for Failure {
    fn from(e: FlowError) -> Self {
        Self { class: e.class(), message: e.to_string() }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(f) => {
            if !f.message.is_empty() {
                eprintln!("error: {}", f.message);
            }
            ExitCode::from(f.class.exit_code())
        }
    }
}

fn run(cli: Cli) -> Result<(), Failure> {
    let mut raw = RawConfig::load(&cli.config_file).map_err(|e| Failure::config(e.to_string()))?;
    let flow = select_flow(cli.flow.as_deref(), raw.meta.flow.as_ref())?;

    let registry = flow
        .variable_registry(global_variables())
        .map_err(|e| Failure::config(e.to_string()))?;
    if registry.contains("PDK_ROOT") {
        if let Some(root) = &cli.pdk_root {
            raw.values.insert("PDK_ROOT".to_string(), json!(root.display().to_string()));
        } else if let Some(root) = std::env::var_os("PDK_ROOT") {
            raw.values
                .entry("PDK_ROOT".to_string())
                .or_insert_with(|| json!(PathBuf::from(root).display().to_string()));
        }
    }
    raw.apply_overrides(&cli.overrides).map_err(|e| Failure::config(e.to_string()))?;
    let kits = KitRegistry::builtin();
    let kit = kits.get(&cli.pdk).ok_or_else(|| {
        Failure::config(format!("unknown process kit '{}', known kits: {}", cli.pdk, kits.names().join(", ")))
    })?;
    let config = ConfigResolver::new(&registry)
        .with_kit(kit, cli.scl.as_deref())
        .with_validator(builtin_validator())
        .resolve(&raw)
        .map_err(report_invalid)?;

    let initial = match &cli.with_initial_state {
        Some(path) => DesignState::load(path)
            .map_err(|e| Failure::config(format!("cannot read initial state {}: {}", path.display(), e)))?,
        None => initial_state(config.get_path("DESIGN_NETLIST"), config.get_path("DESIGN_SDC"))?,
    };

    let runs_dir = config.design_dir().join("runs");
    let run_dir = if cli.last_run {
        latest_run(&runs_dir)
            .ok_or_else(|| Failure::config(format!("--last-run given but {} holds no runs", runs_dir.display())))?
    } else {
        let tag = cli.run_tag.clone().unwrap_or_else(|| default_run_tag(chrono::Utc::now()));
        runs_dir.join(tag)
    };

    let mut env = ToolEnvironment::new();
    for dir in &cli.tool_dirs {
        env = env.with_dir(dir);
    }
    if cli.inherit_path {
        env = env.inheriting_path();
    }

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let mut options = RunOptions::new(run_dir)
        .timeout(Duration::from_secs(cli.timeout))
        .cancel_token(cancel);
    options.from = cli.from.clone();
    options.to = cli.to.clone();

    let engine = FlowEngine::new(Toolbox::new(env));
    match engine.run(&flow, &config, initial, &options) {
        Ok(report) => {
            print_summary(&json!({
                "success": true,
                "run_dir": report.run_dir,
                "status": report.status,
                "steps": report.steps,
                "metrics": report.metrics,
            }));
            Ok(())
        }
        Err(failure) => {
            let class = failure.error.class();
            if let Some(report) = &failure.report {
                print_summary(&json!({
                    "success": false,
                    "error": failure.error.to_string(),
                    "run_dir": report.run_dir,
                    "status": report.status,
                    "steps": report.steps,
                    "metrics": report.metrics,
                }));
            }
            Err(Failure { class, message: failure.error.to_string() })
        }
    }
}

fn select_flow(cli_flow: Option<&str>, meta_flow: Option<&FlowSpec>) -> Result<Flow, Failure> {
    let steps = StepRegistry::builtin();
    let flows = FlowRegistry::builtin();
    let flow = match (cli_flow, meta_flow) {
        (Some(name), _) => flows.build(name, &steps),
        (None, Some(FlowSpec::Named(name))) => flows.build(name, &steps),
        (None, Some(FlowSpec::Steps(ids))) => build_custom("Custom", ids, &steps),
        (None, None) => flows.build(CLASSIC_FLOW, &steps),
    };
    flow.map_err(|e| match e {
        FlowError::UnknownFlow { .. } | FlowError::UnknownStep(_) => Failure::config(e.to_string()),
        other => Failure::from(other),
    })
}

fn initial_state(netlist: Option<&Path>, sdc: Option<&Path>) -> Result<DesignState, Failure> {
    let netlist = netlist.ok_or_else(|| Failure::config("DESIGN_NETLIST must be set without --with-initial-state"))?;
    let mut files = vec![(ViewId::Netlist, netlist.to_path_buf())];
    if let Some(sdc) = sdc {
        files.push((ViewId::Sdc, sdc.to_path_buf()));
    }
    DesignState::from_files(files).map_err(|e| Failure::config(format!("cannot read design inputs: {}", e)))
}

fn report_invalid(invalid: InvalidConfig) -> Failure {
    for error in &invalid.errors {
        eprintln!("[ERROR] {}", error);
    }
    for warning in &invalid.warnings {
        eprintln!("[WARNING] {}", warning);
    }
    Failure::config(format!("{} configuration error(s)", invalid.errors.len()))
}

fn install_interrupt_handler(cancel: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!(error = %e, "interrupt handler unavailable");
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("interrupt received, cancelling run (interrupt again to exit now)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("error: interrupted twice, exiting");
                std::process::exit(i32::from(FailureClass::Cancelled.exit_code()));
            }
        });
    });
}

fn print_summary(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => tracing::warn!(error = %e, "could not render run summary"),
    }
}
