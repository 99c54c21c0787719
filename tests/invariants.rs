//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees with in-process steps.

use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use asicflow_core::{
    Checkpoint, Config, ConfigError, ConfigResolver, DesignState, FailureClass, Flow, FlowEngine, FlowError, FnStep,
    RawConfig, RunOptions, StepError, StepOutput, StepStatus, ToolEnvironment, Toolbox, Variable, VariableType,
    ViewId,
};

fn engine() -> FlowEngine {
    FlowEngine::new(Toolbox::new(ToolEnvironment::new()))
}

/// A step that derives `produces` from its input and counts its executions.
fn derive(id: &'static str, from: ViewId, produces: ViewId, runs: Arc<AtomicUsize>) -> FnStep {
    FnStep::new(id, move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let input = ctx.input(id, from)?;
        let text = fs::read_to_string(input).map_err(|source| StepError::Io { step: id.to_string(), source })?;
        let out = ctx.step_file(&format!("{}.txt", produces));
        fs::write(&out, format!("{}\n{}", text, id)).map_err(|source| StepError::Io { step: id.to_string(), source })?;
        Ok(StepOutput::new().view(produces, out))
    })
    .reads(&[from])
    .produces(&[produces])
}

/// Like `derive`, but the output also depends on GAIN.
fn amplify(id: &'static str, from: ViewId, produces: ViewId, runs: Arc<AtomicUsize>) -> FnStep {
    FnStep::new(id, move |ctx| {
        runs.fetch_add(1, Ordering::SeqCst);
        let gain = ctx.config.get_f64("GAIN").unwrap_or(1.0);
        let input = ctx.input(id, from)?;
        let text = fs::read_to_string(input).map_err(|source| StepError::Io { step: id.to_string(), source })?;
        let out = ctx.step_file(&format!("{}.txt", produces));
        fs::write(&out, format!("{}\n{} x{}", text, id, gain))
            .map_err(|source| StepError::Io { step: id.to_string(), source })?;
        Ok(StepOutput::new().view(produces, out).metric("gain", gain))
    })
    .reads(&[from])
    .produces(&[produces])
    .consumes(&["GAIN"])
}

fn resolve(flow: &Flow, raw: RawConfig) -> Result<Config, asicflow_core::InvalidConfig> {
    let globals = vec![Variable::new("GAIN", VariableType::Number, "Gain.").default_value(json!(1))];
    let registry = flow.variable_registry(globals).unwrap();
    ConfigResolver::new(&registry).resolve(&raw)
}

fn netlist(dir: &std::path::Path) -> DesignState {
    let path = dir.join("top.v");
    fs::write(&path, "module top; endmodule").unwrap();
    DesignState::from_files([(ViewId::Netlist, path)]).unwrap()
}

#[test]
fn invariant_untouched_views_are_shared() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let flow = Flow::new("f", vec![Box::new(derive("Floorplan", ViewId::Netlist, ViewId::Floorplan, runs))]).unwrap();
    let config = resolve(&flow, RawConfig::new(dir.path())).unwrap();
    let initial = netlist(dir.path());

    let report = engine()
        .run(&flow, &config, initial.clone(), &RunOptions::new(dir.path().join("run")))
        .unwrap();

    assert!(report.state.shares_view(&initial, ViewId::Netlist));
    assert!(report.state.contains(ViewId::Floorplan));
    assert!(!initial.contains(ViewId::Floorplan));
    assert!(report.state.version() > initial.version());
}

#[test]
fn invariant_config_error_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let flow =
        Flow::new("f", vec![Box::new(derive("Floorplan", ViewId::Netlist, ViewId::Floorplan, runs.clone()))]).unwrap();

    let invalid = resolve(&flow, RawConfig::new(dir.path()).set("GAIN", json!("high"))).unwrap_err();
    assert!(matches!(invalid.errors[0], ConfigError::InvalidVariableType { ref name, .. } if name == "GAIN"));
    assert_eq!(FlowError::from(invalid).class(), FailureClass::Configuration);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn invariant_consumed_variable_drives_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let fp_runs = Arc::new(AtomicUsize::new(0));
    let pl_runs = Arc::new(AtomicUsize::new(0));
    let flow = Flow::new(
        "f",
        vec![
            Box::new(derive("Floorplan", ViewId::Netlist, ViewId::Floorplan, fp_runs.clone())),
            Box::new(amplify("Place", ViewId::Floorplan, ViewId::PlacedDef, pl_runs.clone())),
        ],
    )
    .unwrap();
    let options = RunOptions::new(dir.path().join("run"));
    let initial = netlist(dir.path());

    let config = resolve(&flow, RawConfig::new(dir.path()).set("GAIN", json!(2))).unwrap();
    engine().run(&flow, &config, initial.clone(), &options).unwrap();

    let config = resolve(&flow, RawConfig::new(dir.path()).set("GAIN", json!(3))).unwrap();
    let report = engine().run(&flow, &config, initial, &options).unwrap();

    assert_eq!(fp_runs.load(Ordering::SeqCst), 1);
    assert_eq!(pl_runs.load(Ordering::SeqCst), 2);
    assert_eq!(report.status_of("Floorplan"), Some(StepStatus::Skipped));
    assert_eq!(report.metrics.latest("gain"), Some(3.0));
}

#[test]
fn invariant_declared_outputs_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let lazy = FnStep::new("Lazy", |_| Ok(StepOutput::new()))
        .reads(&[ViewId::Netlist])
        .produces(&[ViewId::Floorplan]);
    let flow = Flow::new("f", vec![Box::new(lazy)]).unwrap();
    let config = resolve(&flow, RawConfig::new(dir.path())).unwrap();

    let failure = engine()
        .run(&flow, &config, netlist(dir.path()), &RunOptions::new(dir.path().join("run")))
        .unwrap_err();
    assert!(matches!(
        failure.error,
        FlowError::Step { source: StepError::MissingOutputView { view: ViewId::Floorplan, .. }, .. }
    ));
    assert_eq!(failure.error.exit_code(), 1);
}

#[test]
fn invariant_checkpoint_records_every_completed_step() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let flow = Flow::new(
        "f",
        vec![
            Box::new(derive("Floorplan", ViewId::Netlist, ViewId::Floorplan, runs.clone())),
            Box::new(derive("Place", ViewId::Floorplan, ViewId::PlacedDef, runs)),
        ],
    )
    .unwrap();
    let config = resolve(&flow, RawConfig::new(dir.path())).unwrap();
    let run_dir = dir.path().join("run");

    let report = engine().run(&flow, &config, netlist(dir.path()), &RunOptions::new(&run_dir)).unwrap();

    let checkpoint = Checkpoint::load(&run_dir).unwrap().unwrap();
    assert_eq!(checkpoint.run_id, report.run_id);
    assert_eq!(checkpoint.steps.len(), 2);
    assert_eq!(checkpoint.last_completed.unwrap().step_id, "Place");
    assert_eq!(checkpoint.state.content_digest(), report.state.content_digest());
    assert_eq!(
        checkpoint.steps["Place"].fingerprint,
        report.step("Place").and_then(|s| s.fingerprint.clone()).unwrap()
    );
    assert!(!run_dir.join(".lock").exists());
    assert!(run_dir.join("state_in.json").is_file());
    assert!(run_dir.join("resolved.json").is_file());
}

#[test]
fn invariant_duplicate_step_ids_rejected() {
    let runs = Arc::new(AtomicUsize::new(0));
    let err = Flow::new(
        "f",
        vec![
            Box::new(derive("Place", ViewId::Netlist, ViewId::Floorplan, runs.clone())),
            Box::new(derive("Place", ViewId::Floorplan, ViewId::PlacedDef, runs)),
        ],
    )
    .unwrap_err();
    assert!(matches!(err, FlowError::DuplicateStep(ref id) if id == "Place"));
}

#[test]
fn invariant_fingerprint_ignores_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let flow =
        Flow::new("f", vec![Box::new(derive("Floorplan", ViewId::Netlist, ViewId::Floorplan, runs.clone()))]).unwrap();
    let config = resolve(&flow, RawConfig::new(dir.path())).unwrap();
    let run_dir = dir.path().join("run");
    let initial = netlist(dir.path());

    engine()
        .run(&flow, &config, initial.clone(), &RunOptions::new(&run_dir))
        .unwrap();
    let report = engine()
        .run(&flow, &config, initial, &RunOptions::new(&run_dir).timeout(std::time::Duration::from_secs(5)))
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(report.status_of("Floorplan"), Some(StepStatus::Skipped));
}
