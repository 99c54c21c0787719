//! Flow Engine Tests with Real Subprocesses
//!
//! Tools are tiny /bin/sh scripts, so these only run on Unix.
#![cfg(unix)]

use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use asicflow_core::{
    CancelToken, Config, ConfigResolver, DesignState, FailureClass, Flow, FlowEngine, FlowError, RawConfig,
    RunOptions, RunReport, StepError, StepStatus, ToolEnvironment, ToolError, ToolStep, Toolbox, Variable,
    VariableType, ViewId,
};

struct Bench {
    dir: tempfile::TempDir,
    engine: FlowEngine,
}

impl Bench {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();

        tool(&bin, "synth", r#"cat "$IN_NETLIST" > "$OUT_NETLIST"; echo "// mapped" >> "$OUT_NETLIST""#);
        tool(&bin, "floorplan", r#"echo "DIEAREA $(wc -l < "$IN_NETLIST")" > "$OUT_FLOORPLAN""#);
        tool(&bin, "place", r#"cat "$IN_FLOORPLAN" > "$OUT_PLACED_DEF"; echo "PERIOD $CLOCK_PERIOD" >> "$OUT_PLACED_DEF""#);
        tool(
            &bin,
            "route",
            r#"if [ -f "$FAIL_MARKER" ]; then echo "detailed routing failed"; exit 7; fi
cat "$IN_PLACED_DEF" > "$OUT_ROUTED_DEF"
echo '{"route__wirelength": 42, "route__drc_errors": 0}' > "$STEP_DIR/metrics.json""#,
        );
        tool(&bin, "hang", "sleep 30");
        tool(
            &bin,
            "chatty",
            r#"printf 'cellule \351largie\n'
i=0; while [ $i -lt 5000 ]; do echo "iteration $i"; i=$((i+1)); done
cat "$IN_NETLIST" > "$OUT_FLOORPLAN""#,
        );

        let env = ToolEnvironment::new()
            .with_dir(&bin)
            .with_dir("/bin")
            .with_dir("/usr/bin")
            .with_var("FAIL_MARKER", &dir.path().join("fail").display().to_string());
        fs::write(dir.path().join("spm.v"), "module spm(input clk);\nendmodule\n").unwrap();

        Self { dir, engine: FlowEngine::new(Toolbox::new(env)) }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn initial(&self) -> DesignState {
        DesignState::from_files([(ViewId::Netlist, self.path("spm.v"))]).unwrap()
    }

    fn config(&self, flow: &Flow, clock_period: f64) -> Config {
        let registry = flow.variable_registry(globals()).unwrap();
        let raw = RawConfig::new(self.dir.path()).set("CLOCK_PERIOD", json!(clock_period));
        ConfigResolver::new(&registry).resolve(&raw).unwrap()
    }

    fn run(&self, flow: &Flow, clock_period: f64, options: &RunOptions) -> Result<RunReport, asicflow_core::FlowFailure> {
        self.engine.run(flow, &self.config(flow, clock_period), self.initial(), options)
    }

    fn spawned(&self) -> usize {
        self.engine.toolbox().spawned()
    }
}

fn tool(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn globals() -> Vec<Variable> {
    vec![Variable::new("CLOCK_PERIOD", VariableType::Number, "Clock period in ns.").default_value(json!(10))]
}

fn pnr_flow() -> Flow {
    Flow::new(
        "PnR",
        vec![
            Box::new(ToolStep::new("Synthesize", "synth").input(ViewId::Netlist).output(ViewId::Netlist, "spm.nl.v")),
            Box::new(
                ToolStep::new("Floorplan", "floorplan")
                    .input(ViewId::Netlist)
                    .output(ViewId::Floorplan, "floorplan.def"),
            ),
            Box::new(
                ToolStep::new("Place", "place")
                    .consumes(&["CLOCK_PERIOD"])
                    .input(ViewId::Floorplan)
                    .output(ViewId::PlacedDef, "placed.def"),
            ),
            Box::new(
                ToolStep::new("Route", "route")
                    .consumes(&["CLOCK_PERIOD"])
                    .input(ViewId::PlacedDef)
                    .output(ViewId::RoutedDef, "routed.def"),
            ),
        ],
    )
    .unwrap()
}

#[test]
fn second_identical_run_skips_everything() {
    let bench = Bench::new();
    let flow = pnr_flow();
    let options = RunOptions::new(bench.path("runs/a"));

    let first = bench.run(&flow, 2.0, &options).unwrap();
    assert_eq!(first.steps_with(StepStatus::Succeeded).len(), 4);
    assert_eq!(bench.spawned(), 4);

    let second = bench.run(&flow, 2.0, &options).unwrap();
    assert!(second.resumed);
    assert_eq!(second.steps_with(StepStatus::Skipped), vec!["Synthesize", "Floorplan", "Place", "Route"]);
    assert_eq!(bench.spawned(), 4);
    assert_eq!(first.state.content_digest(), second.state.content_digest());
}

#[test]
fn clock_period_change_reruns_place_and_route_only() {
    let bench = Bench::new();
    let flow = pnr_flow();
    let options = RunOptions::new(bench.path("runs/a"));

    bench.run(&flow, 2.0, &options).unwrap();
    let rerun = bench.run(&flow, 2.5, &options).unwrap();

    assert_eq!(rerun.status_of("Synthesize"), Some(StepStatus::Skipped));
    assert_eq!(rerun.status_of("Floorplan"), Some(StepStatus::Skipped));
    assert_eq!(rerun.status_of("Place"), Some(StepStatus::Succeeded));
    assert_eq!(rerun.status_of("Route"), Some(StepStatus::Succeeded));
    assert_eq!(bench.spawned(), 6);

    let placed = fs::read_to_string(&rerun.state.get(ViewId::PlacedDef).unwrap().path).unwrap();
    assert!(placed.contains("PERIOD 2.5"));
}

#[test]
fn missing_input_is_reported_before_any_tool_runs() {
    let bench = Bench::new();
    let flow = Flow::new(
        "broken",
        vec![
            Box::new(ToolStep::new("Synthesize", "synth").input(ViewId::Netlist).output(ViewId::Netlist, "spm.nl.v")),
            Box::new(ToolStep::new("Route", "route").input(ViewId::PlacedDef).output(ViewId::RoutedDef, "routed.def")),
        ],
    )
    .unwrap();

    let failure = bench.run(&flow, 2.0, &RunOptions::new(bench.path("runs/a"))).unwrap_err();
    match &failure.error {
        FlowError::Step { step_id, source: StepError::MissingInputView { view, .. }, .. } => {
            assert_eq!(step_id, "Route");
            assert_eq!(*view, ViewId::PlacedDef);
        }
        other => panic!("expected MissingInputView, got {:?}", other),
    }
    assert_eq!(failure.error.exit_code(), 1);
    assert_eq!(bench.spawned(), 0);
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let bench = Bench::new();
    let flow = pnr_flow();

    let reference = bench.run(&flow, 2.0, &RunOptions::new(bench.path("runs/reference"))).unwrap();

    fs::write(bench.path("fail"), "").unwrap();
    let options = RunOptions::new(bench.path("runs/resumed"));
    let failure = bench.run(&flow, 2.0, &options).unwrap_err();

    match &failure.error {
        FlowError::Step { step_id, source: StepError::Tool(ToolError::ToolFailure { exit_code, tail, .. }), .. } => {
            assert_eq!(step_id, "Route");
            assert_eq!(*exit_code, Some(7));
            assert!(tail.iter().any(|l| l.contains("detailed routing failed")));
        }
        other => panic!("expected ToolFailure, got {:?}", other),
    }
    assert_eq!(failure.error.class(), FailureClass::Tool);
    let partial = failure.report.as_ref().unwrap();
    assert_eq!(partial.status_of("Place"), Some(StepStatus::Succeeded));
    assert_eq!(partial.status_of("Route"), Some(StepStatus::Failed));
    assert!(partial.state.contains(ViewId::PlacedDef));
    assert!(!partial.state.contains(ViewId::RoutedDef));
    assert!(bench.path("runs/resumed/state_out.json").is_file());

    fs::remove_file(bench.path("fail")).unwrap();
    let resumed = bench.run(&flow, 2.0, &options).unwrap();
    assert_eq!(resumed.steps_with(StepStatus::Skipped), vec!["Synthesize", "Floorplan", "Place"]);
    assert_eq!(resumed.steps_with(StepStatus::Succeeded), vec!["Route"]);
    assert_eq!(resumed.state.content_digest(), reference.state.content_digest());
}

#[test]
fn metrics_are_collected_and_reemitted_on_skip() {
    let bench = Bench::new();
    let flow = pnr_flow();
    let options = RunOptions::new(bench.path("runs/a"));

    let first = bench.run(&flow, 2.0, &options).unwrap();
    assert_eq!(first.metrics.latest("route__wirelength"), Some(42.0));
    assert!(bench.path("runs/a/metrics.json").is_file());
    assert!(bench.path("runs/a/04-route/route.log").is_file());

    let second = bench.run(&flow, 2.0, &options).unwrap();
    assert_eq!(second.metrics.len(), 4);
    assert_eq!(second.metrics.latest("route__drc_errors"), Some(0.0));
}

#[test]
fn tampered_output_forces_rerun() {
    let bench = Bench::new();
    let flow = pnr_flow();
    let options = RunOptions::new(bench.path("runs/a"));

    let first = bench.run(&flow, 2.0, &options).unwrap();
    fs::write(&first.state.get(ViewId::Floorplan).unwrap().path, "DIEAREA 0").unwrap();

    let second = bench.run(&flow, 2.0, &options).unwrap();
    assert_eq!(second.status_of("Synthesize"), Some(StepStatus::Skipped));
    assert_eq!(second.status_of("Floorplan"), Some(StepStatus::Succeeded));
    assert_eq!(second.state.content_digest(), first.state.content_digest());
}

#[test]
fn window_stops_and_restarts() {
    let bench = Bench::new();
    let flow = pnr_flow();

    let partial = bench
        .run(&flow, 2.0, &RunOptions::new(bench.path("runs/a")).to_step("Floorplan"))
        .unwrap();
    assert_eq!(partial.steps_with(StepStatus::Succeeded), vec!["Synthesize", "Floorplan"]);
    assert_eq!(partial.steps_with(StepStatus::Pending), vec!["Place", "Route"]);

    let rest = bench
        .run(&flow, 2.0, &RunOptions::new(bench.path("runs/a")).from_step("Floorplan"))
        .unwrap();
    assert_eq!(rest.status_of("Synthesize"), Some(StepStatus::Skipped));
    assert_eq!(rest.status_of("Floorplan"), Some(StepStatus::Succeeded));
    assert_eq!(rest.status_of("Route"), Some(StepStatus::Succeeded));
    assert_eq!(bench.spawned(), 5);
}

#[test]
fn window_needs_checkpointed_predecessors() {
    let bench = Bench::new();
    let flow = pnr_flow();

    let failure = bench
        .run(&flow, 2.0, &RunOptions::new(bench.path("runs/fresh")).from_step("Place"))
        .unwrap_err();
    assert!(matches!(failure.error, FlowError::NoCheckpointedOutput { ref step_id } if step_id == "Synthesize"));

    let failure = bench
        .run(&flow, 2.0, &RunOptions::new(bench.path("runs/fresh")).to_step("Signoff"))
        .unwrap_err();
    assert!(matches!(failure.error, FlowError::UnknownStep(ref id) if id == "Signoff"));
    assert_eq!(bench.spawned(), 0);
}

#[test]
fn timeout_kills_tool() {
    let bench = Bench::new();
    let flow = Flow::new(
        "slow",
        vec![Box::new(ToolStep::new("Hang", "hang").input(ViewId::Netlist).output(ViewId::Floorplan, "fp.def"))],
    )
    .unwrap();

    let options = RunOptions::new(bench.path("runs/a")).timeout(Duration::from_secs(1));
    let failure = bench.run(&flow, 2.0, &options).unwrap_err();
    assert_eq!(failure.error.class(), FailureClass::Timeout);
    assert_eq!(failure.error.exit_code(), 4);
}

#[test]
fn missing_tool_is_a_tool_failure() {
    let bench = Bench::new();
    let flow = Flow::new(
        "ghost",
        vec![Box::new(ToolStep::new("Sign", "klayout").input(ViewId::Netlist).output(ViewId::Gds, "out.gds"))],
    )
    .unwrap();

    let failure = bench.run(&flow, 2.0, &RunOptions::new(bench.path("runs/a"))).unwrap_err();
    assert!(matches!(
        failure.error,
        FlowError::Step { source: StepError::Tool(ToolError::ToolNotFound { .. }), .. }
    ));
    assert_eq!(failure.error.exit_code(), 3);
}

#[test]
fn cancelled_before_start_spawns_nothing() {
    let bench = Bench::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let options = RunOptions::new(bench.path("runs/a")).cancel_token(cancel);
    let failure = bench.run(&pnr_flow(), 2.0, &options).unwrap_err();
    assert!(matches!(failure.error, FlowError::Cancelled { .. }));
    assert_eq!(failure.error.exit_code(), 130);
    assert_eq!(bench.spawned(), 0);
}

#[test]
fn locked_run_directory_is_refused() {
    let bench = Bench::new();
    let run_dir = bench.path("runs/a");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(run_dir.join(".lock"), "pid=1").unwrap();

    let failure = bench.run(&pnr_flow(), 2.0, &RunOptions::new(&run_dir)).unwrap_err();
    assert!(matches!(
        failure.error,
        FlowError::Checkpoint(asicflow_core::CheckpointError::RunDirectoryLocked(_))
    ));
    assert_eq!(bench.spawned(), 0);
}

#[test]
fn rerun_continues_past_unchanged_outputs() {
    let bench = Bench::new();
    // Floorplan reads CLOCK_PERIOD but its output does not depend on it
    let flow = Flow::new(
        "PnR",
        vec![
            Box::new(ToolStep::new("Synthesize", "synth").input(ViewId::Netlist).output(ViewId::Netlist, "spm.nl.v")),
            Box::new(
                ToolStep::new("Floorplan", "floorplan")
                    .consumes(&["CLOCK_PERIOD"])
                    .input(ViewId::Netlist)
                    .output(ViewId::Floorplan, "floorplan.def"),
            ),
            Box::new(ToolStep::new("Place", "place").input(ViewId::Floorplan).output(ViewId::PlacedDef, "placed.def")),
        ],
    )
    .unwrap();
    let options = RunOptions::new(bench.path("runs/a"));

    let first = bench.run(&flow, 2.0, &options).unwrap();
    let second = bench.run(&flow, 2.5, &options).unwrap();

    assert_eq!(second.status_of("Synthesize"), Some(StepStatus::Skipped));
    assert_eq!(second.status_of("Floorplan"), Some(StepStatus::Succeeded));
    assert_eq!(second.status_of("Place"), Some(StepStatus::Succeeded));
    assert_eq!(first.step("Place").unwrap().fingerprint, second.step("Place").unwrap().fingerprint);
    assert_eq!(bench.spawned(), 5);
}

#[test]
fn killed_run_resumes_over_its_lock() {
    let bench = Bench::new();
    let flow = pnr_flow();
    let reference = bench.run(&flow, 2.0, &RunOptions::new(bench.path("runs/reference"))).unwrap();

    let run_dir = bench.path("runs/killed");
    bench.run(&flow, 2.0, &RunOptions::new(&run_dir).to_step("Place")).unwrap();

    // leftovers of a process killed while routing
    let mut gone = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = gone.id();
    gone.wait().unwrap();
    fs::write(run_dir.join(".lock"), format!("pid={} run=killed\n", dead_pid)).unwrap();
    fs::create_dir_all(run_dir.join("04-route")).unwrap();
    fs::write(run_dir.join("04-route/routed.def"), "half written").unwrap();

    let resumed = bench.run(&flow, 2.0, &RunOptions::new(&run_dir)).unwrap();
    assert_eq!(resumed.steps_with(StepStatus::Skipped), vec!["Synthesize", "Floorplan", "Place"]);
    assert_eq!(resumed.steps_with(StepStatus::Succeeded), vec!["Route"]);
    assert_eq!(resumed.state.content_digest(), reference.state.content_digest());
    assert!(!run_dir.join(".lock").exists());
}

#[test]
fn non_utf8_tool_output_is_logged() {
    let bench = Bench::new();
    let flow = Flow::new(
        "noisy",
        vec![Box::new(
            ToolStep::new("Floorplan", "chatty").input(ViewId::Netlist).output(ViewId::Floorplan, "floorplan.def"),
        )],
    )
    .unwrap();

    let report = bench.run(&flow, 2.0, &RunOptions::new(bench.path("runs/a"))).unwrap();
    assert_eq!(report.status_of("Floorplan"), Some(StepStatus::Succeeded));
    assert!(report.state.contains(ViewId::Floorplan));

    let log = fs::read_to_string(bench.path("runs/a/01-floorplan/floorplan.log")).unwrap();
    assert!(log.starts_with("cellule \u{FFFD}largie\n"));
    assert!(log.contains("iteration 4999"));
}

#[test]
fn cancel_during_tool_kills_it() {
    let bench = Bench::new();
    let flow = Flow::new(
        "slow",
        vec![Box::new(ToolStep::new("Hang", "hang").input(ViewId::Netlist).output(ViewId::Floorplan, "fp.def"))],
    )
    .unwrap();
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        remote.cancel();
    });

    let started = Instant::now();
    let failure = bench
        .run(&flow, 2.0, &RunOptions::new(bench.path("runs/a")).cancel_token(cancel))
        .unwrap_err();
    interrupter.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        failure.error,
        FlowError::Step { source: StepError::Tool(ToolError::Cancelled { .. }), .. }
    ));
    assert_eq!(failure.error.exit_code(), 130);
    assert_eq!(failure.report.unwrap().status_of("Hang"), Some(StepStatus::Failed));
    assert_eq!(bench.spawned(), 1);
}
