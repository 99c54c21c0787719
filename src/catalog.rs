//! Built-in Catalog - global variables, tool steps and named flows

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::flow::{Flow, FlowError};
use crate::state::ViewId;
use crate::step::Step;
use crate::steps::ToolStep;
use crate::validation::{ListLengthRule, RequiredWhenRule, Validator};
use crate::variables::{Variable, VariableType};

pub const CLASSIC_FLOW: &str = "Classic";
pub const PROTOTYPE_FLOW: &str = "Prototype";

/// Variables every flow understands, independent of its steps.
pub fn global_variables() -> Vec<Variable> {
    vec![
        Variable::new("DESIGN_NAME", VariableType::String, "Name of the top level module.").required(),
        Variable::new("DESIGN_NETLIST", VariableType::Path, "Input Verilog netlist of the design."),
        Variable::new("DESIGN_SDC", VariableType::Path, "Timing constraints of the design."),
        Variable::new("PDK", VariableType::String, "Process design kit in use.").required(),
        Variable::new("STD_CELL_LIBRARY", VariableType::String, "Standard cell library in use.").required(),
        Variable::new("CLOCK_PERIOD", VariableType::Number, "Clock period in nanoseconds.")
            .default_value(json!(10.0))
            .at_least(0.0),
        Variable::new("CLOCK_PORT", VariableType::String, "Name of the clock input port.")
            .default_value(json!("clk")),
        Variable::new("DEFAULT_CORNER", VariableType::String, "Timing corner used by default."),
        Variable::new("SCRIPTS_DIR", VariableType::Path, "Directory holding the tool scripts; the built-in steps need it."),
    ]
}

/// Cross-variable rules of the built-in steps.
pub fn builtin_validator() -> Validator {
    Validator::new()
        .with_rule(Box::new(RequiredWhenRule::new("DIE_AREA", "FP_SIZING", "absolute")))
        .with_rule(Box::new(ListLengthRule { variable: "DIE_AREA".to_string(), len: 4 }))
}

fn openroad(id: &str, script: &str) -> ToolStep {
    ToolStep::new(id, "openroad")
        .args(["-exit", "-no_init"])
        .args([format!("{{var:SCRIPTS_DIR}}/openroad/{}", script)])
        .consumes(&["DESIGN_NAME", "PDK", "STD_CELL_LIBRARY", "SCRIPTS_DIR"])
}

pub fn synthesis() -> ToolStep {
    ToolStep::new("Yosys.Synthesis", "yosys")
        .args(["-c", "{var:SCRIPTS_DIR}/yosys/synthesize.tcl"])
        .consumes(&["DESIGN_NAME", "PDK", "STD_CELL_LIBRARY", "SCRIPTS_DIR"])
        .declare(
            Variable::new("SYNTH_STRATEGY", VariableType::choice(&["AREA 0", "AREA 1", "DELAY 0", "DELAY 1"]), "ABC strategy.")
                .default_value(json!("AREA 0")),
        )
        .declare(Variable::new("SYNTH_DRIVING_CELL", VariableType::String, "Cell assumed to drive the inputs."))
        .input(ViewId::Netlist)
        .output(ViewId::Netlist, "synthesized.nl.v")
}

pub fn floorplan() -> ToolStep {
    openroad("OpenROAD.Floorplan", "floorplan.tcl")
        .declare(
            Variable::new("FP_SIZING", VariableType::choice(&["relative", "absolute"]), "How the die is sized.")
                .default_value(json!("relative")),
        )
        .declare(
            Variable::new("FP_CORE_UTIL", VariableType::Number, "Core utilization in percent.")
                .default_value(json!(50))
                .range(1.0, 99.0)
                .only_when("FP_SIZING", "relative"),
        )
        .declare(
            Variable::new("DIE_AREA", VariableType::list_of(VariableType::Number), "Die box as x0 y0 x1 y1 in microns.")
                .at_least(0.0)
                .only_when("FP_SIZING", "absolute"),
        )
        .declare(
            Variable::new("FP_ASPECT_RATIO", VariableType::Number, "Core height over width.")
                .default_value(json!(1))
                .at_least(0.0),
        )
        .declare(Variable::new("FP_IO_HLAYER", VariableType::String, "Layer of horizontal IO pins."))
        .declare(Variable::new("FP_IO_VLAYER", VariableType::String, "Layer of vertical IO pins."))
        .input(ViewId::Netlist)
        .output(ViewId::Floorplan, "floorplan.def")
}

pub fn placement() -> ToolStep {
    openroad("OpenROAD.Placement", "placement.tcl")
        .consumes(&["CLOCK_PERIOD", "CLOCK_PORT"])
        .declare(
            Variable::new("PL_TARGET_DENSITY", VariableType::Number, "Global placement target density.")
                .default_value(json!(0.5))
                .range(0.0, 1.0),
        )
        .input(ViewId::Floorplan)
        .output(ViewId::PlacedDef, "placed.def")
}

pub fn cts() -> ToolStep {
    openroad("OpenROAD.CTS", "cts.tcl")
        .consumes(&["CLOCK_PERIOD", "CLOCK_PORT"])
        .declare(
            Variable::new("CTS_TARGET_SKEW", VariableType::Number, "Target clock skew in nanoseconds.")
                .default_value(json!(0.2))
                .at_least(0.0),
        )
        .input(ViewId::PlacedDef)
        .output(ViewId::PlacedDef, "cts.def")
}

pub fn routing() -> ToolStep {
    openroad("OpenROAD.Routing", "routing.tcl")
        .consumes(&["CLOCK_PERIOD"])
        .declare(
            Variable::new("GRT_ADJUSTMENT", VariableType::Number, "Global routing capacity reduction.")
                .default_value(json!(0.3))
                .range(0.0, 1.0),
        )
        .declare(Variable::new("RT_MAX_LAYER", VariableType::String, "Highest routing layer."))
        .input(ViewId::PlacedDef)
        .output(ViewId::RoutedDef, "routed.def")
}

pub fn rcx() -> ToolStep {
    openroad("OpenROAD.RCX", "rcx.tcl")
        .consumes(&["DEFAULT_CORNER"])
        .input(ViewId::RoutedDef)
        .output(ViewId::Spef, "design.spef")
}

pub fn sta() -> ToolStep {
    openroad("OpenROAD.STA", "sta.tcl")
        .consumes(&["CLOCK_PERIOD", "CLOCK_PORT", "DEFAULT_CORNER"])
        .input(ViewId::Netlist)
        .input(ViewId::Spef)
        .output(ViewId::TimingReport, "sta.rpt")
        .output(ViewId::PowerReport, "power.rpt")
}

pub fn stream_out() -> ToolStep {
    ToolStep::new("Magic.StreamOut", "magic")
        .args([
            "-dnull",
            "-noconsole",
            "-rcfile",
            "{var:PDK_ROOT}/{var:PDK}/libs.tech/magic/{var:PDK}.magicrc",
            "{var:SCRIPTS_DIR}/magic/stream_out.tcl",
        ])
        .consumes(&["DESIGN_NAME", "PDK", "SCRIPTS_DIR"])
        .declare(Variable::new("PDK_ROOT", VariableType::Path, "Directory the process kits are installed in.").required())
        .input(ViewId::RoutedDef)
        .output(ViewId::Gds, "design.gds")
}

type StepFactory = Arc<dyn Fn() -> Box<dyn Step> + Send + Sync>;

/// Step constructors by id.
#[derive(Clone, Default)]
pub struct StepRegistry {
    factories: BTreeMap<String, StepFactory>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("Yosys.Synthesis", || Box::new(synthesis()));
        registry.register("OpenROAD.Floorplan", || Box::new(floorplan()));
        registry.register("OpenROAD.Placement", || Box::new(placement()));
        registry.register("OpenROAD.CTS", || Box::new(cts()));
        registry.register("OpenROAD.Routing", || Box::new(routing()));
        registry.register("OpenROAD.RCX", || Box::new(rcx()));
        registry.register("OpenROAD.STA", || Box::new(sta()));
        registry.register("Magic.StreamOut", || Box::new(stream_out()));
        registry
    }

    /// Register (or replace) the constructor for `id`.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn() -> Box<dyn Step> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn create(&self, id: &str) -> Result<Box<dyn Step>, FlowError> {
        self.factories
            .get(id)
            .map(|f| f())
            .ok_or_else(|| FlowError::UnknownStep(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Named flows as ordered step id lists.
#[derive(Debug, Clone, Default)]
pub struct FlowRegistry {
    flows: BTreeMap<String, Vec<String>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            CLASSIC_FLOW,
            &[
                "Yosys.Synthesis",
                "OpenROAD.Floorplan",
                "OpenROAD.Placement",
                "OpenROAD.CTS",
                "OpenROAD.Routing",
                "OpenROAD.RCX",
                "OpenROAD.STA",
                "Magic.StreamOut",
            ],
        );
        registry.register(
            PROTOTYPE_FLOW,
            &["Yosys.Synthesis", "OpenROAD.Floorplan", "OpenROAD.Placement", "OpenROAD.Routing"],
        );
        registry
    }

    pub fn register(&mut self, name: &str, step_ids: &[&str]) {
        self.flows
            .insert(name.to_string(), step_ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn names(&self) -> Vec<&str> {
        self.flows.keys().map(String::as_str).collect()
    }

    /// Instantiate the named flow.
    pub fn build(&self, name: &str, steps: &StepRegistry) -> Result<Flow, FlowError> {
        let ids = self.flows.get(name).ok_or_else(|| FlowError::UnknownFlow {
            name: name.to_string(),
            known: self.names().into_iter().map(String::from).collect(),
        })?;
        build_custom(name, ids, steps)
    }
}

/// Instantiate a flow from an explicit list of step ids.
pub fn build_custom<S: AsRef<str>>(name: &str, ids: &[S], steps: &StepRegistry) -> Result<Flow, FlowError> {
    let steps = ids
        .iter()
        .map(|id| steps.create(id.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    Flow::new(name, steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigError, ConfigResolver, RawConfig};
    use crate::process::KitRegistry;
    use crate::state::{Artifact, DesignState};

    fn netlist_only() -> DesignState {
        DesignState::new().with_views([(ViewId::Netlist, Artifact { path: "top.v".into(), hash: "0".into() })])
    }

    #[test]
    fn test_builtin_flows_are_well_ordered() {
        let steps = StepRegistry::builtin();
        let flows = FlowRegistry::builtin();
        for name in flows.names() {
            let flow = flows.build(name, &steps).unwrap();
            flow.check_order(&netlist_only()).unwrap();
        }
    }

    #[test]
    fn test_declarations_are_consistent() {
        let flow = FlowRegistry::builtin().build(CLASSIC_FLOW, &StepRegistry::builtin()).unwrap();
        let registry = flow.variable_registry(global_variables()).unwrap();
        assert!(registry.contains("PL_TARGET_DENSITY"));
        assert!(registry.contains("CLOCK_PERIOD"));
    }

    #[test]
    fn test_unknown_flow_lists_known() {
        let err = FlowRegistry::builtin().build("Turbo", &StepRegistry::builtin()).unwrap_err();
        match err {
            FlowError::UnknownFlow { known, .. } => assert_eq!(known, vec![CLASSIC_FLOW, PROTOTYPE_FLOW]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_custom_flow_with_unknown_step() {
        let err = build_custom("mine", &["Yosys.Synthesis", "KLayout.DRC"], &StepRegistry::builtin()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownStep(id) if id == "KLayout.DRC"));
    }

    #[test]
    fn test_absolute_sizing_needs_die_area() {
        let flow = FlowRegistry::builtin().build(PROTOTYPE_FLOW, &StepRegistry::builtin()).unwrap();
        let registry = flow.variable_registry(global_variables()).unwrap();
        let kits = KitRegistry::builtin();
        let kit = kits.get("sky130A").unwrap();
        let resolver = ConfigResolver::new(&registry)
            .with_kit(kit, None)
            .with_validator(builtin_validator());

        let raw = RawConfig::new("/design")
            .set("DESIGN_NAME", json!("spm"))
            .set("FP_SIZING", json!("absolute"));
        let err = resolver.resolve(&raw).unwrap_err();
        assert!(err
            .errors
            .iter()
            .any(|e| matches!(e, ConfigError::IncompatibleConfiguration { variables, .. } if variables.contains(&"DIE_AREA".to_string()))));

        let raw = raw.set("DIE_AREA", json!([0, 0, 100]));
        assert!(resolver.resolve(&raw).is_err());

        let raw = RawConfig::new("/design")
            .set("DESIGN_NAME", json!("spm"))
            .set("FP_SIZING", json!("absolute"))
            .set("DIE_AREA", json!([0, 0, 100, 100]));
        let config = resolver.resolve(&raw).unwrap();
        assert_eq!(config.get_f64("PL_TARGET_DENSITY"), Some(0.55));
    }
}
