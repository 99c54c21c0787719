//! Process Kits - PDK/SCL specific default tables

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessKit {
    pub name: String,
    pub default_scl: String,
    pub scls: Vec<String>,
    /// Defaults shared by every library of the kit.
    #[serde(default)]
    pub defaults: BTreeMap<String, JsonValue>,
    /// Per-library defaults; win over `defaults`.
    #[serde(default)]
    pub scl_defaults: BTreeMap<String, BTreeMap<String, JsonValue>>,
}

impl ProcessKit {
    pub fn new(name: &str, default_scl: &str) -> Self {
        Self {
            name: name.to_string(),
            default_scl: default_scl.to_string(),
            scls: vec![default_scl.to_string()],
            defaults: BTreeMap::new(),
            scl_defaults: BTreeMap::new(),
        }
    }

    pub fn with_default(mut self, name: &str, value: JsonValue) -> Self {
        self.defaults.insert(name.to_string(), value);
        self
    }

    pub fn with_scl_default(mut self, scl: &str, name: &str, value: JsonValue) -> Self {
        if !self.scls.iter().any(|s| s == scl) {
            self.scls.push(scl.to_string());
        }
        self.scl_defaults
            .entry(scl.to_string())
            .or_default()
            .insert(name.to_string(), value);
        self
    }

    pub fn supports_scl(&self, scl: &str) -> bool {
        self.scls.iter().any(|s| s == scl)
    }

    /// Process-specific default for `name` under the given library.
    pub fn default_for(&self, scl: &str, name: &str) -> Option<&JsonValue> {
        self.scl_defaults
            .get(scl)
            .and_then(|table| table.get(name))
            .or_else(|| self.defaults.get(name))
    }
}

/// Registry of known process kits
#[derive(Debug, Clone, Default)]
pub struct KitRegistry {
    kits: BTreeMap<String, ProcessKit>,
}

impl KitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The kits shipped with the runner.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            ProcessKit::new("sky130A", "sky130_fd_sc_hd")
                .with_default("DEFAULT_CORNER", json!("nom_tt_025C_1v80"))
                .with_default("FP_IO_HLAYER", json!("met3"))
                .with_default("FP_IO_VLAYER", json!("met2"))
                .with_default("RT_MAX_LAYER", json!("met5"))
                .with_scl_default("sky130_fd_sc_hd", "PL_TARGET_DENSITY", json!(0.55))
                .with_scl_default("sky130_fd_sc_hd", "SYNTH_DRIVING_CELL", json!("sky130_fd_sc_hd__inv_2"))
                .with_scl_default("sky130_fd_sc_hs", "PL_TARGET_DENSITY", json!(0.6))
                .with_scl_default("sky130_fd_sc_hs", "SYNTH_DRIVING_CELL", json!("sky130_fd_sc_hs__inv_2")),
        );
        registry.register(
            ProcessKit::new("gf180mcuC", "gf180mcu_fd_sc_mcu7t5v0")
                .with_default("DEFAULT_CORNER", json!("nom_tt_025C_5v00"))
                .with_default("FP_IO_HLAYER", json!("Metal3"))
                .with_default("FP_IO_VLAYER", json!("Metal2"))
                .with_default("RT_MAX_LAYER", json!("Metal4"))
                .with_scl_default("gf180mcu_fd_sc_mcu7t5v0", "PL_TARGET_DENSITY", json!(0.5))
                .with_scl_default(
                    "gf180mcu_fd_sc_mcu7t5v0",
                    "SYNTH_DRIVING_CELL",
                    json!("gf180mcu_fd_sc_mcu7t5v0__inv_2"),
                ),
        );
        registry
    }

    pub fn register(&mut self, kit: ProcessKit) {
        self.kits.insert(kit.name.clone(), kit);
    }

    pub fn get(&self, name: &str) -> Option<&ProcessKit> {
        self.kits.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.kits.keys().map(String::as_str).collect()
    }
}
