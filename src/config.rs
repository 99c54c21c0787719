//! Configuration - Loading, Resolution and the Immutable Config
//!
//! Resolution order per declared variable:
//! explicit override → process-specific default → global default.
//! A mandatory variable with none of the three is `MissingVariable`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::process::ProcessKit;
use crate::validation::Validator;
use crate::variables::{Value, VariableRegistry};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Missing required variable: {0}")]
    MissingVariable(String),

    #[error("Variable {name} expects {expected}, found {found}")]
    InvalidVariableType {
        name: String,
        expected: String,
        found: String,
    },

    #[error("Invalid value for {name}: {reason}")]
    InvalidVariableValue { name: String, reason: String },

    #[error("Incompatible configuration ({}): {reason}", .variables.join(", "))]
    IncompatibleConfiguration {
        variables: Vec<String>,
        reason: String,
    },

    #[error("Conflicting declarations of {name}: {reason}")]
    ConflictingDeclaration { name: String, reason: String },

    #[error("Malformed override '{0}', expected KEY=VALUE")]
    MalformedOverride(String),

    #[error("Cannot read configuration {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// Every error found while resolving, plus warnings.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {}", summarize(.errors))]
pub struct InvalidConfig {
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<String>,
}

fn summarize(errors: &[ConfigError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl InvalidConfig {
    pub fn single(error: ConfigError) -> Self {
        Self { errors: vec![error], warnings: vec![] }
    }
}

impl From<ConfigError> for InvalidConfig {
    fn from(error: ConfigError) -> Self {
        Self::single(error)
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Override,
    ProcessDefault,
    GlobalDefault,
}

/// Flow selection inside the `meta` object of a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowSpec {
    Named(String),
    Steps(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub flow: Option<FlowSpec>,
}

/// Unvalidated configuration as supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    pub values: BTreeMap<String, JsonValue>,
    pub meta: Meta,
    pub design_dir: PathBuf,
}

impl RawConfig {
    pub fn new(design_dir: impl Into<PathBuf>) -> Self {
        Self { design_dir: design_dir.into(), ..Self::default() }
    }

    pub fn set(mut self, name: &str, value: JsonValue) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Load a JSON config file. The design directory is the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |message: String| ConfigError::Unreadable { path: path.to_path_buf(), message };
        let content = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let parsed: JsonValue = serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))?;
        let JsonValue::Object(mut map) = parsed else {
            return Err(unreadable("top level must be a JSON object".to_string()));
        };

        let meta = match map.remove("meta") {
            Some(m) => serde_json::from_value(m).map_err(|e| unreadable(format!("meta: {}", e)))?,
            None => Meta::default(),
        };
        let design_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self { values: map.into_iter().collect(), meta, design_dir })
    }

    /// Apply `KEY=VALUE` overrides. VALUE is read as JSON, falling back to a
    /// plain string.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<(), ConfigError> {
        for item in overrides {
            let item = item.as_ref();
            let (key, value) = item
                .split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .ok_or_else(|| ConfigError::MalformedOverride(item.to_string()))?;
            let parsed = serde_json::from_str(value).unwrap_or_else(|_| JsonValue::String(value.to_string()));
            self.values.insert(key.trim().to_string(), parsed);
        }
        Ok(())
    }
}

/// Immutable, validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
    sources: BTreeMap<String, ValueSource>,
    design_dir: PathBuf,
}

impl Config {
    pub fn design_dir(&self) -> &Path {
        &self.design_dir
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn source(&self, name: &str) -> Option<ValueSource> {
        self.sources.get(name).copied()
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_path(&self, name: &str) -> Option<&Path> {
        self.get(name).and_then(Value::as_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// JSON object holding only `names`; unset names map to null so that
    /// setting a previously unset variable changes the subset.
    pub fn subset<S: AsRef<str>>(&self, names: &[S]) -> JsonValue {
        let mut map = Map::new();
        for name in names {
            let name = name.as_ref();
            let value = self
                .values
                .get(name)
                .and_then(|v| serde_json::to_value(v).ok())
                .unwrap_or(JsonValue::Null);
            map.insert(name.to_string(), value);
        }
        JsonValue::Object(map)
    }

    /// Full resolved configuration with value sources, for the run directory.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for (name, value) in &self.values {
            map.insert(
                name.clone(),
                serde_json::json!({
                    "value": value,
                    "source": self.sources.get(name),
                }),
            );
        }
        JsonValue::Object(map)
    }
}

/// Resolves a `RawConfig` against the variable registry.
pub struct ConfigResolver<'a> {
    registry: &'a VariableRegistry,
    kit: Option<(&'a ProcessKit, String)>,
    validator: Validator,
}

pub const PDK_VARIABLE: &str = "PDK";
pub const SCL_VARIABLE: &str = "STD_CELL_LIBRARY";

impl<'a> ConfigResolver<'a> {
    pub fn new(registry: &'a VariableRegistry) -> Self {
        Self { registry, kit: None, validator: Validator::new() }
    }

    /// Select the process kit. `scl` defaults to the kit's default library.
    pub fn with_kit(mut self, kit: &'a ProcessKit, scl: Option<&str>) -> Self {
        let scl = scl.map(str::to_string).unwrap_or_else(|| kit.default_scl.clone());
        self.kit = Some((kit, scl));
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    fn process_default(&self, name: &str) -> Option<JsonValue> {
        let (kit, scl) = self.kit.as_ref()?;
        match name {
            PDK_VARIABLE => Some(JsonValue::String(kit.name.clone())),
            SCL_VARIABLE => Some(JsonValue::String(scl.clone())),
            _ => kit.default_for(scl, name).cloned(),
        }
    }

    pub fn resolve(&self, raw: &RawConfig) -> Result<Config, InvalidConfig> {
        let mut errors = vec![];
        let mut warnings = vec![];
        let mut values = BTreeMap::new();
        let mut sources = BTreeMap::new();

        if let Some((kit, scl)) = &self.kit {
            if !kit.supports_scl(scl) {
                errors.push(ConfigError::InvalidVariableValue {
                    name: SCL_VARIABLE.to_string(),
                    reason: format!("'{}' is not a library of {}", scl, kit.name),
                });
            }
        }

        for name in raw.values.keys() {
            if !self.registry.contains(name) {
                warnings.push(format!("Unknown variable {} ignored", name));
            }
        }

        for var in self.registry.iter() {
            let candidate = match raw.values.get(&var.name) {
                Some(v) => Some((v.clone(), ValueSource::Override)),
                None => self
                    .process_default(&var.name)
                    .map(|v| (v, ValueSource::ProcessDefault))
                    .or_else(|| {
                        var.default
                            .clone()
                            .filter(|d| !d.is_null())
                            .map(|d| (d, ValueSource::GlobalDefault))
                    }),
            };

            match candidate {
                Some((JsonValue::Null, ValueSource::Override)) if var.required => {
                    errors.push(ConfigError::MissingVariable(var.name.clone()))
                }
                Some((JsonValue::Null, _)) => {}
                Some((raw_value, source)) => match var.coerce(&raw_value, &raw.design_dir) {
                    Ok(value) => {
                        values.insert(var.name.clone(), value);
                        sources.insert(var.name.clone(), source);
                    }
                    Err(e) => errors.push(e),
                },
                None if var.required => errors.push(ConfigError::MissingVariable(var.name.clone())),
                None => {}
            }
        }

        let config = Config { values, sources, design_dir: raw.design_dir.clone() };

        if errors.is_empty() {
            let (rule_errors, rule_warnings) = self.validator.validate(&config, self.registry);
            errors.extend(rule_errors);
            warnings.extend(rule_warnings);
        }

        if errors.is_empty() {
            for w in &warnings {
                tracing::warn!("{}", w);
            }
            Ok(config)
        } else {
            Err(InvalidConfig { errors, warnings })
        }
    }
}
