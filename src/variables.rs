//! Variable Schema - Typed Declarations and the Registry
//!
//! Every configuration variable is declared once, with one type. Steps bring
//! their own declarations; the registry merges them with the global ones and
//! refuses incompatible redefinitions.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Bool,
    Path,
    Enum { choices: Vec<String> },
    List { of: Box<VariableType> },
}

impl VariableType {
    pub fn choice(choices: &[&str]) -> Self {
        VariableType::Enum { choices: choices.iter().map(|c| c.to_string()).collect() }
    }

    pub fn list_of(inner: VariableType) -> Self {
        VariableType::List { of: Box::new(inner) }
    }

    /// Coerce a raw JSON value. Relative paths resolve against `base_dir`.
    pub fn coerce(&self, raw: &JsonValue, base_dir: &Path) -> Result<Value, CoerceError> {
        match self {
            VariableType::String => match raw {
                JsonValue::String(s) => Ok(Value::String(s.clone())),
                JsonValue::Number(n) => Ok(Value::String(n.to_string())),
                JsonValue::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(CoerceError::Type),
            },
            VariableType::Number => {
                let n = match raw {
                    JsonValue::Number(n) => n.as_f64().ok_or(CoerceError::Type)?,
                    JsonValue::String(s) => s.trim().parse::<f64>().map_err(|_| CoerceError::Type)?,
                    _ => return Err(CoerceError::Type),
                };
                if !n.is_finite() {
                    return Err(CoerceError::Value(format!("{} is not a finite number", n)));
                }
                Ok(Value::Number(n))
            }
            VariableType::Bool => match raw {
                JsonValue::Bool(b) => Ok(Value::Bool(*b)),
                JsonValue::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(CoerceError::Type),
                },
                JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(CoerceError::Type),
                },
                _ => Err(CoerceError::Type),
            },
            VariableType::Path => match raw {
                JsonValue::String(s) => {
                    let p = PathBuf::from(s);
                    let resolved = if p.is_absolute() { p } else { base_dir.join(p) };
                    if resolved.exists() {
                        Ok(Value::Path(resolved))
                    } else {
                        Err(CoerceError::Value(format!("path '{}' does not exist", resolved.display())))
                    }
                }
                _ => Err(CoerceError::Type),
            },
            VariableType::Enum { choices } => match raw {
                JsonValue::String(s) if choices.iter().any(|c| c == s) => Ok(Value::Choice(s.clone())),
                JsonValue::String(s) => Err(CoerceError::Value(format!(
                    "'{}' is not one of [{}]",
                    s,
                    choices.join(", ")
                ))),
                _ => Err(CoerceError::Type),
            },
            VariableType::List { of } => {
                let items: Vec<JsonValue> = match raw {
                    JsonValue::Array(arr) => arr.clone(),
                    JsonValue::String(s) => s
                        .split(|c: char| c.is_whitespace() || c == ',')
                        .filter(|t| !t.is_empty())
                        .map(|t| JsonValue::String(t.to_string()))
                        .collect(),
                    _ => return Err(CoerceError::Type),
                };
                let coerced = items
                    .iter()
                    .map(|item| of.coerce(item, base_dir))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(coerced))
            }
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableType::String => write!(f, "string"),
            VariableType::Number => write!(f, "number"),
            VariableType::Bool => write!(f, "bool"),
            VariableType::Path => write!(f, "path"),
            VariableType::Enum { choices } => write!(f, "enum[{}]", choices.join("|")),
            VariableType::List { of } => write!(f, "list<{}>", of),
        }
    }
}

/// Coercion failure, before the variable name is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum CoerceError {
    Type,
    Value(String),
}

/// A resolved, typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Path(PathBuf),
    Choice(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Choice(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Textual form used on tool command lines and in environments.
    pub fn render(&self) -> String {
        match self {
            Value::String(s) | Value::Choice(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
            Value::Path(p) => p.display().to_string(),
            Value::List(items) => items.iter().map(Value::render).collect::<Vec<_>>().join(" "),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Companion condition: the variable only makes sense when `variable`
/// resolves to `equals`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub variable: String,
    pub equals: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: VariableType,
    pub description: String,
    #[serde(default)]
    pub default: Option<JsonValue>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub only_when: Option<Condition>,
}

impl Variable {
    pub fn new(name: &str, ty: VariableType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            ty,
            description: description.to_string(),
            default: None,
            required: false,
            min: None,
            max: None,
            only_when: None,
        }
    }

    pub fn default_value(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn at_least(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn only_when(mut self, variable: &str, equals: &str) -> Self {
        self.only_when = Some(Condition {
            variable: variable.to_string(),
            equals: equals.to_string(),
        });
        self
    }

    /// Coerce and bound-check a raw value for this variable.
    pub fn coerce(&self, raw: &JsonValue, base_dir: &Path) -> Result<Value, ConfigError> {
        let value = self.ty.coerce(raw, base_dir).map_err(|e| match e {
            CoerceError::Type => ConfigError::InvalidVariableType {
                name: self.name.clone(),
                expected: self.ty.to_string(),
                found: json_kind(raw).to_string(),
            },
            CoerceError::Value(reason) => ConfigError::InvalidVariableValue {
                name: self.name.clone(),
                reason,
            },
        })?;
        self.check_bounds(&value)?;
        Ok(value)
    }

    fn check_bounds(&self, value: &Value) -> Result<(), ConfigError> {
        let numbers: Vec<f64> = match value {
            Value::Number(n) => vec![*n],
            Value::List(items) => items.iter().filter_map(Value::as_f64).collect(),
            _ => return Ok(()),
        };
        for n in numbers {
            if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
                return Err(ConfigError::InvalidVariableValue {
                    name: self.name.clone(),
                    reason: format!(
                        "{} is outside [{}, {}]",
                        n,
                        self.min.map_or("-inf".to_string(), |m| m.to_string()),
                        self.max.map_or("inf".to_string(), |m| m.to_string()),
                    ),
                });
            }
        }
        Ok(())
    }
}

fn json_kind(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Schema registry: the union of global and step-declared variables.
#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: BTreeMap<String, Variable>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Re-declaring an identical variable is a no-op;
    /// a differing type or default is rejected.
    pub fn register(&mut self, variable: Variable) -> Result<(), ConfigError> {
        if let Some(existing) = self.variables.get(&variable.name) {
            if existing.ty != variable.ty {
                return Err(ConfigError::ConflictingDeclaration {
                    name: variable.name.clone(),
                    reason: format!("declared as {} and as {}", existing.ty, variable.ty),
                });
            }
            if existing.default != variable.default {
                return Err(ConfigError::ConflictingDeclaration {
                    name: variable.name.clone(),
                    reason: "declared with two different defaults".to_string(),
                });
            }
            return Ok(());
        }
        self.variables.insert(variable.name.clone(), variable);
        Ok(())
    }

    pub fn register_all<I>(&mut self, variables: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = Variable>,
    {
        for v in variables {
            self.register(v)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
