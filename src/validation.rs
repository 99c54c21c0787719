//! Validation System - Cross-Variable Consistency Rules
//!
//! Rules produce structured violations.
//! The validator maps error violations to `IncompatibleConfiguration`.

use serde::{Deserialize, Serialize};

use crate::config::{Config, ConfigError, ValueSource};
use crate::variables::{Condition, VariableRegistry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub variables: Vec<String>,
    pub message: String,
}

/// Cross-variable rule trait - produces violations
pub trait ConfigRule {
    fn name(&self) -> &'static str;
    fn check(&self, config: &Config, registry: &VariableRegistry) -> Vec<ValidationViolation>;
}

fn condition_holds(config: &Config, condition: &Condition) -> bool {
    config
        .get(&condition.variable)
        .is_some_and(|v| v.render() == condition.equals)
}

// --- Concrete Rules ---

/// Variables declared `only_when` must not be set explicitly while their
/// companion has another value.
pub struct CompanionRule;

impl ConfigRule for CompanionRule {
    fn name(&self) -> &'static str {
        "companion"
    }

    fn check(&self, config: &Config, registry: &VariableRegistry) -> Vec<ValidationViolation> {
        registry
            .iter()
            .filter_map(|var| {
                let condition = var.only_when.as_ref()?;
                if config.source(&var.name) != Some(ValueSource::Override) || condition_holds(config, condition) {
                    return None;
                }
                Some(ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Error,
                    variables: vec![var.name.clone(), condition.variable.clone()],
                    message: format!(
                        "{} is only meaningful when {} is '{}'",
                        var.name, condition.variable, condition.equals
                    ),
                })
            })
            .collect()
    }
}

/// `variable` must be set whenever `when` holds.
pub struct RequiredWhenRule {
    pub variable: String,
    pub when: Condition,
}

impl RequiredWhenRule {
    pub fn new(variable: &str, companion: &str, equals: &str) -> Self {
        Self {
            variable: variable.to_string(),
            when: Condition { variable: companion.to_string(), equals: equals.to_string() },
        }
    }
}

impl ConfigRule for RequiredWhenRule {
    fn name(&self) -> &'static str {
        "required_when"
    }

    fn check(&self, config: &Config, _registry: &VariableRegistry) -> Vec<ValidationViolation> {
        if condition_holds(config, &self.when) && !config.contains(&self.variable) {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                variables: vec![self.variable.clone(), self.when.variable.clone()],
                message: format!(
                    "{} must be set when {} is '{}'",
                    self.variable, self.when.variable, self.when.equals
                ),
            }]
        } else {
            vec![]
        }
    }
}

/// A list variable, when set, must hold exactly `len` items.
pub struct ListLengthRule {
    pub variable: String,
    pub len: usize,
}

impl ConfigRule for ListLengthRule {
    fn name(&self) -> &'static str {
        "list_length"
    }

    fn check(&self, config: &Config, _registry: &VariableRegistry) -> Vec<ValidationViolation> {
        match config.get(&self.variable).and_then(|v| v.as_list()) {
            Some(items) if items.len() != self.len => vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                variables: vec![self.variable.clone()],
                message: format!("{} needs {} items, found {}", self.variable, self.len, items.len()),
            }],
            _ => vec![],
        }
    }
}

/// Validator orchestrates rules
pub struct Validator {
    rules: Vec<Box<dyn ConfigRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self { rules: vec![Box::new(CompanionRule)] }
    }

    pub fn with_rule(mut self, rule: Box<dyn ConfigRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Errors become `IncompatibleConfiguration`; warnings are returned as text.
    pub fn validate(&self, config: &Config, registry: &VariableRegistry) -> (Vec<ConfigError>, Vec<String>) {
        let mut errors = vec![];
        let mut warnings = vec![];

        for rule in &self.rules {
            for v in rule.check(config, registry) {
                match v.severity {
                    ViolationSeverity::Error => errors.push(ConfigError::IncompatibleConfiguration {
                        variables: v.variables,
                        reason: v.message,
                    }),
                    ViolationSeverity::Warning => warnings.push(format!("{}: {}", v.rule, v.message)),
                }
            }
        }

        (errors, warnings)
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
