//! Concrete Steps - data-driven tool steps and closure-backed pure steps

use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;

use crate::metrics::read_metrics_file;
use crate::step::{Step, StepContext, StepError, StepOutput};
use crate::state::ViewId;
use crate::toolbox::Invocation;
use crate::variables::Variable;

/// File a tool may leave in its step directory to report metrics.
pub const METRICS_FILE: &str = "metrics.json";

/// A step that runs one external tool.
///
/// Arguments are templates. Recognized placeholders:
/// `{in:VIEW}`, `{out:VIEW}`, `{var:NAME}` and `{step_dir}`; any other
/// braces are passed through untouched (TCL needs them).
#[derive(Debug, Clone)]
pub struct ToolStep {
    id: String,
    tool: String,
    args: Vec<String>,
    inputs: Vec<ViewId>,
    outputs: Vec<ViewId>,
    output_files: BTreeMap<ViewId, String>,
    consumes: Vec<String>,
    variables: Vec<Variable>,
    skippable: bool,
}

impl ToolStep {
    pub fn new(id: &str, tool: &str) -> Self {
        Self {
            id: id.to_string(),
            tool: tool.to_string(),
            args: vec![],
            inputs: vec![],
            outputs: vec![],
            output_files: BTreeMap::new(),
            consumes: vec![],
            variables: vec![],
            skippable: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn input(mut self, view: ViewId) -> Self {
        self.inputs.push(view);
        self
    }

    pub fn output(mut self, view: ViewId, file_name: &str) -> Self {
        self.outputs.push(view);
        self.output_files.insert(view, file_name.to_string());
        self
    }

    /// Read a variable declared elsewhere (usually a global).
    pub fn consumes(mut self, names: &[&str]) -> Self {
        self.consumes.extend(names.iter().map(|n| n.to_string()));
        self
    }

    /// Declare and read a variable.
    pub fn declare(mut self, variable: Variable) -> Self {
        self.consumes.push(variable.name.clone());
        self.variables.push(variable);
        self
    }

    pub fn always_run(mut self) -> Self {
        self.skippable = false;
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    fn invalid(&self, reason: String) -> StepError {
        StepError::InvalidStepDefinition { step: self.id.clone(), reason }
    }

    fn render(&self, template: &str, ctx: &StepContext<'_>) -> Result<String, StepError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let token = &after[..end];
            match self.resolve_token(token, ctx)? {
                Some(value) => out.push_str(&value),
                None => {
                    out.push('{');
                    out.push_str(token);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve_token(&self, token: &str, ctx: &StepContext<'_>) -> Result<Option<String>, StepError> {
        if token == "step_dir" {
            return Ok(Some(ctx.step_dir.display().to_string()));
        }
        let Some((kind, name)) = token.split_once(':') else {
            return Ok(None);
        };
        match kind {
            "in" => {
                let view = self.parse_view(name)?;
                if !self.inputs.contains(&view) {
                    return Err(self.invalid(format!("'{{in:{}}}' is not a declared input", name)));
                }
                Ok(Some(ctx.input(&self.id, view)?.display().to_string()))
            }
            "out" => {
                let view = self.parse_view(name)?;
                let file = self
                    .output_files
                    .get(&view)
                    .ok_or_else(|| self.invalid(format!("'{{out:{}}}' is not a declared output", name)))?;
                Ok(Some(ctx.step_file(file).display().to_string()))
            }
            "var" => {
                if !self.consumes.iter().any(|c| c == name) {
                    return Err(self.invalid(format!("'{{var:{}}}' is not a consumed variable", name)));
                }
                let value = ctx
                    .config
                    .get(name)
                    .ok_or_else(|| self.invalid(format!("variable {} is unset", name)))?;
                Ok(Some(value.render()))
            }
            _ => Ok(None),
        }
    }

    fn parse_view(&self, name: &str) -> Result<ViewId, StepError> {
        name.parse::<ViewId>().map_err(|e| self.invalid(e.to_string()))
    }

    fn invocation(&self, ctx: &StepContext<'_>) -> Result<Invocation, StepError> {
        let args = self
            .args
            .iter()
            .map(|a| self.render(a, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        let log_name = format!("{}.log", sanitize(&self.id));
        let mut inv = Invocation::new(&self.tool, ctx.step_dir, ctx.step_file(&log_name))
            .args(args)
            .timeout(ctx.timeout)
            .env("STEP_DIR", &ctx.step_dir.display().to_string());

        for name in &self.consumes {
            if let Some(value) = ctx.config.get(name) {
                inv = inv.env(name, &value.render());
            }
        }
        for view in &self.inputs {
            let path = ctx.input(&self.id, *view)?;
            inv = inv.env(&format!("IN_{}", view.env_suffix()), &path.display().to_string());
        }
        for (view, file) in &self.output_files {
            inv = inv.env(&format!("OUT_{}", view.env_suffix()), &ctx.step_file(file).display().to_string());
        }
        Ok(inv)
    }
}

impl Step for ToolStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> &[ViewId] {
        &self.inputs
    }

    fn outputs(&self) -> &[ViewId] {
        &self.outputs
    }

    fn variables(&self) -> Vec<Variable> {
        self.variables.clone()
    }

    fn config_vars(&self) -> Vec<String> {
        let mut names = self.consumes.clone();
        names.sort();
        names.dedup();
        names
    }

    fn definition(&self) -> JsonValue {
        json!({
            "tool": self.tool,
            "args": self.args,
            "outputs": self.output_files,
        })
    }

    fn skippable(&self) -> bool {
        self.skippable
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        let invocation = self.invocation(ctx)?;
        let result = ctx.toolbox.run(&invocation, ctx.cancel)?;
        tracing::debug!(step = %self.id, runtime = ?result.runtime, "tool finished");

        let mut output = StepOutput::new();
        for (view, file) in &self.output_files {
            output = output.view(*view, ctx.step_file(file));
        }

        let metrics_path = ctx.step_file(METRICS_FILE);
        if metrics_path.is_file() {
            output.metrics = read_metrics_file(&metrics_path)
                .map_err(|reason| StepError::MalformedOutput { step: self.id.clone(), reason })?;
        }
        Ok(output)
    }
}

type StepFn = dyn Fn(&StepContext<'_>) -> Result<StepOutput, StepError> + Send + Sync;

/// A step implemented by a closure; used for pure transformations that need
/// no external tool.
pub struct FnStep {
    id: String,
    inputs: Vec<ViewId>,
    outputs: Vec<ViewId>,
    consumes: Vec<String>,
    variables: Vec<Variable>,
    func: Box<StepFn>,
}

impl FnStep {
    pub fn new<F>(id: &str, func: F) -> Self
    where
        F: Fn(&StepContext<'_>) -> Result<StepOutput, StepError> + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            inputs: vec![],
            outputs: vec![],
            consumes: vec![],
            variables: vec![],
            func: Box::new(func),
        }
    }

    pub fn reads(mut self, views: &[ViewId]) -> Self {
        self.inputs.extend_from_slice(views);
        self
    }

    pub fn produces(mut self, views: &[ViewId]) -> Self {
        self.outputs.extend_from_slice(views);
        self
    }

    pub fn consumes(mut self, names: &[&str]) -> Self {
        self.consumes.extend(names.iter().map(|n| n.to_string()));
        self
    }

    pub fn declare(mut self, variable: Variable) -> Self {
        self.consumes.push(variable.name.clone());
        self.variables.push(variable);
        self
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Step for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn inputs(&self) -> &[ViewId] {
        &self.inputs
    }

    fn outputs(&self) -> &[ViewId] {
        &self.outputs
    }

    fn variables(&self) -> Vec<Variable> {
        self.variables.clone()
    }

    fn config_vars(&self) -> Vec<String> {
        let mut names = self.consumes.clone();
        names.sort();
        names.dedup();
        names
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepError> {
        (self.func)(ctx)
    }
}

/// Directory-safe form of a step id.
pub fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c.to_ascii_lowercase() } else { '-' })
        .collect()
}
