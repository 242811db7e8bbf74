//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as a set of named steps. Each step has a
//! type (the primitive that runs it), an input template, an optional
//! for-each expression and a list of steps it depends on.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};

/// Step type that spawns a child pipeline instead of calling a primitive
pub const PIPELINE_STEP_TYPE: &str = "pipeline";

/// A complete pipeline definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (used in CLI and by nested `pipeline` steps)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Default arguments, overridden by the arguments given at run time
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,

    /// Steps, in declaration order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Output template rendered when the pipeline finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

impl PipelineDefinition {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of steps, in declaration order
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Merge run-time arguments over the definition's defaults
    pub fn resolve_args(&self, args: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self.args.clone();
        for (k, v) in args {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Dependency entries the planner will ignore: self references and
    /// references to steps that do not exist.
    pub fn lint(&self) -> Vec<String> {
        let names: HashSet<&str> = self.step_names().collect();
        let mut warnings = Vec::new();

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.name {
                    warnings.push(format!("Step '{}' depends on itself", step.name));
                } else if !names.contains(dep.as_str()) {
                    warnings.push(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ));
                }
            }
        }

        warnings
    }

    /// Validate the pipeline definition.
    ///
    /// Checks:
    /// - Non-empty pipeline, step and type names
    /// - `loop` and `throw` only on primitive steps
    /// - No duplicate step names
    /// - No cycles through `depends_on`
    ///
    /// A pipeline with no steps is valid and finishes as soon as it starts.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(OrchestratorError::bad_request("Pipeline name cannot be empty"));
        }

        let mut seen = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(OrchestratorError::bad_request(format!(
                    "Step {} in pipeline '{}' has an empty name",
                    i, self.name
                )));
            }
            if step.step_type.is_empty() {
                return Err(OrchestratorError::bad_request(format!(
                    "Step '{}' in pipeline '{}' has no type",
                    step.name, self.name
                )));
            }
            if step.is_pipeline() && (step.loop_config.is_some() || !step.throw.is_empty()) {
                return Err(OrchestratorError::bad_request(format!(
                    "Step '{}' in pipeline '{}': loop and throw are not supported on pipeline steps",
                    step.name, self.name
                )));
            }
            if step.loop_config.as_ref().map_or(false, |l| l.max_iterations == 0) {
                return Err(OrchestratorError::bad_request(format!(
                    "Step '{}' in pipeline '{}': loop max_iterations must be at least 1",
                    step.name, self.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(OrchestratorError::bad_request(format!(
                    "Duplicate step name '{}' in pipeline '{}'",
                    step.name, self.name
                )));
            }
        }

        for warning in self.lint() {
            warn!(pipeline = %self.name, "{}", warning);
        }

        self.detect_cycles()
    }

    /// Detect cycles in the step dependency graph using Kahn's algorithm.
    ///
    /// Self references and unknown steps are skipped, matching how the
    /// planner treats them.
    fn detect_cycles(&self) -> Result<()> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

        for (idx, step) in self.steps.iter().enumerate() {
            let deps: HashSet<&str> = step.depends_on.iter().map(String::as_str).collect();
            for dep in deps {
                if dep == step.name {
                    continue;
                }
                if let Some(&dep_idx) = index.get(dep) {
                    adj[dep_idx].push(idx);
                    in_degree[idx] += 1;
                }
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(node) = queue.pop() {
            visited += 1;
            for &neighbor in &adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push(neighbor);
                }
            }
        }

        if visited != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.steps[i].name.as_str())
                .collect();
            return Err(OrchestratorError::bad_request(format!(
                "Cycle detected in step dependencies of pipeline '{}' involving: {}",
                self.name,
                stuck.join(", ")
            )));
        }

        Ok(())
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within pipeline)
    pub name: String,

    /// Primitive to run (e.g. "http", "exec", "pipeline")
    #[serde(rename = "type")]
    pub step_type: String,

    /// Steps that must complete before this one is planned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Literal list/map, or a `${{ }}` expression producing one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<Value>,

    /// Input template
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,

    /// Failure policy
    #[serde(default)]
    pub error: ErrorConfig,

    /// Override timeout for this step (uses the engine default if not set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Run only when this renders truthy, otherwise record the step as skipped
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,

    /// Conditions over a successful result that fail the step anyway
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throw: Vec<ThrowConfig>,

    /// Run the step again until a condition over its result holds
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

impl StepDefinition {
    /// Create a step with no dependencies and an empty input
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            depends_on: Vec::new(),
            for_each: None,
            input: Value::Null,
            error: ErrorConfig::default(),
            timeout_seconds: None,
            condition: None,
            throw: Vec::new(),
            loop_config: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_for_each(mut self, for_each: Value) -> Self {
        self.for_each = Some(for_each);
        self
    }

    pub fn with_error(mut self, error: ErrorConfig) -> Self {
        self.error = error;
        self
    }

    pub fn with_condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Get the effective timeout for this step
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(default_seconds);
        Duration::from_secs(seconds)
    }

    /// Whether this step spawns a child pipeline
    pub fn is_pipeline(&self) -> bool {
        self.step_type == PIPELINE_STEP_TYPE
    }
}

/// `throw` entry: fail with `message` when `if` renders truthy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowConfig {
    #[serde(rename = "if")]
    pub condition: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

/// `loop` block. `until` and `input` see `result` and `loop.index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Stop once this renders truthy
    pub until: Value,

    /// Upper bound on runs, the first one included
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Input keys replaced for the next iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

fn default_max_iterations() -> u32 {
    10
}

/// Per-step failure policy
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Record failures but treat the step as a satisfied dependency
    #[serde(default)]
    pub ignore: bool,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub retries: u32,

    /// Delay between attempts
    #[serde(default, flatten)]
    pub backoff: RetryPolicy,
}

impl ErrorConfig {
    pub fn ignored() -> Self {
        Self {
            ignore: true,
            ..Default::default()
        }
    }

    pub fn with_retries(retries: u32) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }
}

/// Delay policy between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Source of pipeline definitions, looked up by name.
pub trait DefinitionProvider: Send + Sync {
    /// Fetch a definition; `NotFound` when the name is unknown
    fn get_definition(&self, name: &str) -> Result<PipelineDefinition>;

    /// Names of all known pipelines
    fn list(&self) -> Result<Vec<String>>;
}

/// Definitions held in memory (embedding, tests)
#[derive(Debug, Clone, Default)]
pub struct InMemoryDefinitions {
    definitions: HashMap<String, PipelineDefinition>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, definition: PipelineDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&mut self, definition: PipelineDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }
}

impl DefinitionProvider for InMemoryDefinitions {
    fn get_definition(&self, name: &str) -> Result<PipelineDefinition> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("Pipeline '{}' not found", name)))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Definitions stored as `<dir>/<name>.yaml` (or `.yml`)
#[derive(Debug, Clone)]
pub struct DirectoryDefinitions {
    dir: PathBuf,
}

impl DirectoryDefinitions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Option<PathBuf> {
        ["yaml", "yml"]
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", name, ext)))
            .find(|p| p.exists())
    }
}

impl DefinitionProvider for DirectoryDefinitions {
    fn get_definition(&self, name: &str) -> Result<PipelineDefinition> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(OrchestratorError::bad_request(format!(
                "Invalid pipeline name '{}'",
                name
            )));
        }

        let path = self.path_for(name).ok_or_else(|| {
            OrchestratorError::not_found(format!(
                "Pipeline '{}' not found in {}",
                name,
                self.dir.display()
            ))
        })?;

        debug!(path = %path.display(), "Loading pipeline definition");
        let definition = PipelineDefinition::from_file(&path)
            .map_err(|e| OrchestratorError::bad_request(format!("{:#}", e)))?;

        if definition.name != name {
            warn!(
                file = %path.display(),
                declared = %definition.name,
                "Pipeline name differs from file name"
            );
        }

        Ok(definition)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for ext in ["yaml", "yml"] {
            let pattern = self.dir.join(format!("*.{}", ext));
            let pattern = pattern.to_string_lossy();
            let entries = glob::glob(&pattern).map_err(|e| {
                OrchestratorError::internal(format!("Invalid glob pattern '{}': {}", pattern, e))
            })?;

            for entry in entries.flatten() {
                if let Some(stem) = entry.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }
}
