//! Command-line interface for pipeflow.
//!
//! Provides commands for running pipelines, checking status, listing and
//! inspecting executions, controlling running executions, and checking
//! pipeline definitions.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config;
use crate::core::{DefinitionProvider, DirectoryDefinitions, Orchestrator, PIPELINE_STEP_TYPE};
use crate::domain::{Execution, PipelineExecution, PipelineStatus};

/// pipeflow - Event-sourced workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "pipeflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pipeline definitions directory (overrides configuration)
    #[arg(long, global = true, env = "PIPEFLOW_PIPELINES")]
    pub pipelines_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline and wait for it to finish
    Run {
        /// Pipeline name (looks for <pipelines-dir>/<name>.yaml)
        pipeline_name: String,

        /// Pipeline argument as key=value (repeatable; values parse as JSON when they can)
        #[arg(short, long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// YAML or JSON file with pipeline arguments
        #[arg(long)]
        args_file: Option<PathBuf>,
    },

    /// Check the status of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: String,
    },

    /// List recent executions
    List {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the event log of an execution
    Events {
        /// Execution ID (UUID)
        execution_id: String,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Resume a paused execution, or recover one whose process died
    Resume {
        /// Execution ID to resume
        execution_id: String,
    },

    /// Pause an execution (running steps finish, nothing new is planned)
    Pause {
        /// Execution ID to pause
        execution_id: String,
    },

    /// Cancel an execution and its child pipelines
    Cancel {
        /// Execution ID to cancel
        execution_id: String,

        /// Reason recorded in the log
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// List available pipelines
    Pipelines,

    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline name
        pipeline_name: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let pipelines_dir = self.pipelines_dir;
        match self.command {
            Commands::Run {
                pipeline_name,
                args,
                args_file,
            } => run_pipeline(pipelines_dir, &pipeline_name, &args, args_file.as_deref()).await,
            Commands::Status { execution_id } => show_status(&execution_id).await,
            Commands::List { limit } => list_executions(limit).await,
            Commands::Events { execution_id, json } => show_events(&execution_id, json).await,
            Commands::Resume { execution_id } => resume_execution(pipelines_dir, &execution_id).await,
            Commands::Pause { execution_id } => pause_execution(&execution_id).await,
            Commands::Cancel {
                execution_id,
                reason,
            } => cancel_execution(&execution_id, reason).await,
            Commands::Pipelines => list_pipelines(pipelines_dir),
            Commands::Validate { pipeline_name } => validate_pipeline(pipelines_dir, &pipeline_name),
            Commands::Config => show_config(),
        }
    }
}

fn orchestrator(pipelines_dir: Option<PathBuf>) -> Result<Orchestrator> {
    let mut builder = Orchestrator::builder();
    if let Some(dir) = pipelines_dir {
        builder = builder.definitions(DirectoryDefinitions::new(dir));
    }
    Ok(builder.build()?)
}

fn definitions(pipelines_dir: Option<PathBuf>) -> Result<DirectoryDefinitions> {
    let dir = match pipelines_dir {
        Some(dir) => dir,
        None => config::pipelines_dir()?,
    };
    Ok(DirectoryDefinitions::new(dir))
}

fn parse_execution_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid execution ID: {}", s))
}

/// Parse `key=value` pairs; values that parse as JSON keep their type
pub fn parse_args(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut args = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Invalid argument '{}', expected KEY=VALUE", pair))?;
        if key.is_empty() {
            anyhow::bail!("Invalid argument '{}', key is empty", pair);
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        args.insert(key.to_string(), value);
    }
    Ok(args)
}

fn read_args_file(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read args file: {}", path.display()))?;
    let args: Map<String, Value> = serde_yaml::from_str(&content)
        .with_context(|| format!("Args file must be a map: {}", path.display()))?;
    Ok(args)
}

/// Run a pipeline with the given arguments
async fn run_pipeline(
    pipelines_dir: Option<PathBuf>,
    pipeline_name: &str,
    pairs: &[String],
    args_file: Option<&Path>,
) -> Result<()> {
    let mut args = match args_file {
        Some(path) => read_args_file(path)?,
        None => Map::new(),
    };
    // Command-line pairs win over the file
    args.extend(parse_args(pairs)?);

    let orchestrator = orchestrator(pipelines_dir)?;
    let target = orchestrator.queue(pipeline_name, args).await?;
    eprintln!("[Execution {}]", target.execution_id);

    let execution = orchestrator.wait(target.execution_id).await?;
    report(&execution)
}

/// Print the outcome of a finished execution
fn report(execution: &Execution) -> Result<()> {
    let root = execution.root()?;
    match root.status {
        PipelineStatus::Finished => {
            if let Some(output) = &root.output {
                println!("{}", serde_json::to_string_pretty(output)?);
            }
            eprintln!("\n[Execution {} finished successfully]", execution.id);
        }
        PipelineStatus::Failed => {
            let error = root
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".to_string());
            eprintln!("\n[Execution {} failed: {}]", execution.id, error);
            std::process::exit(1);
        }
        PipelineStatus::Canceled => {
            eprintln!("\n[Execution {} was canceled]", execution.id);
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Execution {} in state: {}]", execution.id, status.as_str());
        }
    }
    Ok(())
}

/// Show the status of an execution
async fn show_status(execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = Orchestrator::from_config()?;
    let execution = orchestrator.status(execution_id).await?;
    let root = execution.root()?;

    println!("Execution ID: {}", execution.id);
    println!("Pipeline: {}", root.name);
    println!("State: {}", root.status.as_str());
    println!("Queued: {}", root.queued_at);
    if let Some(ended) = root.ended_at {
        println!("Ended: {}", ended);
    }
    if let Some(error) = &root.error {
        println!("Error: {}", error);
    }

    print_pipeline(&execution, root, 0);
    Ok(())
}

fn print_pipeline(execution: &Execution, pe: &PipelineExecution, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "\n{}{} [{}] {}%",
        indent,
        pe.name,
        pe.status.as_str(),
        pe.progress()
    );

    for se in execution.steps_of(pe.id) {
        let label = match &se.for_each {
            Some(each) => format!("{}[{}]", se.name, each.key),
            None => se.name.clone(),
        };
        let mut line = format!("{}  {:<30} {:<10}", indent, label, se.status.as_str());
        if se.attempt > 1 {
            line.push_str(&format!(" attempt {}", se.attempt));
        }
        if let Some(error) = &se.error {
            line.push_str(&format!(" {}", error));
        }
        println!("{}", line);

        if let Some(child) = se
            .child_pipeline_execution_id
            .and_then(|id| execution.pipeline_executions.get(&id))
        {
            print_pipeline(execution, child, depth + 2);
        }
    }
}

/// List recent executions
async fn list_executions(limit: usize) -> Result<()> {
    let orchestrator = Orchestrator::from_config()?;
    let executions = orchestrator.list().await?;

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<8}", "EXECUTION ID", "PIPELINE", "STATE", "PROGRESS");
    println!("{}", "-".repeat(80));

    for execution in executions.iter().take(limit) {
        let Ok(root) = execution.root() else {
            continue;
        };
        println!(
            "{:<38} {:<20} {:<10} {:>3}%",
            execution.id,
            root.name,
            root.status.as_str(),
            root.progress()
        );
    }

    Ok(())
}

/// Print an execution's log
async fn show_events(execution_id: &str, json: bool) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = Orchestrator::from_config()?;
    let envelopes = orchestrator.events(execution_id).await?;

    for envelope in envelopes {
        if json {
            println!("{}", serde_json::to_string(&envelope)?);
            continue;
        }
        let step = envelope
            .payload
            .get("step_name")
            .and_then(Value::as_str)
            .unwrap_or("");
        println!(
            "{}  {:<24} {}",
            envelope.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            envelope.event_type,
            step
        );
    }
    Ok(())
}

/// Resume a paused execution or recover an interrupted one, then wait
async fn resume_execution(pipelines_dir: Option<PathBuf>, execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let orchestrator = orchestrator(pipelines_dir)?;
    let execution = orchestrator.status(execution_id).await?;

    if execution.root()?.is_paused() {
        orchestrator.resume(execution_id).await?;
    } else {
        orchestrator.recover(execution_id).await?;
    }

    let execution = orchestrator.wait(execution_id).await?;
    report(&execution)
}

async fn pause_execution(execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    Orchestrator::from_config()?.pause(execution_id).await?;
    eprintln!("[Execution {} paused]", execution_id);
    Ok(())
}

async fn cancel_execution(execution_id: &str, reason: Option<String>) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    Orchestrator::from_config()?.cancel(execution_id, reason).await?;
    eprintln!("[Execution {} canceled]", execution_id);
    Ok(())
}

fn list_pipelines(pipelines_dir: Option<PathBuf>) -> Result<()> {
    let definitions = definitions(pipelines_dir)?;
    let names = definitions.list()?;

    if names.is_empty() {
        println!("No pipelines found in {}", definitions.dir().display());
        return Ok(());
    }

    println!("{:<30} {:<6} {}", "PIPELINE", "STEPS", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for name in names {
        match definitions.get_definition(&name) {
            Ok(definition) => println!(
                "{:<30} {:<6} {}",
                name,
                definition.steps.len(),
                definition.description
            ),
            Err(err) => println!("{:<30} {:<6} (invalid: {})", name, "-", err),
        }
    }
    Ok(())
}

fn validate_pipeline(pipelines_dir: Option<PathBuf>, pipeline_name: &str) -> Result<()> {
    let definitions = definitions(pipelines_dir)?;
    let definition = definitions.get_definition(pipeline_name)?;
    definition.validate()?;

    let primitives = crate::primitives::PrimitiveRegistry::with_defaults(&config::config()?.primitives)?;
    for step in &definition.steps {
        if step.step_type != PIPELINE_STEP_TYPE && !primitives.contains(&step.step_type) {
            anyhow::bail!(
                "Step '{}' has unknown type '{}' (available: {}, {})",
                step.name,
                step.step_type,
                primitives.names().join(", "),
                PIPELINE_STEP_TYPE
            );
        }
    }

    for warning in definition.lint() {
        eprintln!("warning: {}", warning);
    }
    println!(
        "Pipeline '{}' is valid ({} steps)",
        definition.name,
        definition.steps.len()
    );
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("pipeflow configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Executions:          {}", cfg.executions_dir().display());
    println!("  Pipelines:           {}", cfg.pipelines.display());
    println!();
    println!("Engine:");
    println!("  Max concurrent steps: {}", cfg.engine.max_concurrent_steps);
    println!("  Step timeout:         {}s", cfg.engine.step_timeout_seconds);
    println!("  Poll interval:        {}ms", cfg.engine.poll_interval_ms);
    println!();
    println!("Primitives:");
    println!("  Shell:       {}", cfg.primitives.shell);
    println!("  Sendmail:    {}", cfg.primitives.sendmail_path);
    println!("  Docker:      {}", cfg.primitives.docker_binary);
    println!("  HTTP timeout: {}s", cfg.primitives.http_timeout_seconds);
    let mut interpreters: Vec<_> = cfg.primitives.interpreters.iter().collect();
    interpreters.sort();
    for (runtime, command) in interpreters {
        println!("  Function runtime {}: {}", runtime, command);
    }

    Ok(())
}
