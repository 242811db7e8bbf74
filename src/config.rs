//! Configuration for pipeflow paths and engine settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PIPEFLOW_HOME, PIPEFLOW_PIPELINES)
//! 2. Config file (.pipeflow/config.yaml)
//! 3. Defaults (~/.pipeflow, ./pipelines)
//!
//! Config file discovery:
//! - Searches current directory and parents for .pipeflow/config.yaml
//! - `paths.home` is relative to the .pipeflow/ directory
//! - `paths.pipelines` is relative to the project root (parent of .pipeflow/)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".pipeflow";
const HOME_ENV: &str = "PIPEFLOW_HOME";
const PIPELINES_ENV: &str = "PIPEFLOW_PIPELINES";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub primitives: PrimitiveSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .pipeflow/)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to the project root)
    pub pipelines: Option<String>,
}

/// Orchestration limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Step primitives allowed to run at once
    pub max_concurrent_steps: usize,

    /// Timeout for steps without `timeout_seconds`
    pub step_timeout_seconds: u64,

    /// How often waiters re-read the log
    pub poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 16,
            step_timeout_seconds: 600,
            poll_interval_ms: 250,
        }
    }
}

/// Settings handed to the built-in primitives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimitiveSettings {
    /// Request timeout for `http` steps
    pub http_timeout_seconds: u64,

    /// Shell used by `exec` steps
    pub shell: String,

    /// Sendmail-compatible binary used by `email` steps
    pub sendmail_path: String,

    /// Default sender for `email` steps
    pub email_from: Option<String>,

    /// Container runtime CLI used by `container` steps
    pub docker_binary: String,

    /// Runtime name to interpreter command for `function` steps
    pub interpreters: HashMap<String, String>,
}

impl Default for PrimitiveSettings {
    fn default() -> Self {
        Self {
            http_timeout_seconds: 30,
            shell: "sh".to_string(),
            sendmail_path: "/usr/sbin/sendmail".to_string(),
            email_from: None,
            docker_binary: "docker".to_string(),
            interpreters: [
                ("python", "python3"),
                ("node", "node"),
                ("sh", "sh"),
                ("bash", "bash"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to pipeflow home (engine state)
    pub home: PathBuf,
    /// Directory holding pipeline definitions
    pub pipelines: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Engine limits
    pub engine: EngineSettings,
    /// Primitive settings
    pub primitives: PrimitiveSettings,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per execution
    pub fn executions_dir(&self) -> PathBuf {
        self.home.join("executions")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);
    let default_pipelines = std::env::current_dir()
        .context("Failed to determine current directory")?
        .join("pipelines");

    let config_file = find_config_file();

    let (home, pipelines, engine, primitives) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;

        // .pipeflow/ and the project root above it
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        let base_dir = config_dir.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var(HOME_ENV) {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(config_dir, home_path)
        } else {
            default_home.clone()
        };

        let pipelines = if let Ok(env_pipelines) = std::env::var(PIPELINES_ENV) {
            PathBuf::from(env_pipelines)
        } else if let Some(ref pipelines_path) = config.paths.pipelines {
            resolve_path(base_dir, pipelines_path)
        } else {
            base_dir.join("pipelines")
        };

        (home, pipelines, config.engine, config.primitives)
    } else {
        let home = std::env::var(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_home.clone());

        let pipelines = std::env::var(PIPELINES_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_pipelines.clone());

        (
            home,
            pipelines,
            EngineSettings::default(),
            PrimitiveSettings::default(),
        )
    };

    Ok(ResolvedConfig {
        home,
        pipelines,
        config_file,
        engine,
        primitives,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the pipeflow home directory (engine state)
pub fn pipeflow_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the executions directory ($PIPEFLOW_HOME/executions)
pub fn executions_dir() -> Result<PathBuf> {
    Ok(config()?.executions_dir())
}

/// Get the pipeline definitions directory
pub fn pipelines_dir() -> Result<PathBuf> {
    Ok(config()?.pipelines.clone())
}
