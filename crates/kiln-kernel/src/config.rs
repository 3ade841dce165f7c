//! Configuration types and loader.
//!
//! The scheduler consumes a fully parsed configuration; this module owns the
//! types and a loader that auto-detects the file format from its extension
//! and substitutes `${VAR}` environment references before parsing. JSON is
//! the reference format, but every format the `config` crate understands is
//! accepted.
//!
//! Unknown keys are ignored; missing required keys fail the load, which the
//! binary turns into a startup failure (exit code 1). Per-project problems
//! (bad cron spec, unsupported SCM kind) are *not* detected here — the
//! project registry reports and excludes those while the rest of the
//! configuration keeps working.

use std::path::{Path, PathBuf};

use config::{Config as Cfg, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file parsed but does not describe a valid configuration
    /// (missing required keys, wrong types).
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// A project references an SCM kind the scheduler does not implement.
    #[error("unsupported scm type '{kind}' for project '{project}'")]
    UnsupportedScm { project: String, kind: String },
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Top-level configuration of the scheduler core.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub core: CoreSection,
    /// Path of the sqlite task store.
    pub database: PathBuf,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `tracing_subscriber` env-filter directive for this level.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreSection {
    /// URL the runner request/reply endpoint binds to.
    pub endpoint: String,
    /// URL the change-event publisher binds to.
    pub events: String,
    /// Directory under which per-project SCM working state is kept.
    pub root_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    /// Five-field cron spec driving this project's checks.
    pub cron: String,
    /// SCM descriptor; `type` selects the implementation, the rest is
    /// implementation-specific and forwarded to runners verbatim.
    pub scm: Value,
    /// Runner selection criteria matched against a requesting runner id.
    #[serde(default)]
    pub runner: Value,
    /// Action template; `${ref}` / `${branch}` placeholders are resolved
    /// from the SCM probe result when a task is derived.
    pub run: Value,
}

impl ProjectConfig {
    /// The `type` field of the SCM descriptor.
    pub fn scm_kind(&self) -> Option<&str> {
        crate::json::find_str(&self.scm, "type")
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Detect configuration format from file extension.
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("no file extension".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" | "conf" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute `${VAR}` environment references in the raw file content.
/// References to unset variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    re.replace_all(content, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

/// Load the core configuration from `path`.
pub fn load(path: &Path) -> ConfigResult<CoreConfig> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let content = substitute_env_vars(&content);

    let parsed = Cfg::builder()
        .add_source(File::from_str(&content, format))
        .build()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;

    parsed
        .try_deserialize()
        .map_err(|e| ConfigError::Invalid(e.to_string()))
}
