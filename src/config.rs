//! Configuration for strata, read from `.strata/strata.toml`.
//!
//! Settings are layered file → environment → CLI:
//!
//! ```toml
//! [environment]
//! stage = "dev"
//! account = "123456789012"
//! region = "us-east-1"
//! name_prefix = "acme"
//!
//! [execution]
//! max_parallel = 8
//! provision_timeout_secs = 900
//!
//! [logging]
//! json = false
//! level = "info"
//! ```
//!
//! Environment overrides: `STRATA_STAGE` (or `ENV`), `AWS_ACCOUNT_ID`,
//! `AWS_REGION_ID`, `STRATA_NAME_PREFIX`.

use crate::naming::Environment;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding strata's project files.
pub const STRATA_DIR: &str = ".strata";
pub const CONFIG_FILE: &str = "strata.toml";
pub const PIPELINE_FILE: &str = "pipeline.toml";

/// Target environment as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub account: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub name_prefix: String,
}

fn default_stage() -> String {
    "dev".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            account: String::new(),
            region: default_region(),
            name_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Concurrent provisioning calls per wave
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Deadline for a single provisioning call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_timeout_secs: Option<u64>,
}

fn default_max_parallel() -> usize {
    8
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            provision_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            json: false,
            level: default_level(),
        }
    }
}

/// The complete strata.toml configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StrataToml {
    #[serde(default)]
    pub environment: EnvironmentSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StrataToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse strata.toml")
    }

    /// Load `strata.toml` from `strata_dir`, or defaults if it is missing.
    pub fn load_or_default(strata_dir: &Path) -> Result<Self> {
        let config_path = strata_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize strata.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Environment from the file, with overrides read through `lookup`.
    pub fn environment_with<F>(&self, lookup: F) -> Environment
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = &self.environment;
        let pick = |vars: &[&str], fallback: &str| {
            vars.iter()
                .find_map(|v| lookup(v).filter(|s| !s.is_empty()))
                .unwrap_or_else(|| fallback.to_string())
        };

        Environment::new(
            pick(&["STRATA_STAGE", "ENV"], &file.stage),
            pick(&["AWS_ACCOUNT_ID"], &file.account),
            pick(&["AWS_REGION_ID"], &file.region),
            pick(&["STRATA_NAME_PREFIX"], &file.name_prefix),
        )
    }

    /// Environment from the file with process environment overrides.
    pub fn environment(&self) -> Environment {
        self.environment_with(|var| std::env::var(var).ok())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.environment.account.is_empty() {
            warnings.push(
                "environment.account is empty; set it or export AWS_ACCOUNT_ID".to_string(),
            );
        }
        if self.environment.name_prefix.is_empty() {
            warnings.push(
                "environment.name_prefix is empty; generated names may collide across projects"
                    .to_string(),
            );
        }
        if self.execution.max_parallel == 0 {
            warnings.push("execution.max_parallel is 0; it will be treated as 1".to_string());
        }
        if self.execution.provision_timeout_secs == Some(0) {
            warnings.push(
                "execution.provision_timeout_secs is 0; every provisioning call will time out"
                    .to_string(),
            );
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            warnings.push(format!(
                "Invalid logging.level '{}': expected trace, debug, info, warn or error",
                self.logging.level
            ));
        }

        warnings
    }
}

/// Runtime configuration: the parsed file plus CLI overrides.
#[derive(Debug, Clone)]
pub struct StrataConfig {
    pub project_dir: PathBuf,
    pub strata_dir: PathBuf,
    pub toml: StrataToml,
    /// CLI override: stage
    pub cli_stage: Option<String>,
    /// CLI override: verbose logging
    pub verbose: bool,
    /// CLI override: JSON log output
    pub json_logs: bool,
}

impl StrataConfig {
    /// Create a new StrataConfig from a project directory.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let strata_dir = project_dir.join(STRATA_DIR);
        let toml = StrataToml::load_or_default(&strata_dir)?;

        Ok(Self {
            project_dir,
            strata_dir,
            toml,
            cli_stage: None,
            verbose: false,
            json_logs: false,
        })
    }

    /// Create StrataConfig with CLI overrides.
    pub fn with_cli_args(
        project_dir: PathBuf,
        stage: Option<String>,
        verbose: bool,
        json_logs: bool,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_stage = stage;
        config.verbose = verbose;
        config.json_logs = json_logs;
        Ok(config)
    }

    /// Effective environment (file → env → CLI).
    pub fn environment(&self) -> Environment {
        let mut env = self.toml.environment();
        if let Some(stage) = &self.cli_stage {
            env.stage = stage.clone();
        }
        env
    }

    pub fn max_parallel(&self) -> usize {
        self.toml.execution.max_parallel.max(1)
    }

    pub fn provision_timeout(&self) -> Option<Duration> {
        self.toml.execution.provision_timeout_secs.map(Duration::from_secs)
    }

    /// Log level; `-v` raises it to debug.
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            return tracing::Level::DEBUG;
        }
        self.toml.logging.level.parse().unwrap_or(tracing::Level::INFO)
    }

    pub fn json_logs(&self) -> bool {
        self.json_logs || self.toml.logging.json
    }

    pub fn config_file(&self) -> PathBuf {
        self.strata_dir.join(CONFIG_FILE)
    }

    pub fn pipeline_file(&self) -> PathBuf {
        self.strata_dir.join(PIPELINE_FILE)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
