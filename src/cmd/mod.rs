//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `project` | `Init`           |
//! | `plan`    | `Plan`           |
//! | `run`     | `Run`            |
//! | `config`  | `Config`         |

pub mod config;
pub mod plan;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use plan::cmd_plan;
pub use project::cmd_init;
pub use run::cmd_run;

use anyhow::Result;
use std::path::PathBuf;
use strata::config::StrataConfig;
use strata::pipeline::PipelineDefinition;

use super::Cli;

/// Load the configuration with CLI overrides and install tracing.
pub fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<StrataConfig> {
    let config =
        StrataConfig::with_cli_args(project_dir, cli.stage.clone(), cli.verbose, cli.json_logs)?;
    strata::telemetry::init_tracing(config.json_logs(), config.log_level());
    Ok(config)
}

pub fn load_definition(config: &StrataConfig) -> Result<PipelineDefinition> {
    let path = config.pipeline_file();
    if !path.exists() {
        anyhow::bail!(
            "No pipeline definition at {}. Run 'strata init' first.",
            path.display()
        );
    }
    PipelineDefinition::load(&path)
}
