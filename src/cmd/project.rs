//! Project initialization - `strata init`.

use anyhow::{Context, Result};
use std::path::Path;
use strata::config::{CONFIG_FILE, PIPELINE_FILE, STRATA_DIR, StrataToml};
use strata::pipeline::PipelineDefinition;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let strata_dir = project_dir.join(STRATA_DIR);
    let was_initialized = strata_dir.exists();

    std::fs::create_dir_all(&strata_dir)
        .with_context(|| format!("Failed to create {}", strata_dir.display()))?;

    let config_path = strata_dir.join(CONFIG_FILE);
    let created_config = !config_path.exists();
    if created_config {
        StrataToml::default().save(&config_path)?;
    }

    let pipeline_path = strata_dir.join(PIPELINE_FILE);
    let created_pipeline = force || !pipeline_path.exists();
    if created_pipeline {
        PipelineDefinition::sample().save(&pipeline_path)?;
    }

    if created_config || created_pipeline {
        println!("Initialized strata project at {}", strata_dir.display());
        println!();
        println!("  .strata/");
        if created_config {
            println!("  ├── strata.toml     # Environment, execution and logging settings");
        }
        if created_pipeline {
            println!("  └── pipeline.toml   # Stacks, handles, roles and stages");
        }
        println!();
        println!("Next steps:");
        println!("  1. Set environment.account and environment.name_prefix in strata.toml");
        println!("  2. Run `strata plan` to review stages and waves");
        println!("  3. Run `strata run --dry-run` to walk the pipeline");
    } else if was_initialized {
        println!("Strata project already initialized at {}", strata_dir.display());
        println!("Use --force to replace pipeline.toml with the sample.");
    }

    Ok(())
}
