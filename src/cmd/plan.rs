//! Plan preview - `strata plan`.

use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use strata::pipeline::Pipeline;
use strata::ui::pipeline_progress::plan_lines;

use super::super::Cli;
use super::{load_config, load_definition};

pub fn cmd_plan(cli: &Cli, project_dir: PathBuf, as_json: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let definition = load_definition(&config)?;
    let env = config.environment();

    let pipeline = Pipeline::from_definition(&definition, &env)?;

    if as_json {
        let out = json!({
            "environment": env,
            "fingerprint": pipeline.fingerprint(),
            "plan": pipeline.describe(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "Pipeline for stage '{}' ({} stacks, {} stages)",
        env.stage,
        pipeline.stack_count(),
        pipeline.stages().len()
    );
    println!("Fingerprint: {}", pipeline.fingerprint());
    println!();
    for line in plan_lines(&pipeline) {
        println!("{}", line);
    }
    println!();

    Ok(())
}
