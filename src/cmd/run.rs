//! Pipeline execution - `strata run`.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use strata::credentials::{
    AuthToken, CredentialProvider, DEFAULT_TOKEN_VAR, EnvCredentialProvider,
    StaticCredentialProvider,
};
use strata::dag::{ExecutorConfig, PipelineEvent, StageExecutor};
use strata::pipeline::{FileDefinitionSource, Pipeline, PipelineOrchestrator};
use strata::provision::SimulatedProvisioner;
use strata::ui::{PipelineUI, UiMode};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::super::Cli;
use super::{load_config, load_definition};

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, dry_run: bool, ui: &str) -> Result<()> {
    if !dry_run {
        anyhow::bail!(
            "No provisioning backend is configured. \
             Use 'strata run --dry-run' to execute against the simulated backend."
        );
    }

    let config = load_config(cli, project_dir)?;
    for warning in config.validate() {
        warn!("{}", warning);
    }

    let definition = load_definition(&config)?;
    let env = config.environment();
    let pipeline = Pipeline::from_definition(&definition, &env)?;

    let token_set = std::env::var_os(DEFAULT_TOKEN_VAR).is_some();
    let credentials: Arc<dyn CredentialProvider> = if token_set {
        Arc::new(EnvCredentialProvider::default())
    } else {
        info!("{} not set, using a placeholder token for the dry run", DEFAULT_TOKEN_VAR);
        Arc::new(StaticCredentialProvider::new(AuthToken::new("dry-run")))
    };

    let mode = UiMode::parse(ui);
    let ui = Arc::new(PipelineUI::new(pipeline.stack_count(), mode, cli.verbose));
    ui.print_plan(&pipeline);

    let (tx, mut rx) = mpsc::channel::<PipelineEvent>(100);
    let ui_task = {
        let ui = Arc::clone(&ui);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                ui.handle_event(&event);
            }
        })
    };

    let executor = StageExecutor::new(
        ExecutorConfig::from_config(&config),
        env,
        Arc::new(SimulatedProvisioner::new()),
        credentials,
    )
    .with_event_channel(tx);
    let orchestrator = PipelineOrchestrator::new(executor)
        .with_definition_source(Arc::new(FileDefinitionSource::new(config.pipeline_file())));

    let result = orchestrator.run(pipeline).await;
    // Closing the channel lets the UI task drain and exit
    drop(orchestrator);
    ui_task.await.ok();

    let result = result?;
    ui.print_report(&result);
    if mode == UiMode::Json {
        println!("{}", serde_json::to_string(&result)?);
    }

    result.into_result()?;
    Ok(())
}
