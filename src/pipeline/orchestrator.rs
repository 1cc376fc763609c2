//! Top-level driver: plans stacks into stages and runs them.
//!
//! Before each stage the orchestrator re-synthesizes the pipeline definition.
//! An unchanged definition is a no-op; a changed one replaces the running
//! plan, carries over the identifiers of stacks that already ran, and resumes
//! at the first stage that still has work to do.

use crate::dag::{
    ExplicitStage, PipelineEvent, PipelineSummary, RunState, StackResult, StageExecutor,
    StageResult, WaveResult,
};
use crate::errors::{GraphError, PipelineError};
use crate::pipeline::definition::DefinitionSource;
use crate::pipeline::plan::Pipeline;
use crate::policy::AggregatedRole;
use crate::stack::Stack;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of a run that got past planning.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub state: RunState,
    /// Results per stage of the final plan, in execution order.
    pub stages: Vec<StageResult>,
    /// Export name → value, from every role stack that ran.
    pub exports: BTreeMap<String, String>,
    /// Roles issued by permission stacks, keyed by stack.
    pub roles: BTreeMap<String, AggregatedRole>,
    pub summary: PipelineSummary,
    /// Fingerprint of the plan that finished the run.
    pub fingerprint: String,
    /// How many times the running plan was replaced.
    pub replans: usize,
    #[serde(with = "crate::dag::duration_serde")]
    pub duration: Duration,
}

impl PipelineResult {
    /// The first failed stage, with every failed stack in it.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        self.stages.iter().find(|s| !s.success() && !s.skipped())
    }

    /// Turn an unsuccessful run into [`PipelineError::StageFailed`].
    pub fn into_result(self) -> Result<Self, PipelineError> {
        if let Some(stage) = self.failed_stage() {
            return Err(PipelineError::StageFailed {
                stage: stage.name.clone(),
                failures: stage.failures(),
            });
        }
        Ok(self)
    }
}

/// Drives a [`Pipeline`] through a [`StageExecutor`].
pub struct PipelineOrchestrator {
    executor: StageExecutor,
    source: Option<Arc<dyn DefinitionSource>>,
}

impl PipelineOrchestrator {
    pub fn new(executor: StageExecutor) -> Self {
        Self {
            executor,
            source: None,
        }
    }

    /// Re-synthesize the plan from `source` before every stage.
    pub fn with_definition_source(mut self, source: Arc<dyn DefinitionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Order `stacks` into stages. Fails before anything executes.
    pub fn build(stacks: Vec<Stack>, explicit: &[ExplicitStage]) -> Result<Pipeline, GraphError> {
        Pipeline::build(stacks, explicit)
    }

    /// Execute the stages of `pipeline` in order.
    ///
    /// A failing stage makes the result unsuccessful and every later stage
    /// skipped; use [`PipelineResult::into_result`] to treat that as an
    /// error. Errors returned directly are planning failures of a
    /// re-synthesized definition and handle invariant violations.
    pub async fn run(&self, pipeline: Pipeline) -> Result<PipelineResult, PipelineError> {
        let timer = crate::dag::ExecutionTimer::start();
        let mut pipeline = pipeline;
        let mut records: HashMap<String, StackResult> = HashMap::new();
        let mut durations: HashMap<String, Duration> = HashMap::new();
        let mut replans = 0;
        let mut failed_at: Option<usize> = None;
        let mut index = 0;

        info!(
            stages = pipeline.stages().len(),
            fingerprint = %pipeline.fingerprint(),
            "Pipeline started"
        );

        while index < pipeline.stages().len() {
            if let Some(replaced) = self.replan(&pipeline, &mut records)? {
                let (next, resume) = replaced;
                self.executor
                    .emit_event(PipelineEvent::PlanReplaced {
                        previous: pipeline.fingerprint().to_string(),
                        current: next.fingerprint().to_string(),
                        resume_stage: next.stages().get(resume).map(|s| s.name.clone()),
                    })
                    .await;
                info!(
                    previous = %pipeline.fingerprint(),
                    current = %next.fingerprint(),
                    resume = resume,
                    "Pipeline definition changed, plan replaced"
                );
                pipeline = next;
                replans += 1;
                index = resume;
                continue;
            }

            let stage = pipeline.stages()[index].clone();
            info!(stage = %stage.name, index = index, "Stage started");
            self.executor
                .emit_event(PipelineEvent::StageStarted {
                    stage: stage.name.clone(),
                    index,
                })
                .await;

            let result = self
                .executor
                .execute_stage(&stage, pipeline.scheduler_mut(), &records)
                .await;

            let invariant = result.stacks().find_map(|r| r.invariant.clone());
            let success = result.success();
            durations.insert(stage.name.clone(), result.duration);
            for stack in result.stacks() {
                records.insert(stack.stack.clone(), stack.clone());
            }

            self.executor
                .emit_event(PipelineEvent::StageCompleted {
                    stage: stage.name.clone(),
                    success,
                })
                .await;

            if let Some(invariant) = invariant {
                error!(stage = %stage.name, error = %invariant, "Handle invariant violated");
                return Err(PipelineError::Invariant(invariant));
            }

            if !success {
                for failure in result.failures() {
                    error!(
                        stage = %stage.name,
                        wave = %failure.wave,
                        stack = %failure.stack,
                        error = %failure.error,
                        "Stage failed"
                    );
                }
                failed_at = Some(index);
                break;
            }

            index += 1;
        }

        if let Some(failed) = failed_at {
            let later: Vec<_> = pipeline.stages()[failed + 1..].to_vec();
            for stage in &later {
                warn!(stage = %stage.name, "Skipping stage after earlier failure");
                let skipped = self.executor.skip_stage(stage, pipeline.scheduler_mut()).await;
                for stack in skipped.stacks() {
                    records.insert(stack.stack.clone(), stack.clone());
                }
            }
        }

        let result = collect(&pipeline, records, &durations, replans, timer.elapsed());

        info!(
            success = result.success,
            completed = result.summary.completed,
            failed = result.summary.failed,
            skipped = result.summary.skipped,
            "Pipeline finished"
        );
        self.executor
            .emit_event(PipelineEvent::PipelineCompleted {
                success: result.success,
                summary: result.summary.clone(),
            })
            .await;

        Ok(result)
    }

    /// Re-synthesize the definition and swap in a new plan if it changed.
    ///
    /// Returns the new plan and the index of the stage to resume at.
    fn replan(
        &self,
        current: &Pipeline,
        records: &mut HashMap<String, StackResult>,
    ) -> Result<Option<(Pipeline, usize)>, PipelineError> {
        let Some(source) = &self.source else {
            return Ok(None);
        };

        let definition = source.synthesize().map_err(PipelineError::Definition)?;
        let mut next = Pipeline::from_definition(&definition, self.executor.environment())?;
        if next.fingerprint() == current.fingerprint() {
            return Ok(None);
        }

        let stale = next.stale_stacks(current);
        records.retain(|name, record| {
            let keep = record.success && next.stack(name).is_some() && !stale.contains(name);
            if !keep {
                debug!(stack = %name, "Discarding completed result after replan");
            }
            keep
        });

        for (name, record) in records.iter() {
            if let Some(stack) = next.stack(name) {
                stack.restore(&record.resolved)?;
            }
        }
        for name in records.keys() {
            next.scheduler_mut().mark_completed(name);
        }

        let resume = next
            .stages()
            .iter()
            .position(|stage| stage.stacks().any(|s| !records.contains_key(s)))
            .unwrap_or(next.stages().len());

        Ok(Some((next, resume)))
    }
}

/// Assemble the final result over the stages of `pipeline`.
fn collect(
    pipeline: &Pipeline,
    mut records: HashMap<String, StackResult>,
    durations: &HashMap<String, Duration>,
    replans: usize,
    elapsed: Duration,
) -> PipelineResult {
    let mut summary = PipelineSummary::new(pipeline.stack_count());
    let mut exports = BTreeMap::new();
    let mut roles = BTreeMap::new();

    let stages: Vec<StageResult> = pipeline
        .stages()
        .iter()
        .map(|stage| StageResult {
            name: stage.name.clone(),
            waves: stage
                .waves
                .iter()
                .map(|wave| WaveResult {
                    name: wave.name.clone(),
                    stacks: wave
                        .members
                        .iter()
                        .map(|name| {
                            records.remove(name).unwrap_or_else(|| {
                                StackResult::skipped(name, &stage.name, &wave.name)
                            })
                        })
                        .collect(),
                })
                .collect(),
            duration: durations.get(&stage.name).copied().unwrap_or_default(),
        })
        .collect();

    for result in stages.iter().flat_map(StageResult::stacks) {
        exports.extend(result.exports.clone());
        if let Some(role) = &result.role {
            roles.insert(result.stack.clone(), role.clone());
        }
        summary.add_result(result.clone());
    }
    summary.duration = elapsed;

    let success = summary.all_success();
    PipelineResult {
        success,
        state: RunState::from_success(success),
        stages,
        exports,
        roles,
        summary,
        fingerprint: pipeline.fingerprint().to_string(),
        replans,
        duration: elapsed,
    }
}
