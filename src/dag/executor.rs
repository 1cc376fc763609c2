//! Stage executor: runs the waves of one stage with bounded parallelism.
//!
//! Every stack in a wave gets its own task. The wave is a barrier: the
//! executor waits for all dispatched members, including ones whose siblings
//! already failed, before deciding whether the next wave may start.

use crate::config::StrataConfig;
use crate::credentials::CredentialProvider;
use crate::dag::scheduler::{Stage, StageScheduler, Wave};
use crate::dag::state::{ExecutionTimer, PipelineSummary, StackResult, StageResult, WaveResult};
use crate::errors::ProvisioningError;
use crate::naming::Environment;
use crate::provision::{ProvisionContext, Provisioner};
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

/// Events emitted during a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The definition changed and a new plan replaced the running one.
    PlanReplaced {
        previous: String,
        current: String,
        resume_stage: Option<String>,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    WaveStarted {
        stage: String,
        wave: String,
        stacks: Vec<String>,
    },
    StackStarted {
        stack: String,
        wave: String,
    },
    /// A stack finished (success or failure).
    StackCompleted {
        stack: String,
        result: Box<StackResult>,
    },
    StackSkipped {
        stack: String,
        wave: String,
    },
    WaveCompleted {
        wave: String,
        success_count: usize,
        failed_count: usize,
    },
    StageCompleted {
        stage: String,
        success: bool,
    },
    PipelineCompleted {
        success: bool,
        summary: PipelineSummary,
    },
}

/// Configuration for the stage executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on concurrent provisioning calls.
    pub max_parallel: usize,
    /// Deadline forwarded to every provisioning call.
    pub provision_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            provision_timeout: None,
        }
    }
}

impl ExecutorConfig {
    pub fn from_config(config: &StrataConfig) -> Self {
        Self {
            max_parallel: config.max_parallel(),
            provision_timeout: config.provision_timeout(),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

/// Executes stages against a provisioner.
pub struct StageExecutor {
    config: ExecutorConfig,
    env: Environment,
    provisioner: Arc<dyn Provisioner>,
    credentials: Arc<dyn CredentialProvider>,
    semaphore: Arc<Semaphore>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl StageExecutor {
    pub fn new(
        config: ExecutorConfig,
        env: Environment,
        provisioner: Arc<dyn Provisioner>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel.max(1)));
        Self {
            config,
            env,
            provisioner,
            credentials,
            semaphore,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Execute every wave of `stage` in order.
    ///
    /// Stacks listed in `done` already succeeded in an earlier plan and are
    /// reported with their recorded result instead of being dispatched. After
    /// a failing wave, the remaining waves are reported skipped.
    pub async fn execute_stage(
        &self,
        stage: &Stage,
        scheduler: &mut StageScheduler,
        done: &HashMap<String, StackResult>,
    ) -> StageResult {
        let timer = ExecutionTimer::start();
        let mut waves = Vec::with_capacity(stage.waves.len());
        let mut failed = false;

        for wave in &stage.waves {
            let result = if failed {
                self.skip_wave(stage, wave, scheduler).await
            } else {
                self.execute_wave(stage, wave, scheduler, done).await
            };
            failed |= !result.success();
            waves.push(result);
        }

        StageResult {
            name: stage.name.clone(),
            waves,
            duration: timer.elapsed(),
        }
    }

    /// Report every member of `stage` skipped without dispatching anything.
    pub async fn skip_stage(&self, stage: &Stage, scheduler: &mut StageScheduler) -> StageResult {
        let mut waves = Vec::with_capacity(stage.waves.len());
        for wave in &stage.waves {
            waves.push(self.skip_wave(stage, wave, scheduler).await);
        }
        StageResult {
            name: stage.name.clone(),
            waves,
            duration: Duration::ZERO,
        }
    }

    async fn skip_wave(
        &self,
        stage: &Stage,
        wave: &Wave,
        scheduler: &mut StageScheduler,
    ) -> WaveResult {
        let mut stacks = Vec::with_capacity(wave.members.len());
        for name in &wave.members {
            scheduler.mark_skipped(name);
            self.emit_event(PipelineEvent::StackSkipped {
                stack: name.clone(),
                wave: wave.name.clone(),
            })
            .await;
            stacks.push(StackResult::skipped(name, &stage.name, &wave.name));
        }
        WaveResult {
            name: wave.name.clone(),
            stacks,
        }
    }

    async fn execute_wave(
        &self,
        stage: &Stage,
        wave: &Wave,
        scheduler: &mut StageScheduler,
        done: &HashMap<String, StackResult>,
    ) -> WaveResult {
        info!(stage = %stage.name, wave = %wave.name, stacks = ?wave.members, "Wave started");
        self.emit_event(PipelineEvent::WaveStarted {
            stage: stage.name.clone(),
            wave: wave.name.clone(),
            stacks: wave.members.clone(),
        })
        .await;

        let mut slots: Vec<Option<StackResult>> = vec![None; wave.members.len()];
        let mut handles = Vec::new();

        for (slot, name) in wave.members.iter().enumerate() {
            if let Some(previous) = done.get(name).filter(|r| r.success) {
                debug!(stack = %name, "Stack already executed, keeping recorded result");
                scheduler.mark_completed(name);
                slots[slot] = Some(previous.clone());
                continue;
            }

            let Some(stack) = scheduler.stack(name).cloned() else {
                slots[slot] = Some(StackResult::failure(
                    name,
                    &stage.name,
                    &wave.name,
                    "stack missing from plan",
                    Duration::ZERO,
                ));
                continue;
            };

            scheduler.mark_running(name);
            self.emit_event(PipelineEvent::StackStarted {
                stack: name.clone(),
                wave: wave.name.clone(),
            })
            .await;

            let task = StackTask {
                stack,
                stage: stage.name.clone(),
                wave: wave.name.clone(),
                env: self.env.clone(),
                deadline: self.config.provision_timeout,
                provisioner: self.provisioner.clone(),
                credentials: self.credentials.clone(),
                semaphore: self.semaphore.clone(),
            };
            handles.push((slot, name.clone(), tokio::spawn(task.run())));
        }

        let (meta, joins): (Vec<(usize, String)>, Vec<_>) = handles
            .into_iter()
            .map(|(slot, name, handle)| ((slot, name), handle))
            .unzip();
        let joined = futures::future::join_all(joins).await;

        for ((slot, name), outcome) in meta.into_iter().zip(joined) {
            let result = outcome.unwrap_or_else(|e| {
                StackResult::failure(
                    &name,
                    &stage.name,
                    &wave.name,
                    &format!("Stack task panicked: {}", e),
                    Duration::ZERO,
                )
            });

            if result.success {
                scheduler.mark_completed(&name);
            } else {
                scheduler.mark_failed(&name, result.error.as_deref().unwrap_or("Unknown error"));
            }

            self.emit_event(PipelineEvent::StackCompleted {
                stack: name,
                result: Box::new(result.clone()),
            })
            .await;
            slots[slot] = Some(result);
        }

        let stacks: Vec<StackResult> = slots.into_iter().flatten().collect();
        let wave_result = WaveResult {
            name: wave.name.clone(),
            stacks,
        };

        let failed_count = wave_result.failed_count();
        if failed_count > 0 {
            warn!(stage = %stage.name, wave = %wave.name, failed = failed_count, "Wave failed");
        }
        self.emit_event(PipelineEvent::WaveCompleted {
            wave: wave.name.clone(),
            success_count: wave_result.stacks.len() - failed_count,
            failed_count,
        })
        .await;

        wave_result
    }

    /// Emit an event to the event channel if configured.
    pub(crate) async fn emit_event(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

/// Everything one spawned stack execution owns.
struct StackTask {
    stack: Arc<Stack>,
    stage: String,
    wave: String,
    env: Environment,
    deadline: Option<Duration>,
    provisioner: Arc<dyn Provisioner>,
    credentials: Arc<dyn CredentialProvider>,
    semaphore: Arc<Semaphore>,
}

impl StackTask {
    async fn run(self) -> StackResult {
        let timer = ExecutionTimer::start();
        let name = self.stack.name().to_string();

        let outcome = match self.semaphore.clone().acquire_owned().await {
            Ok(_permit) => self.provision().await,
            Err(e) => Err(ProvisioningError::failed(&name, e.to_string())),
        };

        match outcome {
            Ok(outcome) => {
                info!(
                    stack = %name,
                    wave = %self.wave,
                    handles = outcome.resolved.len(),
                    "Stack provisioned"
                );
                let elapsed = timer.elapsed();
                StackResult::success(&name, &self.stage, &self.wave, outcome.resolved, elapsed)
                    .with_exports(outcome.exports)
                    .with_role(outcome.role)
            }
            Err(e) => {
                error!(stack = %name, wave = %self.wave, error = %e, "Stack failed");
                let result = StackResult::failure(
                    &name,
                    &self.stage,
                    &self.wave,
                    &e.to_string(),
                    timer.elapsed(),
                );
                match e.invariant() {
                    Some(invariant) => result.with_invariant(invariant.clone()),
                    None => result,
                }
            }
        }
    }

    async fn provision(&self) -> Result<crate::stack::StackOutcome, ProvisioningError> {
        let token = self
            .credentials
            .token(self.stack.region(), self.stack.account(), &self.env.stage)
            .await
            .map_err(|e| ProvisioningError::Credentials {
                stack: self.stack.name().to_string(),
                message: format!("{:#}", e),
            })?;

        let ctx = ProvisionContext {
            stage: self.env.stage.clone(),
            token,
            deadline: self.deadline,
        };

        self.stack.execute(&self.env, self.provisioner.as_ref(), &ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{AuthToken, StaticCredentialProvider};
    use crate::dag::scheduler::StackStatus;
    use crate::provision::{SimulatedProvisioner, StackDefinition};
    use crate::resource::{ResourceHandle, ResourceKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn env() -> Environment {
        Environment::new("dev", "123456789012", "us-east-1", "acme")
    }

    fn stack(name: &str, produces: &[&str]) -> Arc<Stack> {
        let mut s = Stack::new(name, "us-east-1", "123456789012");
        for id in produces {
            s.declare_produced(ResourceHandle::create(ResourceKind::Table, *id));
        }
        Arc::new(s)
    }

    fn credentials() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentialProvider::new(AuthToken::new("token")))
    }

    /// Fails every stack whose name is listed.
    struct FailingProvisioner {
        failing: Vec<String>,
        inner: SimulatedProvisioner,
    }

    #[async_trait]
    impl Provisioner for FailingProvisioner {
        async fn provision(
            &self,
            definition: &StackDefinition,
            ctx: &ProvisionContext,
        ) -> Result<HashMap<String, String>, ProvisioningError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.failing.contains(&definition.name) {
                return Err(ProvisioningError::failed(&definition.name, "quota exceeded"));
            }
            self.inner.provision(definition, ctx).await
        }
    }

    /// Tracks the peak number of concurrent provisioning calls.
    #[derive(Default)]
    struct CountingProvisioner {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn provision(
            &self,
            definition: &StackDefinition,
            _ctx: &ProvisionContext,
        ) -> Result<HashMap<String, String>, ProvisioningError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(definition
                .produces
                .iter()
                .map(|r| (r.id.clone(), format!("arn:{}", r.id)))
                .collect())
        }
    }

    fn two_wave_stage() -> (Stage, StageScheduler) {
        let stacks = vec![
            stack("a", &["a-out"]),
            stack("b", &["b-out"]),
            stack("c", &["c-out"]),
            stack("d", &["d-out"]),
        ];
        let scheduler = StageScheduler::from_stacks(stacks).unwrap();
        let stage = Stage {
            name: "Main".to_string(),
            waves: vec![
                Wave {
                    name: "Main-wave-1".to_string(),
                    members: vec!["a".into(), "b".into(), "c".into()],
                },
                Wave {
                    name: "Main-wave-2".to_string(),
                    members: vec!["d".into()],
                },
            ],
        };
        (stage, scheduler)
    }

    #[tokio::test]
    async fn test_stage_succeeds() {
        let (stage, mut scheduler) = two_wave_stage();
        let executor = StageExecutor::new(
            ExecutorConfig::default(),
            env(),
            Arc::new(SimulatedProvisioner::new()),
            credentials(),
        );

        let result = executor.execute_stage(&stage, &mut scheduler, &HashMap::new()).await;

        assert!(result.success());
        assert_eq!(result.stacks().count(), 4);
        assert!(scheduler.all_success());
        let a = result.stacks().find(|r| r.stack == "a").unwrap();
        assert_eq!(
            a.resolved["a-out"],
            "arn:aws:dynamodb:us-east-1:123456789012:table/acme-a-out-dev"
        );
    }

    #[tokio::test]
    async fn test_failure_lets_siblings_finish_and_skips_later_waves() {
        let (stage, mut scheduler) = two_wave_stage();
        let executor = StageExecutor::new(
            ExecutorConfig::default(),
            env(),
            Arc::new(FailingProvisioner {
                failing: vec!["b".to_string()],
                inner: SimulatedProvisioner::new(),
            }),
            credentials(),
        );

        let result = executor.execute_stage(&stage, &mut scheduler, &HashMap::new()).await;

        assert!(!result.success());
        let first = &result.waves[0];
        assert_eq!(first.stacks.iter().filter(|r| r.success).count(), 2);
        assert_eq!(first.failed_count(), 1);
        assert!(result.waves[1].stacks[0].skipped);
        assert_eq!(scheduler.get_node("d").unwrap().status, StackStatus::Skipped);

        let failures = result.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].stack, "b");
        assert_eq!(failures[0].wave, "Main-wave-1");
        assert!(failures[0].error.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_concurrency() {
        let stacks: Vec<Arc<Stack>> = (0..6).map(|i| stack(&format!("s{}", i), &[])).collect();
        let members = stacks.iter().map(|s| s.name().to_string()).collect();
        let mut scheduler = StageScheduler::from_stacks(stacks).unwrap();
        let stage = Stage {
            name: "Wide".to_string(),
            waves: vec![Wave {
                name: "Wide-wave-1".to_string(),
                members,
            }],
        };

        let provisioner = Arc::new(CountingProvisioner::default());
        let executor = StageExecutor::new(
            ExecutorConfig::default().with_max_parallel(2),
            env(),
            provisioner.clone(),
            credentials(),
        );

        let result = executor.execute_stage(&stage, &mut scheduler, &HashMap::new()).await;
        assert!(result.success());
        assert!(provisioner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_credential_failure_is_reported_without_token() {
        struct NoCredentials;

        #[async_trait]
        impl CredentialProvider for NoCredentials {
            async fn token(&self, _r: &str, _a: &str, _s: &str) -> anyhow::Result<AuthToken> {
                anyhow::bail!("no token for stage")
            }
        }

        let (stage, mut scheduler) = two_wave_stage();
        let executor = StageExecutor::new(
            ExecutorConfig::default(),
            env(),
            Arc::new(SimulatedProvisioner::new()),
            Arc::new(NoCredentials),
        );

        let result = executor.execute_stage(&stage, &mut scheduler, &HashMap::new()).await;
        assert!(!result.success());
        let error = result.waves[0].stacks[0].error.clone().unwrap();
        assert!(error.contains("no token for stage"));
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let (stage, mut scheduler) = two_wave_stage();
        let (tx, mut rx) = mpsc::channel(64);
        let executor = StageExecutor::new(
            ExecutorConfig::default(),
            env(),
            Arc::new(SimulatedProvisioner::new()),
            credentials(),
        )
        .with_event_channel(tx);

        executor.execute_stage(&stage, &mut scheduler, &HashMap::new()).await;
        drop(executor);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            let json = serde_json::to_value(&event).unwrap();
            kinds.push(json["type"].as_str().unwrap().to_string());
        }

        assert_eq!(kinds.first().map(String::as_str), Some("wave_started"));
        assert_eq!(kinds.iter().filter(|k| *k == "stack_completed").count(), 4);
        assert_eq!(kinds.last().map(String::as_str), Some("wave_completed"));
    }

    #[tokio::test]
    async fn test_recorded_results_are_not_dispatched() {
        let (stage, mut scheduler) = two_wave_stage();
        let provisioner = Arc::new(SimulatedProvisioner::new());
        let executor = StageExecutor::new(
            ExecutorConfig::default(),
            env(),
            provisioner.clone(),
            credentials(),
        );

        let mut done = HashMap::new();
        done.insert(
            "a".to_string(),
            StackResult::success("a", "Main", "Main-wave-1", Default::default(), Duration::ZERO),
        );

        let result = executor.execute_stage(&stage, &mut scheduler, &done).await;
        assert!(result.success());
        assert!(!provisioner.history().contains(&"a".to_string()));
        assert_eq!(provisioner.history().len(), 3);
    }
}
