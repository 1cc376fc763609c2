//! Execution state tracking for pipeline runs.
//!
//! This module provides types for tracking the state of a run, including
//! per-stack results and their roll-up into waves, stages, and the summary.

use crate::errors::{HandleError, StackFailure};
use crate::policy::AggregatedRole;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Overall state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Every stage completed
    Completed,
    /// A stage failed and later stages were not entered
    Failed,
}

impl RunState {
    pub fn from_success(success: bool) -> Self {
        if success { Self::Completed } else { Self::Failed }
    }
}

/// Result of executing a single stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackResult {
    pub stack: String,
    pub stage: String,
    pub wave: String,
    /// Whether the stack provisioned and resolved its handles
    pub success: bool,
    /// The stack was never dispatched
    #[serde(default)]
    pub skipped: bool,
    /// Error message if the stack failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handle invariant violated while executing, if any.
    #[serde(skip)]
    pub invariant: Option<HandleError>,
    /// Produced handle id → resolved identifier
    #[serde(default)]
    pub resolved: BTreeMap<String, String>,
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Role issued by a permission stack
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<AggregatedRole>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl StackResult {
    /// Create a successful stack result.
    pub fn success(
        stack: &str,
        stage: &str,
        wave: &str,
        resolved: BTreeMap<String, String>,
        duration: Duration,
    ) -> Self {
        Self {
            stack: stack.to_string(),
            stage: stage.to_string(),
            wave: wave.to_string(),
            success: true,
            skipped: false,
            error: None,
            invariant: None,
            resolved,
            exports: BTreeMap::new(),
            role: None,
            duration,
        }
    }

    /// Create a failed stack result.
    pub fn failure(stack: &str, stage: &str, wave: &str, error: &str, duration: Duration) -> Self {
        Self {
            stack: stack.to_string(),
            stage: stage.to_string(),
            wave: wave.to_string(),
            success: false,
            skipped: false,
            error: Some(error.to_string()),
            invariant: None,
            resolved: BTreeMap::new(),
            exports: BTreeMap::new(),
            role: None,
            duration,
        }
    }

    /// Create a result for a stack that was never dispatched.
    pub fn skipped(stack: &str, stage: &str, wave: &str) -> Self {
        Self {
            skipped: true,
            error: Some("skipped due to earlier failure".to_string()),
            ..Self::failure(stack, stage, wave, "", Duration::ZERO)
        }
    }

    pub fn with_exports(mut self, exports: BTreeMap<String, String>) -> Self {
        self.exports = exports;
        self
    }

    pub fn with_role(mut self, role: Option<AggregatedRole>) -> Self {
        self.role = role;
        self
    }

    pub fn with_invariant(mut self, invariant: HandleError) -> Self {
        self.invariant = Some(invariant);
        self
    }

    /// Whether the stack failed while executing (as opposed to being skipped).
    pub fn is_failure(&self) -> bool {
        !self.success && !self.skipped
    }

    /// Failure record with full stage/wave context.
    pub fn failure_record(&self) -> Option<StackFailure> {
        self.is_failure().then(|| StackFailure {
            stack: self.stack.clone(),
            wave: self.wave.clone(),
            error: self.error.clone().unwrap_or_default(),
        })
    }
}

/// Results of one wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveResult {
    pub name: String,
    pub stacks: Vec<StackResult>,
}

impl WaveResult {
    pub fn success(&self) -> bool {
        self.stacks.iter().all(|r| r.success)
    }

    pub fn failed_count(&self) -> usize {
        self.stacks.iter().filter(|r| r.is_failure()).count()
    }
}

/// Results of one stage. The stage fails when any member fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub waves: Vec<WaveResult>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl StageResult {
    pub fn success(&self) -> bool {
        self.waves.iter().all(WaveResult::success)
    }

    /// Whether no member of the stage was dispatched.
    pub fn skipped(&self) -> bool {
        self.stacks().all(|r| r.skipped)
    }

    pub fn stacks(&self) -> impl Iterator<Item = &StackResult> {
        self.waves.iter().flat_map(|w| w.stacks.iter())
    }

    pub fn failures(&self) -> Vec<StackFailure> {
        self.stacks().filter_map(StackResult::failure_record).collect()
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Total stacks in the plan
    pub total_stacks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub stack_results: HashMap<String, StackResult>,
}

impl PipelineSummary {
    pub fn new(total_stacks: usize) -> Self {
        Self {
            total_stacks,
            ..Default::default()
        }
    }

    /// Add a stack result to the summary, replacing any earlier one.
    pub fn add_result(&mut self, result: StackResult) {
        if let Some(previous) = self.stack_results.remove(&result.stack) {
            self.uncount(&previous);
        }
        if result.success {
            self.completed += 1;
        } else if result.skipped {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
        self.stack_results.insert(result.stack.clone(), result);
    }

    fn uncount(&mut self, result: &StackResult) {
        if result.success {
            self.completed -= 1;
        } else if result.skipped {
            self.skipped -= 1;
        } else {
            self.failed -= 1;
        }
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.completed == self.total_stacks
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_stacks == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total_stacks as f64) * 100.0
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(id.to_string(), format!("arn:{}", id))])
    }

    #[test]
    fn test_run_state_from_success() {
        assert_eq!(RunState::from_success(true), RunState::Completed);
        assert_eq!(RunState::from_success(false), RunState::Failed);
        assert_eq!(serde_json::to_string(&RunState::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_stack_result_failure_record_carries_context() {
        let result = StackResult::failure(
            "bucket",
            "Persistence",
            "Persistence-wave-1",
            "quota",
            Duration::ZERO,
        );
        let failure = result.failure_record().unwrap();
        assert_eq!(failure.to_string(), "bucket (wave Persistence-wave-1): quota");

        let skipped = StackResult::skipped("permission", "Permission", "Permission-wave-1");
        assert!(skipped.failure_record().is_none());
        assert!(!skipped.is_failure());
    }

    #[test]
    fn test_stage_result_fails_when_any_member_fails() {
        let wave = "Persistence-wave-1";
        let stage = StageResult {
            name: "Persistence".to_string(),
            waves: vec![WaveResult {
                name: wave.to_string(),
                stacks: vec![
                    StackResult::success("a", "Persistence", wave, resolved("a"), Duration::ZERO),
                    StackResult::failure("b", "Persistence", wave, "boom", Duration::ZERO),
                    StackResult::success("c", "Persistence", wave, resolved("c"), Duration::ZERO),
                ],
            }],
            duration: Duration::ZERO,
        };

        assert!(!stage.success());
        assert!(!stage.skipped());
        assert_eq!(stage.waves[0].failed_count(), 1);
        assert_eq!(stage.failures().len(), 1);
    }

    #[test]
    fn test_pipeline_summary() {
        let mut summary = PipelineSummary::new(4);

        let secs = Duration::from_secs;
        summary.add_result(StackResult::success("api", "s1", "w1", resolved("api"), secs(1)));
        summary.add_result(StackResult::success("dynamo", "s2", "w1", resolved("t"), secs(2)));
        summary.add_result(StackResult::failure("bucket", "s2", "w1", "denied", secs(3)));
        summary.add_result(StackResult::skipped("permission", "s3", "w1"));

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.all_success());
        assert_eq!(summary.completion_percentage(), 50.0);
    }

    #[test]
    fn test_summary_replaces_earlier_result() {
        let mut summary = PipelineSummary::new(1);
        summary.add_result(StackResult::skipped("api", "s1", "w1"));
        let api = StackResult::success("api", "s1", "w1", resolved("api"), Duration::ZERO);
        summary.add_result(api);

        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.completed, 1);
        assert!(summary.all_success());
    }

    #[test]
    fn test_stack_result_serialization() {
        let result = StackResult::success(
            "api",
            "s1",
            "s1-wave-1",
            resolved("api"),
            Duration::from_millis(1500),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["resolved"]["api"], "arn:api");
        assert!(json.get("error").is_none());
    }
}
