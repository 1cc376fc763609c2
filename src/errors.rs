//! Typed error hierarchy for the strata pipeline.
//!
//! Four enums cover the four failure families:
//! - `HandleError` - single-assignment violations on a resource handle
//! - `GraphError` - the stack set cannot be ordered into stages
//! - `ProvisioningError` - an external provisioning call failed
//! - `PipelineError` - top-level run failures with stage/wave/stack context

use std::time::Duration;
use thiserror::Error;

/// Invariant violations on a [`crate::resource::ResourceHandle`].
///
/// Both variants indicate a scheduling bug rather than an environmental
/// failure and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("Handle '{handle}' was read before its producing stack executed")]
    UnresolvedReference { handle: String },

    #[error("Handle '{handle}' was resolved twice")]
    DoubleResolution { handle: String },
}

/// Errors raised while turning a set of stacks into an ordered plan.
///
/// Always reported before any stack executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cycle detected in stack dependencies. Involved stacks: {stacks:?}")]
    DependencyCycle { stacks: Vec<String> },

    #[error("Duplicate stack name: {0}")]
    DuplicateStack(String),

    #[error("Handle '{handle}' is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        handle: String,
        first: String,
        second: String,
    },

    #[error("Stack '{stack}' consumes handle '{handle}' but no stack produces it")]
    UnknownProducer { stack: String, handle: String },

    #[error("Stage '{stage}' names unknown stack '{stack}'")]
    UnknownStageMember { stage: String, stack: String },

    #[error("Stack '{stack}' is assigned to more than one stage")]
    DuplicateStageMember { stack: String },

    #[error("Stack '{stack}' is not assigned to any explicit stage")]
    UnassignedStack { stack: String },

    #[error("Stack '{stack}' depends on '{dependency}' which is placed in a later stage")]
    StageOrderViolation { stack: String, dependency: String },
}

/// Failures of the external provisioning collaborator, scoped to one stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisioningError {
    #[error("Provisioning stack '{stack}' failed: {message}")]
    Failed { stack: String, message: String },

    #[error("Provisioner reported no identifier for handle '{handle}' of stack '{stack}'")]
    MissingIdentifier { stack: String, handle: String },

    #[error("Provisioning stack '{stack}' exceeded its deadline of {after:?}")]
    DeadlineExceeded { stack: String, after: Duration },

    #[error("Credentials unavailable for stack '{stack}': {message}")]
    Credentials { stack: String, message: String },

    #[error(transparent)]
    Reference(#[from] HandleError),
}

impl ProvisioningError {
    /// Convenience constructor used by provisioner implementations.
    pub fn failed(stack: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            stack: stack.into(),
            message: message.into(),
        }
    }

    /// The invariant violation behind this failure, if any.
    pub fn invariant(&self) -> Option<&HandleError> {
        match self {
            Self::Reference(e) => Some(e),
            _ => None,
        }
    }
}

/// A stack failure reported with the wave it ran in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFailure {
    pub stack: String,
    pub wave: String,
    pub error: String,
}

impl std::fmt::Display for StackFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (wave {}): {}", self.stack, self.wave, self.error)
    }
}

/// Top-level errors from building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] HandleError),

    #[error("Stage '{stage}' failed: {}", format_failures(.failures))]
    StageFailed {
        stage: String,
        failures: Vec<StackFailure>,
    },

    #[error("Failed to synthesize pipeline definition: {0}")]
    Definition(#[source] anyhow::Error),
}

fn format_failures(failures: &[StackFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_error_carries_handle_id() {
        let err = HandleError::UnresolvedReference {
            handle: "orders-table".to_string(),
        };
        assert!(err.to_string().contains("orders-table"));
        assert!(matches!(err, HandleError::UnresolvedReference { .. }));
    }

    #[test]
    fn graph_error_cycle_lists_stacks() {
        let err = GraphError::DependencyCycle {
            stacks: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("\"a\""));
        assert!(msg.contains("\"b\""));
    }

    #[test]
    fn provisioning_error_converts_from_handle_error() {
        let inner = HandleError::DoubleResolution {
            handle: "bucket".to_string(),
        };
        let err: ProvisioningError = inner.clone().into();
        assert_eq!(err.invariant(), Some(&inner));
        assert!(ProvisioningError::failed("s", "boom").invariant().is_none());
    }

    #[test]
    fn pipeline_error_stage_failed_reports_context() {
        let err = PipelineError::StageFailed {
            stage: "persistence".to_string(),
            failures: vec![StackFailure {
                stack: "bucket".to_string(),
                wave: "persistence-wave-0".to_string(),
                error: "quota exceeded".to_string(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("persistence"));
        assert!(msg.contains("bucket (wave persistence-wave-0): quota exceeded"));
    }

    #[test]
    fn pipeline_error_converts_from_graph_error() {
        let err: PipelineError = GraphError::DuplicateStack("dynamo".to_string()).into();
        assert!(matches!(err, PipelineError::Graph(GraphError::DuplicateStack(_))));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&HandleError::DoubleResolution { handle: "x".into() });
        assert_std_error(&GraphError::DuplicateStack("x".into()));
        assert_std_error(&ProvisioningError::failed("x", "y"));
        assert_std_error(&PipelineError::Definition(anyhow::anyhow!("bad toml")));
    }
}
