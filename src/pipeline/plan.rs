//! An ordered, validated plan of stages and its fingerprint.

use crate::dag::{ExplicitStage, Stage, StageScheduler};
use crate::errors::GraphError;
use crate::naming::Environment;
use crate::pipeline::PipelineDefinition;
use crate::stack::Stack;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Stages ready to execute, with the stacks they reference.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Stage>,
    scheduler: StageScheduler,
    fingerprint: String,
}

impl Pipeline {
    /// Validate `stacks` and order them into stages.
    pub fn build(stacks: Vec<Stack>, explicit: &[ExplicitStage]) -> Result<Self, GraphError> {
        let scheduler = StageScheduler::from_stacks(stacks.into_iter().map(Arc::new).collect())?;
        let stages = scheduler.plan(explicit)?;
        let fingerprint = fingerprint(scheduler.graph().stacks(), &stages);

        Ok(Self {
            stages,
            scheduler,
            fingerprint,
        })
    }

    /// Materialize `definition` for `env` and plan it.
    pub fn from_definition(
        definition: &PipelineDefinition,
        env: &Environment,
    ) -> Result<Self, GraphError> {
        let stacks = definition.materialize(env)?;
        Self::build(stacks, &definition.explicit_stages())
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn stack(&self, name: &str) -> Option<&Arc<Stack>> {
        self.scheduler.stack(name)
    }

    pub fn stacks(&self) -> &[Arc<Stack>] {
        self.scheduler.graph().stacks()
    }

    pub fn stack_count(&self) -> usize {
        self.scheduler.stack_count()
    }

    /// Index of the stage containing `stack`.
    pub fn stage_of(&self, stack: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.stacks().any(|s| s == stack))
    }

    pub fn scheduler(&self) -> &StageScheduler {
        &self.scheduler
    }

    pub(crate) fn scheduler_mut(&mut self) -> &mut StageScheduler {
        &mut self.scheduler
    }

    /// The stage plan rendered as canonical JSON.
    pub fn describe(&self) -> Value {
        describe(self.stacks(), &self.stages)
    }

    /// Stacks whose rendering differs from `previous`, plus everything that
    /// transitively depends on one of them.
    pub fn stale_stacks(&self, previous: &Pipeline) -> HashSet<String> {
        let mut stale: HashSet<String> = self
            .stacks()
            .iter()
            .filter(|stack| {
                previous
                    .stack(stack.name())
                    .is_none_or(|old| describe_stack(old) != describe_stack(stack))
            })
            .map(|stack| stack.name().to_string())
            .collect();

        loop {
            let before = stale.len();
            for stack in self.stacks() {
                if stale.contains(stack.name()) {
                    continue;
                }
                let upstream_stale = stack
                    .dependencies(self.stacks().iter().map(|s| &**s))
                    .iter()
                    .any(|dependency| stale.contains(dependency.name()));
                if upstream_stale {
                    stale.insert(stack.name().to_string());
                }
            }
            if stale.len() == before {
                return stale;
            }
        }
    }
}

fn describe(stacks: &[Arc<Stack>], stages: &[Stage]) -> Value {
    let stacks: Vec<Value> = stacks.iter().map(|s| describe_stack(s)).collect();
    json!({ "stages": stages, "stacks": stacks })
}

fn describe_stack(stack: &Stack) -> Value {
    let produces: Vec<Value> = stack
        .produced()
        .iter()
        .map(|h| json!({ "id": h.id(), "kind": h.kind(), "extra_scopes": h.extra_scopes() }))
        .collect();
    let consumes: Vec<&str> = stack.consumed().iter().map(|h| h.id()).collect();

    let role = stack.role().map(|template| {
        let aggregator = template.aggregator();
        let grants: Vec<Value> = aggregator
            .sources()
            .map(|(source, handles, actions)| {
                let handles: Vec<&str> = handles.iter().map(|h| h.id()).collect();
                json!({ "stack": source, "handles": handles, "actions": actions })
            })
            .collect();
        json!({
            "name": aggregator.role_name(),
            "trust_principal": aggregator.trust_principal(),
            "managed_policies": aggregator.managed_policies(),
            "grants": grants,
            "invoke_prefixed_functions": template.invoke_prefixed_functions,
            "read_stage_secret": template.read_stage_secret,
            "export": template.export,
        })
    });

    json!({
        "name": stack.name(),
        "region": stack.region(),
        "account": stack.account(),
        "produces": produces,
        "consumes": consumes,
        "role": role,
    })
}

/// SHA-256 of the canonical JSON rendering of a plan.
pub fn fingerprint(stacks: &[Arc<Stack>], stages: &[Stage]) -> String {
    let canonical = describe(stacks, stages).to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}
