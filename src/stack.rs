//! Deployable stacks.
//!
//! A [`Stack`] is composed of a [`Producer`] (handles it owns and resolves)
//! and a [`Consumer`] (handles owned by other stacks that it reads). An
//! optional [`RoleTemplate`] turns the stack into a permission stack that
//! aggregates its consumed handles into a single role.

use crate::errors::{HandleError, ProvisioningError};
use crate::naming::Environment;
use crate::policy::{AggregatedRole, PolicyAggregator, PolicyStatement};
use crate::provision::{
    ProducedResource, ProvisionContext, Provisioner, RoleDefinition, StackDefinition,
};
use crate::resource::{ResourceHandle, ResourceKind};
use std::collections::BTreeMap;
use tracing::debug;

/// Handles a stack owns. Only the owning stack resolves them.
#[derive(Debug, Clone, Default)]
pub struct Producer {
    handles: Vec<ResourceHandle>,
}

impl Producer {
    /// Declare a handle; re-declaring the same id is a no-op.
    pub fn declare(&mut self, handle: ResourceHandle) {
        if !self.contains(handle.id()) {
            self.handles.push(handle);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handles.iter().any(|h| h.id() == id)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceHandle> {
        self.handles.iter().find(|h| h.id() == id)
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }
}

/// Handles a stack borrows from other stacks.
#[derive(Debug, Clone, Default)]
pub struct Consumer {
    handles: Vec<ResourceHandle>,
}

impl Consumer {
    pub fn declare(&mut self, handle: ResourceHandle) {
        if !self.handles.iter().any(|h| h.id() == handle.id()) {
            self.handles.push(handle);
        }
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    /// Resolved identifiers of every consumed handle.
    pub fn read_all(&self) -> Result<BTreeMap<String, String>, HandleError> {
        self.handles
            .iter()
            .map(|h| h.read().map(|id| (h.id().to_string(), id)))
            .collect()
    }
}

/// Describes the execution role a permission stack issues.
#[derive(Debug, Clone)]
pub struct RoleTemplate {
    aggregator: PolicyAggregator,
    /// Grant `lambda:InvokeFunction` on every prefixed function.
    pub invoke_prefixed_functions: bool,
    /// Grant `secretsmanager:GetSecretValue` on the stage secret.
    pub read_stage_secret: bool,
    /// Export name for the issued role identifier.
    pub export: Option<String>,
}

impl RoleTemplate {
    pub fn new(aggregator: PolicyAggregator) -> Self {
        Self {
            aggregator,
            invoke_prefixed_functions: false,
            read_stage_secret: false,
            export: None,
        }
    }

    pub fn with_function_invoke(mut self, enabled: bool) -> Self {
        self.invoke_prefixed_functions = enabled;
        self
    }

    pub fn with_stage_secret(mut self, enabled: bool) -> Self {
        self.read_stage_secret = enabled;
        self
    }

    pub fn with_export(mut self, export: impl Into<String>) -> Self {
        self.export = Some(export.into());
        self
    }

    pub fn aggregator(&self) -> &PolicyAggregator {
        &self.aggregator
    }

    /// Build the role for `env`. Fails while any granted handle is unresolved.
    pub fn build(&self, env: &Environment) -> Result<AggregatedRole, HandleError> {
        let naming = env.naming();
        let mut aggregator = self.aggregator.clone();
        if self.invoke_prefixed_functions {
            aggregator.add_statement(PolicyStatement::allow(
                ["lambda:InvokeFunction"],
                [naming.function_arn_pattern()],
            ));
        }
        if self.read_stage_secret {
            aggregator.add_statement(PolicyStatement::allow(
                ["secretsmanager:GetSecretValue"],
                [naming.secret_arn()],
            ));
        }
        aggregator.build()
    }
}

/// What a successful [`Stack::execute`] produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackOutcome {
    /// Produced handle id → identifier.
    pub resolved: BTreeMap<String, String>,
    pub role: Option<AggregatedRole>,
    /// Export name → value.
    pub exports: BTreeMap<String, String>,
}

/// A named deployable unit.
#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    region: String,
    account: String,
    producer: Producer,
    consumer: Consumer,
    role: Option<RoleTemplate>,
}

impl Stack {
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            account: account.into(),
            producer: Producer::default(),
            consumer: Consumer::default(),
            role: None,
        }
    }

    /// Attach a role template. The stack produces the role handle and
    /// consumes every handle the template grants access to.
    pub fn with_role(mut self, template: RoleTemplate) -> Self {
        let role_handle =
            ResourceHandle::create(ResourceKind::Role, template.aggregator().role_name());
        self.declare_produced(role_handle);
        let granted: Vec<ResourceHandle> = template.aggregator().handles().cloned().collect();
        for handle in granted {
            self.declare_consumed(handle);
        }
        self.role = Some(template);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn role(&self) -> Option<&RoleTemplate> {
        self.role.as_ref()
    }

    pub fn declare_produced(&mut self, handle: ResourceHandle) {
        self.producer.declare(handle);
    }

    /// Record a dependency on a handle owned by another stack.
    pub fn declare_consumed(&mut self, handle: ResourceHandle) {
        self.consumer.declare(handle);
    }

    pub fn produces(&self, id: &str) -> bool {
        self.producer.contains(id)
    }

    pub fn produced(&self) -> &[ResourceHandle] {
        self.producer.handles()
    }

    pub fn consumed(&self) -> &[ResourceHandle] {
        self.consumer.handles()
    }

    /// The produced handle with the given id.
    pub fn handle(&self, id: &str) -> Option<&ResourceHandle> {
        self.producer.get(id)
    }

    /// Stacks in `stacks` producing a handle this stack consumes, in the
    /// order they appear in `stacks`.
    pub fn dependencies<'a, I>(&self, stacks: I) -> Vec<&'a Stack>
    where
        I: IntoIterator<Item = &'a Stack>,
    {
        stacks
            .into_iter()
            .filter(|candidate| self.consumed().iter().any(|h| candidate.produces(h.id())))
            .collect()
    }

    /// Whether every produced handle has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.produced().iter().all(ResourceHandle::is_resolved)
    }

    /// Snapshot handed to the provisioner.
    pub fn definition(
        &self,
        env: &Environment,
        role: Option<AggregatedRole>,
    ) -> Result<StackDefinition, HandleError> {
        let naming = env.naming();
        let produces = self
            .produced()
            .iter()
            .map(|h| ProducedResource {
                id: h.id().to_string(),
                kind: h.kind(),
                physical_name: naming.stack_name(h.id()),
            })
            .collect();

        Ok(StackDefinition {
            name: self.name.clone(),
            physical_name: naming.stack_name(&self.name),
            region: self.region.clone(),
            account: self.account.clone(),
            produces,
            consumes: self.consumer.read_all()?,
            role: role.map(|role| RoleDefinition {
                policy_name: naming.policy_name(&role.name),
                role,
            }),
        })
    }

    /// Provision this stack and resolve every produced handle.
    ///
    /// Handles are only resolved once the provisioner has reported an
    /// identifier for all of them.
    pub async fn execute(
        &self,
        env: &Environment,
        provisioner: &dyn Provisioner,
        ctx: &ProvisionContext,
    ) -> Result<StackOutcome, ProvisioningError> {
        let role = self.role.as_ref().map(|t| t.build(env)).transpose()?;
        let definition = self.definition(env, role.clone())?;

        debug!(stack = %self.name, physical_name = %definition.physical_name, "Provisioning stack");

        let call = provisioner.provision(&definition, ctx);
        let identifiers = match ctx.deadline {
            Some(after) => tokio::time::timeout(after, call).await.map_err(|_| {
                ProvisioningError::DeadlineExceeded {
                    stack: self.name.clone(),
                    after,
                }
            })??,
            None => call.await?,
        };

        let mut resolved = BTreeMap::new();
        for handle in self.produced() {
            let identifier = identifiers.get(handle.id()).ok_or_else(|| {
                ProvisioningError::MissingIdentifier {
                    stack: self.name.clone(),
                    handle: handle.id().to_string(),
                }
            })?;
            resolved.insert(handle.id().to_string(), identifier.clone());
        }

        let mut exports = BTreeMap::new();
        if let Some(template) = &self.role
            && let Some(export) = &template.export
        {
            let role_name = template.aggregator().role_name();
            let role_id = resolved.get(role_name).ok_or_else(|| {
                ProvisioningError::MissingIdentifier {
                    stack: self.name.clone(),
                    handle: role_name.to_string(),
                }
            })?;
            exports.insert(env.naming().export_name(export), role_id.clone());
        }

        for handle in self.produced() {
            handle.resolve(resolved[handle.id()].clone())?;
        }

        Ok(StackOutcome {
            resolved,
            role,
            exports,
        })
    }

    /// Re-apply identifiers recorded from an earlier execution.
    pub fn restore(&self, resolved: &BTreeMap<String, String>) -> Result<(), HandleError> {
        for handle in self.produced() {
            if let Some(identifier) = resolved.get(handle.id()) {
                if !handle.is_resolved() {
                    handle.resolve(identifier.clone())?;
                }
            }
        }
        Ok(())
    }
}
