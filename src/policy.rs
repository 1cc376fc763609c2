//! Least-privilege policy aggregation across stacks.
//!
//! A [`PolicyAggregator`] records which handles of which producing stacks a
//! role needs, and with which actions. [`PolicyAggregator::build`] can only
//! succeed once every recorded handle is resolved, so a stack carrying an
//! aggregator must be scheduled after all of its producers.

use crate::errors::{GraphError, HandleError};
use crate::resource::ResourceHandle;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Trust principal used when none is given.
pub const DEFAULT_TRUST_PRINCIPAL: &str = "lambda.amazonaws.com";

/// Policy document language version.
pub const POLICY_VERSION: &str = "2012-10-17";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Effect {
    #[default]
    Allow,
    Deny,
}

/// A single permission statement. Actions and scopes are kept sorted and
/// deduplicated so rendered documents are byte-stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Effect")]
    pub effect: Effect,
    #[serde(rename = "Action")]
    pub actions: BTreeSet<String>,
    #[serde(rename = "Resource")]
    pub resource_scopes: BTreeSet<String>,
}

impl PolicyStatement {
    pub fn allow<A, R>(actions: A, resource_scopes: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect: Effect::Allow,
            actions: actions.into_iter().map(Into::into).collect(),
            resource_scopes: resource_scopes.into_iter().map(Into::into).collect(),
        }
    }

    /// An explicit deny, which overrides any allow on the same scopes.
    pub fn deny<A, R>(actions: A, resource_scopes: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            effect: Effect::Deny,
            ..Self::allow(actions, resource_scopes)
        }
    }
}

/// The permission artifact handed to the role-issuing collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRole {
    pub name: String,
    pub statements: Vec<PolicyStatement>,
    pub trust_principal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,
}

impl AggregatedRole {
    /// Render the inline policy document.
    pub fn policy_document(&self) -> serde_json::Value {
        serde_json::json!({
            "Version": POLICY_VERSION,
            "Statement": self.statements,
        })
    }

    /// All scopes allowed for statements containing `action`.
    pub fn scopes_for(&self, action: &str) -> BTreeSet<&str> {
        self.statements
            .iter()
            .filter(|s| s.effect == Effect::Allow && s.actions.contains(action))
            .flat_map(|s| s.resource_scopes.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct PolicySource {
    stack: String,
    handles: Vec<ResourceHandle>,
    actions: BTreeSet<String>,
}

/// Collects handles from producing stacks and emits scoped statements.
#[derive(Debug, Clone)]
pub struct PolicyAggregator {
    role_name: String,
    trust_principal: String,
    managed_policies: Vec<String>,
    sources: Vec<PolicySource>,
    extra_statements: Vec<PolicyStatement>,
}

impl PolicyAggregator {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            trust_principal: DEFAULT_TRUST_PRINCIPAL.to_string(),
            managed_policies: Vec::new(),
            sources: Vec::new(),
            extra_statements: Vec::new(),
        }
    }

    pub fn with_trust_principal(mut self, principal: impl Into<String>) -> Self {
        self.trust_principal = principal.into();
        self
    }

    pub fn with_managed_policy(mut self, policy: impl Into<String>) -> Self {
        self.managed_policies.push(policy.into());
        self
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn trust_principal(&self) -> &str {
        &self.trust_principal
    }

    pub fn managed_policies(&self) -> &[String] {
        &self.managed_policies
    }

    /// Recorded `(stack, handles, actions)` grants, in source order.
    pub fn sources(&self) -> impl Iterator<Item = (&str, &[ResourceHandle], &BTreeSet<String>)> {
        self.sources
            .iter()
            .map(|s| (s.stack.as_str(), s.handles.as_slice(), &s.actions))
    }

    /// Record handles produced by `stack`, granted `actions`.
    ///
    /// Every handle must be one the stack declares as produced.
    pub fn add_source<A>(
        &mut self,
        stack: &Stack,
        handles: &[ResourceHandle],
        actions: A,
    ) -> Result<(), GraphError>
    where
        A: IntoIterator,
        A::Item: Into<String>,
    {
        for handle in handles {
            if !stack.produces(handle.id()) {
                return Err(GraphError::UnknownProducer {
                    stack: stack.name().to_string(),
                    handle: handle.id().to_string(),
                });
            }
        }
        self.sources.push(PolicySource {
            stack: stack.name().to_string(),
            handles: handles.to_vec(),
            actions: actions.into_iter().map(Into::into).collect(),
        });
        Ok(())
    }

    /// Append a statement whose scopes do not come from handles.
    pub fn add_statement(&mut self, statement: PolicyStatement) {
        self.extra_statements.push(statement);
    }

    /// Every recorded handle, in source order.
    pub fn handles(&self) -> impl Iterator<Item = &ResourceHandle> {
        self.sources.iter().flat_map(|s| s.handles.iter())
    }

    /// Names of the stacks whose handles were recorded, in source order.
    pub fn source_stacks(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for source in &self.sources {
            if !seen.contains(&source.stack.as_str()) {
                seen.push(source.stack.as_str());
            }
        }
        seen
    }

    /// Build the role. Fails if any recorded handle is still unresolved.
    pub fn build(&self) -> Result<AggregatedRole, HandleError> {
        let mut statements = Vec::with_capacity(self.sources.len() + self.extra_statements.len());

        for source in &self.sources {
            let mut scopes = BTreeSet::new();
            for handle in &source.handles {
                scopes.extend(handle.policy_scopes()?);
            }
            statements.push(PolicyStatement {
                effect: Effect::Allow,
                actions: source.actions.clone(),
                resource_scopes: scopes,
            });
        }
        statements.extend(self.extra_statements.iter().cloned());

        Ok(AggregatedRole {
            name: self.role_name.clone(),
            statements,
            trust_principal: self.trust_principal.clone(),
            managed_policies: self.managed_policies.clone(),
        })
    }
}
