//! Provisioning collaborator interface.
//!
//! The core calls [`Provisioner::provision`] once per stack. It is the only
//! place real infrastructure changes happen; everything else in the crate
//! is planning and bookkeeping.

use crate::credentials::AuthToken;
use crate::errors::ProvisioningError;
use crate::policy::AggregatedRole;
use crate::resource::ResourceKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// A resource the stack must create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedResource {
    pub id: String,
    pub kind: ResourceKind,
    pub physical_name: String,
}

/// The role a stack must issue, with its inline policy name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub policy_name: String,
    pub role: AggregatedRole,
}

/// Everything the provisioner needs to deploy one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefinition {
    pub name: String,
    pub physical_name: String,
    pub region: String,
    pub account: String,
    pub produces: Vec<ProducedResource>,
    /// Consumed handle id → resolved identifier.
    pub consumes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleDefinition>,
}

/// Per-call context forwarded to the provisioner.
#[derive(Debug, Clone)]
pub struct ProvisionContext {
    pub stage: String,
    pub token: AuthToken,
    /// Caller-supplied bound on the provisioning call.
    pub deadline: Option<Duration>,
}

/// Performs the provisioning action for a stack.
///
/// Returns the resolved identifier of every produced handle, keyed by
/// handle id.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        definition: &StackDefinition,
        ctx: &ProvisionContext,
    ) -> Result<HashMap<String, String>, ProvisioningError>;
}

/// Dry-run provisioner that synthesizes ARN-shaped identifiers.
///
/// Identifiers depend only on the definition, so repeated runs produce the
/// same values.
#[derive(Debug, Default)]
pub struct SimulatedProvisioner {
    history: Mutex<Vec<String>>,
}

impl SimulatedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the stacks provisioned so far, in call order.
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// The identifier a resource of `kind` would receive.
    pub fn identifier(kind: ResourceKind, region: &str, account: &str, name: &str) -> String {
        match kind {
            ResourceKind::Table => {
                format!("arn:aws:dynamodb:{}:{}:table/{}", region, account, name)
            }
            ResourceKind::Bucket => format!("arn:aws:s3:::{}", name),
            ResourceKind::Role => format!("arn:aws:iam::{}:role/{}", account, name),
            ResourceKind::Secret => {
                format!("arn:aws:secretsmanager:{}:{}:secret:{}", region, account, name)
            }
            ResourceKind::Function => {
                format!("arn:aws:lambda:{}:{}:function:{}", region, account, name)
            }
        }
    }
}

#[async_trait]
impl Provisioner for SimulatedProvisioner {
    async fn provision(
        &self,
        definition: &StackDefinition,
        _ctx: &ProvisionContext,
    ) -> Result<HashMap<String, String>, ProvisioningError> {
        if let Ok(mut history) = self.history.lock() {
            history.push(definition.name.clone());
        }
        Ok(definition
            .produces
            .iter()
            .map(|r| {
                let region = &definition.region;
                let account = &definition.account;
                let identifier = Self::identifier(r.kind, region, account, &r.physical_name);
                (r.id.clone(), identifier)
            })
            .collect())
    }
}
