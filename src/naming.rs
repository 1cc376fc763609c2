//! Deterministic naming for generated resources.
//!
//! Every physical name is derived from the environment's name prefix and
//! stage so that the same definition deployed to two environments never
//! collides.

use serde::{Deserialize, Serialize};

/// The `(stage, account, region, name_prefix)` tuple supplied by the
/// configuration collaborator. Values are passed through unvalidated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub stage: String,
    pub account: String,
    pub region: String,
    pub name_prefix: String,
}

impl Environment {
    pub fn new(
        stage: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            account: account.into(),
            region: region.into(),
            name_prefix: name_prefix.into(),
        }
    }

    pub fn naming(&self) -> NamingConvention<'_> {
        NamingConvention { env: self }
    }
}

/// Name derivations over an [`Environment`].
#[derive(Debug, Clone, Copy)]
pub struct NamingConvention<'a> {
    env: &'a Environment,
}

impl NamingConvention<'_> {
    /// `{prefix}-{name}`
    pub fn resource_name(&self, name: &str) -> String {
        if self.env.name_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", self.env.name_prefix, name)
        }
    }

    /// `{prefix}-{name}-{stage}`
    pub fn stack_name(&self, name: &str) -> String {
        self.resource_name(&format!("{}-{}", name, self.env.stage))
    }

    /// Export names follow the stack naming scheme.
    pub fn export_name(&self, export: &str) -> String {
        self.stack_name(export)
    }

    /// `{prefix}-{role}-policy-{stage}`
    pub fn policy_name(&self, role: &str) -> String {
        self.stack_name(&format!("{}-policy", role))
    }

    /// Every function deployed under this prefix.
    pub fn function_arn_pattern(&self) -> String {
        format!(
            "arn:aws:lambda:{}:{}:function:{}",
            self.env.region,
            self.env.account,
            self.resource_name("*")
        )
    }

    /// The stage secret. Secrets carry a random suffix, hence the wildcard.
    pub fn secret_arn(&self) -> String {
        format!(
            "arn:aws:secretsmanager:{}:{}:secret:{}-*",
            self.env.region,
            self.env.account,
            self.resource_name(&self.env.stage)
        )
    }
}
