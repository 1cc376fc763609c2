//! Declarative pipeline definition, read from `.strata/pipeline.toml`.
//!
//! ```toml
//! [[stacks]]
//! name = "dynamo"
//! [[stacks.produces]]
//! id = "orders"
//! kind = "table"
//! extra_scopes = ["index/*"]
//!
//! [[stacks]]
//! name = "permission"
//! [stacks.role]
//! name = "lambda-role"
//! managed_policies = ["service-role/AWSLambdaBasicExecutionRole"]
//! export = "lambda-role-arn"
//! [[stacks.role.grants]]
//! handles = ["orders"]
//! actions = ["dynamodb:*"]
//!
//! [[stages]]
//! name = "Persistence"
//! stacks = ["dynamo"]
//! ```
//!
//! The definition is re-read before every stage; see
//! [`crate::pipeline::PipelineOrchestrator`].

use crate::dag::ExplicitStage;
use crate::errors::GraphError;
use crate::naming::Environment;
use crate::policy::PolicyAggregator;
use crate::resource::{ResourceHandle, ResourceKind};
use crate::stack::{RoleTemplate, Stack};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A handle a stack produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSpec {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_scopes: Vec<String>,
}

/// Access to a group of handles with a set of actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSpec {
    pub handles: Vec<String>,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_principal: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_policies: Vec<String>,
    #[serde(default)]
    pub grants: Vec<GrantSpec>,
    #[serde(default)]
    pub invoke_prefixed_functions: bool,
    #[serde(default)]
    pub read_stage_secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
    pub name: String,
    /// Defaults to the environment's region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Defaults to the environment's account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default)]
    pub produces: Vec<HandleSpec>,
    /// Ids of handles produced by other stacks.
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub stacks: Vec<String>,
    #[serde(default)]
    pub sequential: bool,
}

/// The complete pipeline.toml structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub stacks: Vec<StackSpec>,
    /// Explicit stages. When empty, stages are derived from dependencies.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl PipelineDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write pipeline definition: {}", path.display()))?;
        Ok(())
    }

    /// The api / persistence / permission pipeline written by `strata init`.
    pub fn sample() -> Self {
        let stack = |name: &str, produces: Vec<HandleSpec>| StackSpec {
            name: name.to_string(),
            region: None,
            account: None,
            produces,
            consumes: Vec::new(),
            role: None,
        };
        let handle = |id: &str, kind: ResourceKind, extra: &[&str]| HandleSpec {
            id: id.to_string(),
            kind,
            extra_scopes: extra.iter().map(|s| s.to_string()).collect(),
        };
        let stage = |name: &str, stacks: &[&str]| StageSpec {
            name: name.to_string(),
            stacks: stacks.iter().map(|s| s.to_string()).collect(),
            sequential: false,
        };

        let mut permission = stack("permission", Vec::new());
        permission.role = Some(RoleSpec {
            name: "lambda-role".to_string(),
            trust_principal: None,
            managed_policies: vec!["service-role/AWSLambdaBasicExecutionRole".to_string()],
            grants: vec![
                GrantSpec {
                    handles: vec!["orders-table".to_string()],
                    actions: vec!["dynamodb:*".to_string()],
                },
                GrantSpec {
                    handles: vec!["api-bucket".to_string()],
                    actions: vec!["s3:*".to_string()],
                },
            ],
            invoke_prefixed_functions: true,
            read_stage_secret: true,
            export: Some("lambda-role-arn".to_string()),
        });

        Self {
            stacks: vec![
                stack("apigateway", vec![handle("api", ResourceKind::Function, &[])]),
                stack("dynamo", vec![handle("orders-table", ResourceKind::Table, &["index/*"])]),
                stack("bucket", vec![handle("api-bucket", ResourceKind::Bucket, &[])]),
                permission,
            ],
            stages: vec![
                stage("ApiGwStage", &["apigateway"]),
                stage("PersistenceResources", &["dynamo", "bucket"]),
                stage("PermissionStage", &["permission"]),
            ],
        }
    }

    /// Explicit stage declarations.
    pub fn explicit_stages(&self) -> Vec<ExplicitStage> {
        self.stages
            .iter()
            .map(|s| ExplicitStage {
                name: s.name.clone(),
                members: s.stacks.clone(),
                sequential: s.sequential,
            })
            .collect()
    }

    /// Construct fresh, unresolved stacks for `env`.
    ///
    /// Every consumed or granted id is bound to the one handle its producer
    /// declares, so resolving it in the producer is visible to consumers.
    pub fn materialize(&self, env: &Environment) -> Result<Vec<Stack>, GraphError> {
        let mut handles: HashMap<String, (ResourceHandle, usize)> = HashMap::new();
        let mut declare = |id: &str, handle: ResourceHandle, owner: usize| {
            if let Some((_, first)) = handles.get(id) {
                return Err(GraphError::DuplicateProducer {
                    handle: id.to_string(),
                    first: self.stacks[*first].name.clone(),
                    second: self.stacks[owner].name.clone(),
                });
            }
            handles.insert(id.to_string(), (handle, owner));
            Ok(())
        };

        for (owner, spec) in self.stacks.iter().enumerate() {
            for produced in &spec.produces {
                let handle = ResourceHandle::create(produced.kind, produced.id.as_str())
                    .with_extra_scopes(produced.extra_scopes.iter().cloned());
                declare(&produced.id, handle, owner)?;
            }
            if let Some(role) = &spec.role {
                let handle = ResourceHandle::create(ResourceKind::Role, role.name.as_str());
                declare(&role.name, handle, owner)?;
            }
        }

        let lookup = |stack: &str, id: &str| {
            handles
                .get(id)
                .cloned()
                .ok_or_else(|| GraphError::UnknownProducer {
                    stack: stack.to_string(),
                    handle: id.to_string(),
                })
        };

        let mut stacks = Vec::with_capacity(self.stacks.len());
        for spec in &self.stacks {
            let mut stack = Stack::new(
                spec.name.as_str(),
                spec.region.clone().unwrap_or_else(|| env.region.clone()),
                spec.account.clone().unwrap_or_else(|| env.account.clone()),
            );
            for produced in &spec.produces {
                stack.declare_produced(lookup(&spec.name, &produced.id)?.0);
            }
            if let Some(role) = &spec.role {
                stack.declare_produced(lookup(&spec.name, &role.name)?.0);
            }
            for consumed in &spec.consumes {
                stack.declare_consumed(lookup(&spec.name, consumed)?.0);
            }
            stacks.push(stack);
        }

        for (index, spec) in self.stacks.iter().enumerate() {
            let Some(role) = &spec.role else { continue };

            let mut aggregator = PolicyAggregator::new(role.name.as_str());
            if let Some(principal) = &role.trust_principal {
                aggregator = aggregator.with_trust_principal(principal.as_str());
            }
            for policy in &role.managed_policies {
                aggregator = aggregator.with_managed_policy(policy.as_str());
            }

            for grant in &role.grants {
                // One source per producing stack, in first-mention order
                let mut groups: Vec<(usize, Vec<ResourceHandle>)> = Vec::new();
                for id in &grant.handles {
                    let (handle, owner) = lookup(&spec.name, id)?;
                    match groups.iter_mut().find(|(o, _)| *o == owner) {
                        Some((_, group)) => group.push(handle),
                        None => groups.push((owner, vec![handle])),
                    }
                }
                for (owner, group) in groups {
                    aggregator.add_source(&stacks[owner], &group, grant.actions.iter().cloned())?;
                }
            }

            let mut template = RoleTemplate::new(aggregator)
                .with_function_invoke(role.invoke_prefixed_functions)
                .with_stage_secret(role.read_stage_secret);
            if let Some(export) = &role.export {
                template = template.with_export(export.as_str());
            }

            let with_role = stacks[index].clone().with_role(template);
            stacks[index] = with_role;
        }

        Ok(stacks)
    }
}

/// Produces the current pipeline definition on demand.
pub trait DefinitionSource: Send + Sync {
    fn synthesize(&self) -> Result<PipelineDefinition>;
}

/// Reads the definition from a TOML file each time it is synthesized.
#[derive(Debug, Clone)]
pub struct FileDefinitionSource {
    path: PathBuf,
}

impl FileDefinitionSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DefinitionSource for FileDefinitionSource {
    fn synthesize(&self) -> Result<PipelineDefinition> {
        PipelineDefinition::load(&self.path)
    }
}

impl DefinitionSource for PipelineDefinition {
    fn synthesize(&self) -> Result<PipelineDefinition> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env() -> Environment {
        Environment::new("dev", "123456789012", "us-east-1", "acme")
    }

    #[test]
    fn test_parse_definition() {
        let content = r#"
[[stacks]]
name = "dynamo"
region = "eu-west-1"
[[stacks.produces]]
id = "orders"
kind = "table"
extra_scopes = ["index/*"]

[[stacks]]
name = "service"
consumes = ["orders"]

[[stages]]
name = "Data"
stacks = ["dynamo"]
sequential = true

[[stages]]
name = "Compute"
stacks = ["service"]
"#;
        let definition = PipelineDefinition::parse(content).unwrap();
        assert_eq!(definition.stacks.len(), 2);
        assert_eq!(definition.stacks[0].produces[0].kind, ResourceKind::Table);
        assert_eq!(definition.stacks[0].produces[0].extra_scopes, vec!["index/*"]);
        assert_eq!(definition.stacks[1].consumes, vec!["orders"]);

        let explicit = definition.explicit_stages();
        assert!(explicit[0].sequential);
        assert_eq!(explicit[1].members, vec!["service"]);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let content = r#"
[[stacks]]
name = "queue"
[[stacks.produces]]
id = "jobs"
kind = "queue"
"#;
        assert!(PipelineDefinition::parse(content).is_err());
    }

    #[test]
    fn test_materialize_shares_handles_between_producer_and_consumer() {
        let definition = PipelineDefinition::parse(
            r#"
[[stacks]]
name = "dynamo"
[[stacks.produces]]
id = "orders"
kind = "table"

[[stacks]]
name = "service"
consumes = ["orders"]
"#,
        )
        .unwrap();

        let stacks = definition.materialize(&env()).unwrap();
        assert_eq!(stacks[0].region(), "us-east-1");
        assert_eq!(stacks[0].account(), "123456789012");

        stacks[0].handle("orders").unwrap().resolve("arn:orders").unwrap();
        assert_eq!(stacks[1].consumed()[0].read().unwrap(), "arn:orders");
    }

    #[test]
    fn test_materialize_sample_role_stack() {
        let stacks = PipelineDefinition::sample().materialize(&env()).unwrap();
        let permission = stacks.iter().find(|s| s.name() == "permission").unwrap();

        assert!(permission.produces("lambda-role"));
        let consumed: Vec<&str> = permission.consumed().iter().map(|h| h.id()).collect();
        assert_eq!(consumed, vec!["orders-table", "api-bucket"]);

        let template = permission.role().unwrap();
        assert_eq!(template.aggregator().source_stacks(), vec!["dynamo", "bucket"]);
        assert_eq!(template.export.as_deref(), Some("lambda-role-arn"));
    }

    #[test]
    fn test_grant_spanning_two_producers_splits_sources() {
        let definition = PipelineDefinition::parse(
            r#"
[[stacks]]
name = "a"
[[stacks.produces]]
id = "t1"
kind = "table"

[[stacks]]
name = "b"
[[stacks.produces]]
id = "t2"
kind = "table"

[[stacks]]
name = "perm"
[stacks.role]
name = "role"
[[stacks.role.grants]]
handles = ["t1", "t2"]
actions = ["dynamodb:GetItem"]
"#,
        )
        .unwrap();

        let stacks = definition.materialize(&env()).unwrap();
        let aggregator = stacks[2].role().unwrap().aggregator();
        assert_eq!(aggregator.source_stacks(), vec!["a", "b"]);
    }

    #[test]
    fn test_materialize_unknown_handle() {
        let definition = PipelineDefinition::parse(
            r#"
[[stacks]]
name = "service"
consumes = ["missing"]
"#,
        )
        .unwrap();

        let err = definition.materialize(&env()).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownProducer {
                stack: "service".to_string(),
                handle: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_materialize_duplicate_producer() {
        let definition = PipelineDefinition::parse(
            r#"
[[stacks]]
name = "a"
[[stacks.produces]]
id = "shared"
kind = "bucket"

[[stacks]]
name = "b"
[[stacks.produces]]
id = "shared"
kind = "bucket"
"#,
        )
        .unwrap();

        let err = definition.materialize(&env()).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateProducer { ref second, .. } if second == "b"));
    }

    #[test]
    fn test_save_and_synthesize_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        PipelineDefinition::sample().save(&path).unwrap();

        let source = FileDefinitionSource::new(&path);
        let definition = source.synthesize().unwrap();
        assert_eq!(definition, PipelineDefinition::sample());
    }

    #[test]
    fn test_synthesize_missing_file() {
        let dir = tempdir().unwrap();
        let source = FileDefinitionSource::new(dir.path().join("absent.toml"));
        let err = source.synthesize().unwrap_err();
        assert!(err.to_string().contains("Failed to read pipeline definition"));
    }
}
