//! Deferred, single-assignment references to provisioned resources.
//!
//! A [`ResourceHandle`] is created unresolved when a pipeline is defined and
//! receives its identifier exactly once, when the owning stack executes.
//! Clones share the same slot, so a consuming stack holding a clone observes
//! the identifier as soon as the producer resolves it.

use crate::errors::HandleError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Kind of cloud resource a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Table,
    Bucket,
    Role,
    Secret,
    Function,
}

impl ResourceKind {
    /// Service namespace used when synthesizing identifiers.
    pub fn service(&self) -> &'static str {
        match self {
            ResourceKind::Table => "dynamodb",
            ResourceKind::Bucket => "s3",
            ResourceKind::Role => "iam",
            ResourceKind::Secret => "secretsmanager",
            ResourceKind::Function => "lambda",
        }
    }

    /// The scope a permission statement grants for a bare identifier.
    ///
    /// Buckets grant object-level access (`{arn}/*`); every other kind is
    /// granted on the identifier itself.
    pub fn base_scope(&self, identifier: &str) -> String {
        match self {
            ResourceKind::Bucket => format!("{}/*", identifier),
            _ => identifier.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Table => "table",
            ResourceKind::Bucket => "bucket",
            ResourceKind::Role => "role",
            ResourceKind::Secret => "secret",
            ResourceKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// A typed, deferred reference to a resource identifier.
///
/// Equality and hashing use the handle id only; the resolution slot is
/// shared between clones.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: String,
    kind: ResourceKind,
    extra_scopes: Vec<String>,
    resolved: Arc<OnceLock<String>>,
}

impl ResourceHandle {
    /// Create an unresolved handle.
    pub fn create(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            extra_scopes: Vec::new(),
            resolved: Arc::new(OnceLock::new()),
        }
    }

    /// Attach sub-path scopes (e.g. `index/*` for a table's secondary indexes).
    pub fn with_extra_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn extra_scopes(&self) -> &[String] {
        &self.extra_scopes
    }

    /// Whether the owning stack has resolved this handle.
    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    /// Set the identifier. Callable at most once across all clones.
    pub fn resolve(&self, identifier: impl Into<String>) -> Result<(), HandleError> {
        self.resolved
            .set(identifier.into())
            .map_err(|_| HandleError::DoubleResolution {
                handle: self.id.clone(),
            })
    }

    /// Read the identifier, failing if the producer has not run yet.
    pub fn read(&self) -> Result<String, HandleError> {
        self.resolved
            .get()
            .cloned()
            .ok_or_else(|| HandleError::UnresolvedReference {
                handle: self.id.clone(),
            })
    }

    /// `{identifier}` followed by `{identifier}/{suffix}` for each suffix.
    pub fn scoped<S: AsRef<str>>(&self, suffixes: &[S]) -> Result<Vec<String>, HandleError> {
        let identifier = self.read()?;
        let mut scopes = Vec::with_capacity(suffixes.len() + 1);
        scopes.push(identifier.clone());
        for suffix in suffixes {
            scopes.push(format!("{}/{}", identifier, suffix.as_ref()));
        }
        Ok(scopes)
    }

    /// Scopes a permission statement should cover for this handle: the
    /// kind's base scope plus one scope per extra scope.
    pub fn policy_scopes(&self) -> Result<Vec<String>, HandleError> {
        let identifier = self.read()?;
        let mut scopes = vec![self.kind.base_scope(&identifier)];
        scopes.extend(
            self.extra_scopes
                .iter()
                .map(|suffix| format!("{}/{}", identifier, suffix)),
        );
        Ok(scopes)
    }

    /// Whether two handles share the same resolution slot.
    pub fn same_slot(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.resolved, &other.resolved)
    }
}

impl PartialEq for ResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ResourceHandle {}

impl std::hash::Hash for ResourceHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
