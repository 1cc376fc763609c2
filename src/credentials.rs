//! Credential collaborator interface.
//!
//! The core fetches an opaque [`AuthToken`] per stack and forwards it to the
//! provisioner untouched. Tokens never reach log or output paths: `Debug`
//! is redacted and there is no `Display` or `Serialize` implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Environment variable read by [`EnvCredentialProvider`] by default.
pub const DEFAULT_TOKEN_VAR: &str = "STRATA_AUTH_TOKEN";

/// An opaque authentication token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw token, for handing to the provisioning backend only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Supplies a token for a `(region, account, stage)` target.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn token(&self, region: &str, account: &str, stage: &str) -> Result<AuthToken>;
}

/// Reads the token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    var: String,
}

impl EnvCredentialProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_VAR)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn token(&self, _region: &str, _account: &str, _stage: &str) -> Result<AuthToken> {
        let value = std::env::var(&self.var)
            .with_context(|| format!("Environment variable {} is not set", self.var))?;
        Ok(AuthToken::new(value))
    }
}

/// Hands out the same token for every target.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    token: AuthToken,
}

impl StaticCredentialProvider {
    pub fn new(token: AuthToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn token(&self, _region: &str, _account: &str, _stage: &str) -> Result<AuthToken> {
        Ok(self.token.clone())
    }
}
