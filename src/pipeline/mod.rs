//! Pipeline definition, planning, and orchestration.
//!
//! - [`PipelineDefinition`] - the declarative `pipeline.toml`
//! - [`Pipeline`] - a validated stage plan with its fingerprint
//! - [`PipelineOrchestrator`] - runs a plan, re-planning before every stage

pub mod definition;
pub mod orchestrator;
pub mod plan;

pub use definition::{
    DefinitionSource, FileDefinitionSource, GrantSpec, HandleSpec, PipelineDefinition, RoleSpec,
    StackSpec, StageSpec,
};
pub use orchestrator::{PipelineOrchestrator, PipelineResult};
pub use plan::{Pipeline, fingerprint};
