//! Stage/wave scheduling and execution for stack graphs.
//!
//! Stacks form a directed acyclic graph through the handles they consume.
//! This module orders that graph into sequential stages of parallel waves
//! and executes them.
//!
//! ## Architecture
//!
//! 1. **Builder** - Derives dependency edges from consumed handles and validates the graph
//! 2. **Scheduler** - Layers stacks into stages and waves, honoring explicit stage barriers
//! 3. **Executor** - Runs the waves of a stage concurrently behind a semaphore
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use strata::dag::StageScheduler;
//! use strata::resource::{ResourceHandle, ResourceKind};
//! use strata::stack::Stack;
//!
//! let table = ResourceHandle::create(ResourceKind::Table, "orders");
//! let mut dynamo = Stack::new("dynamo", "us-east-1", "123456789012");
//! dynamo.declare_produced(table.clone());
//! let mut service = Stack::new("service", "us-east-1", "123456789012");
//! service.declare_consumed(table);
//!
//! let scheduler = StageScheduler::from_stacks(vec![Arc::new(dynamo), Arc::new(service)]).unwrap();
//! let waves = scheduler.compute_waves().unwrap();
//! // Wave 0: [dynamo]
//! // Wave 1: [service] - consumes the table dynamo produces
//! assert_eq!(waves, vec![vec!["dynamo"], vec!["service"]]);
//! ```

mod builder;
mod executor;
mod scheduler;
mod state;

pub use builder::{DagBuilder, StackGraph, StackIndex};
pub use executor::{ExecutorConfig, PipelineEvent, StageExecutor};
pub use scheduler::{ExplicitStage, Stage, StackNode, StackStatus, StageScheduler, Wave};
pub(crate) use state::duration_serde;
pub use state::{ExecutionTimer, PipelineSummary, RunState, StackResult, StageResult, WaveResult};
