//! `engine` crate: plan model, dependency analysis, the dependency graph,
//! change detection, and the build executor.

pub mod models;
pub mod error;
pub mod analyze;
pub mod dag;
pub mod hash;
pub mod staleness;
pub mod config;
pub mod probe;
pub mod executor;
pub mod inspect;

pub use models::{ImportSpec, Plan, TargetSpec, Trigger, TriggerMode};
pub use error::EngineError;
pub use dag::DependencyGraph;
pub use config::{Backend, EngineConfig};
pub use executor::{MakeReport, PlanExecutor};
pub use staleness::Reason;
