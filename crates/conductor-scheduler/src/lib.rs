//! Execution scheduler for validated multi-agent delivery plans.
//!
//! Takes an execution plan through validation, then drives it to a terminal
//! run state: dependency-ordered dispatch with declared parallel batches,
//! bounded rework on agent feedback, human approval gates resolved from
//! decision artifacts, and a git checkpoint commit after every completed
//! step.
//!
//! # Main types
//!
//! - [`Scheduler`] — Stateful engine executing one run to completion.
//! - [`PlanValidator`] — Structural validation and deterministic plan normalization.
//! - [`ExecutionPlan`] / [`Run`] — The immutable plan and its mutable execution record.
//! - [`GateResolver`] — Polls human-review decision artifacts for blocked gates.
//! - [`GitCheckpointer`] — Per-step checkpoint commits via the git CLI.
//! - [`SchedulerConfig`] — Workspace path, rework ceiling, timeouts, PR policy.

/// Per-step checkpoint commits and pull-request creation.
pub mod checkpoint;
/// Scheduler, platform, and project configuration.
pub mod config;
/// The execution engine.
pub mod engine;
/// Human approval gate resolution.
pub mod gate;
/// Dependency-graph readiness and batching queries.
pub mod graph;
/// Bounded rework policy.
pub mod rework;
/// Plan, run, and step types.
pub mod types;
/// Plan validation and normalization.
pub mod validator;

pub use checkpoint::{checkpoint_message, Checkpointer, GitCheckpointer};
pub use config::{MandatoryGate, PlatformRules, ProjectRules, SchedulerConfig};
pub use engine::{Scheduler, TickOutcome};
pub use gate::{GateResolver, GateSignal};
pub use rework::{decide, ReworkDecision};
pub use types::{
    Complexity, ExecutionPlan, HumanGate, PlanStep, Run, RunOutcome, RunStatus, StepExecution,
    StepState,
};
pub use validator::{PlanValidator, ValidationError, ValidationErrorKind};
