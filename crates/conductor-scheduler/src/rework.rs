//! Bounded rework policy.
//!
//! Pure decision function mapping an agent result to a step disposition.
//! Termination is provable by construction: every rework consumes one
//! attempt from a per-lineage counter bounded by the configured ceiling, so
//! no retry loop can run unbounded.

use crate::types::StepExecution;
use conductor_core::{AgentKind, AgentResult, AgentStatus};

/// Disposition of a step after applying the policy to its agent result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReworkDecision {
    /// The step succeeded; checkpoint and complete it.
    Complete,
    /// Allocate a fresh attempt routed to `target`.
    Rework {
        /// Capability that should re-attempt the step.
        target: AgentKind,
    },
    /// The step fails terminally with the given reason.
    Fail {
        /// Human-readable failure reason, surfaced on the run.
        reason: String,
    },
}

/// Decide a step's disposition from its agent result.
///
/// The ceiling bounds rework per step lineage (keyed by the original step
/// number), not globally; independent steps each get the full allowance. A
/// `needs_rework` result must name its own target; the policy never invents
/// one.
pub fn decide(result: &AgentResult, step: &StepExecution, ceiling: u32) -> ReworkDecision {
    match result.status {
        AgentStatus::Complete => ReworkDecision::Complete,
        AgentStatus::NeedsRework => {
            let Some(target) = result.rework_target else {
                return ReworkDecision::Fail {
                    reason: format!(
                        "step {} requested rework without naming a target agent",
                        step.step_number
                    ),
                };
            };
            if step.reworks_used() >= ceiling {
                return ReworkDecision::Fail {
                    reason: format!(
                        "step {} exhausted its rework ceiling ({ceiling}) after {} attempts",
                        step.step_number, step.attempt_count
                    ),
                };
            }
            ReworkDecision::Rework { target }
        }
        AgentStatus::Blocked => ReworkDecision::Fail {
            reason: format!(
                "step {} blocked: {}",
                step.step_number,
                join_issues(result)
            ),
        },
        AgentStatus::Failed => ReworkDecision::Fail {
            reason: format!(
                "step {} failed: {}",
                step.step_number,
                join_issues(result)
            ),
        },
    }
}

fn join_issues(result: &AgentResult) -> String {
    if result.issues.is_empty() {
        result.summary.clone()
    } else {
        result.issues.join("; ")
    }
}
