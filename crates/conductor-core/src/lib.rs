//! Core types and error definitions for the Conductor workflow engine.
//!
//! This crate provides the foundational types shared across all Conductor
//! crates: the unified error enum, the closed set of agent capabilities, and
//! the structured result descriptor an agent execution backend returns to the
//! scheduler.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum for all Conductor subsystems.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentKind`] — Closed enumeration of registered agent capabilities.
//! - [`AgentStatus`] / [`AgentResult`] — Result descriptor produced by an
//!   agent execution backend.
//! - [`AgentRunner`] — Collaborator trait the scheduler dispatches steps to.

/// Human-review decision artifacts for approval gates.
pub mod review;
/// The agent execution collaborator seam.
pub mod runner;

pub use review::{ReviewArtifact, ReviewStatus};
pub use runner::AgentRunner;

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for the Conductor workflow engine.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// A plan failed validation before execution began.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error raised by the execution scheduler.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error from the checkpoint committer (git plumbing).
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// An error while resolving a human approval gate.
    #[error("Gate error: {0}")]
    Gate(String),

    /// An error from an agent execution backend.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

// --- Agent capability types ---

/// A registered agent capability that can be assigned a plan step.
///
/// The set is closed on purpose: rework targets reported by agents at runtime
/// are parsed into this enum rather than trusted as free-form routing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Writes and modifies application code.
    Developer,
    /// Verifies behaviour, writes and runs tests.
    Qa,
    /// Reviews changes for security issues.
    Security,
    /// Handles deployment and infrastructure tasks.
    Devops,
    /// Writes user-facing and internal documentation.
    Docs,
}

impl AgentKind {
    /// All registered capabilities, in declaration order.
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Developer,
        AgentKind::Qa,
        AgentKind::Security,
        AgentKind::Devops,
        AgentKind::Docs,
    ];
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Developer => write!(f, "developer"),
            AgentKind::Qa => write!(f, "qa"),
            AgentKind::Security => write!(f, "security"),
            AgentKind::Devops => write!(f, "devops"),
            AgentKind::Docs => write!(f, "docs"),
        }
    }
}

// --- Agent result types ---

/// Outcome class reported by an agent execution backend for one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// The step's task was carried out successfully.
    Complete,
    /// The work needs another pass; `rework_target` names the capability
    /// that should re-attempt it.
    NeedsRework,
    /// The agent could not proceed (missing input, broken environment).
    Blocked,
    /// The agent crashed, timed out, or otherwise failed terminally.
    Failed,
}

/// Structured result descriptor returned by an [`AgentRunner`].
///
/// The scheduler consumes this verbatim and never interprets the agent's
/// reasoning; only the status code and metadata drive scheduling decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// Outcome class for this attempt.
    pub status: AgentStatus,
    /// One-line human-readable summary of what the agent did.
    pub summary: String,
    /// Workspace-relative paths of files the agent created.
    #[serde(default)]
    pub artifacts_created: Vec<String>,
    /// Workspace-relative paths of files the agent modified.
    #[serde(default)]
    pub artifacts_modified: Vec<String>,
    /// Problems the agent hit, surfaced verbatim on failure paths.
    #[serde(default)]
    pub issues: Vec<String>,
    /// Why rework is needed, when `status == NeedsRework`.
    #[serde(default)]
    pub rework_reason: Option<String>,
    /// Which capability should re-attempt the step, when rework is needed.
    #[serde(default)]
    pub rework_target: Option<AgentKind>,
    /// Tokens consumed by this attempt.
    #[serde(default)]
    pub tokens_used: u64,
    /// Estimated cost of this attempt in USD.
    #[serde(default)]
    pub cost_usd: f64,
    /// Free-form metadata reported by the backend, passed through verbatim.
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

impl AgentResult {
    /// Creates a successful result with the given summary.
    pub fn complete(summary: impl Into<String>) -> Self {
        Self {
            status: AgentStatus::Complete,
            summary: summary.into(),
            artifacts_created: Vec::new(),
            artifacts_modified: Vec::new(),
            issues: Vec::new(),
            rework_reason: None,
            rework_target: None,
            tokens_used: 0,
            cost_usd: 0.0,
            metadata: std::collections::BTreeMap::new(),
        }
    }

    /// Creates a rework request routed to the given capability.
    pub fn needs_rework(
        summary: impl Into<String>,
        reason: impl Into<String>,
        target: AgentKind,
    ) -> Self {
        Self {
            status: AgentStatus::NeedsRework,
            rework_reason: Some(reason.into()),
            rework_target: Some(target),
            ..Self::complete(summary)
        }
    }

    /// Creates a blocked result carrying the reported issues.
    pub fn blocked(summary: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            status: AgentStatus::Blocked,
            issues,
            ..Self::complete(summary)
        }
    }

    /// Creates a terminally failed result.
    pub fn failed(summary: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            status: AgentStatus::Failed,
            issues,
            ..Self::complete(summary)
        }
    }

    /// Attach usage metadata to this result.
    pub fn with_usage(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.tokens_used = tokens;
        self.cost_usd = cost_usd;
        self
    }

    /// Record an artifact path the agent created.
    pub fn with_created(mut self, path: impl Into<String>) -> Self {
        self.artifacts_created.push(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_kind_display() {
        assert_eq!(AgentKind::Developer.to_string(), "developer");
        assert_eq!(AgentKind::Qa.to_string(), "qa");
        assert_eq!(AgentKind::Devops.to_string(), "devops");
    }

    #[test]
    fn test_agent_kind_serde_roundtrip() {
        for kind in AgentKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            let parsed: AgentKind = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unknown_agent_kind_rejected() {
        let parsed: Result<AgentKind, _> = serde_json::from_str("\"wizard\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_complete_result() {
        let result = AgentResult::complete("implemented login").with_usage(1200, 0.04);
        assert_eq!(result.status, AgentStatus::Complete);
        assert_eq!(result.tokens_used, 1200);
        assert!(result.rework_target.is_none());
    }

    #[test]
    fn test_needs_rework_carries_target() {
        let result = AgentResult::needs_rework("tests failing", "2 assertions", AgentKind::Developer);
        assert_eq!(result.status, AgentStatus::NeedsRework);
        assert_eq!(result.rework_target, Some(AgentKind::Developer));
        assert_eq!(result.rework_reason.as_deref(), Some("2 assertions"));
    }

    #[test]
    fn test_result_status_serialization() {
        let json = serde_json::to_string(&AgentStatus::NeedsRework).unwrap();
        assert_eq!(json, "\"needs_rework\"");
    }
}
