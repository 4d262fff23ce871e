//! Human-review decision artifacts for approval gates.
//!
//! These types live in `conductor-core` so that both the scheduler (which
//! polls for decisions) and external review surfaces (which write them) can
//! share them without circular deps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The decision recorded by a human reviewer for one gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// The gated step may proceed.
    Approved,
    /// The run must stop.
    Rejected,
    /// The work should be routed back to a rework target.
    ChangesRequested,
}

/// The decision artifact written by an external review surface.
///
/// The scheduler reads these from a well-known path keyed by gate ID and
/// never writes them itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewArtifact {
    /// The reviewer's decision.
    pub status: ReviewStatus,
    /// Free-form feedback from the reviewer.
    #[serde(default)]
    pub reviewer_feedback: Option<String>,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

impl ReviewArtifact {
    /// Creates an artifact with the given status, decided now.
    pub fn new(status: ReviewStatus) -> Self {
        Self {
            status,
            reviewer_feedback: None,
            decided_at: Utc::now(),
        }
    }

    /// Attach reviewer feedback.
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.reviewer_feedback = Some(feedback.into());
        self
    }
}
