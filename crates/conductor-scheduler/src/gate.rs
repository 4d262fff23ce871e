//! Human approval gate resolution.
//!
//! Gates are resolved by polling a decision artifact written by an external
//! review surface at a well-known path keyed by gate ID. The core never
//! writes decisions itself and never times a gate out: a caller that wants a
//! wall-clock bound injects an explicit rejected artifact instead.

use crate::types::HumanGate;
use conductor_core::{ConductorError, ConductorResult, ReviewArtifact, ReviewStatus};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Directory under the workspace where review surfaces drop decisions.
const REVIEWS_DIR: &str = ".conductor/reviews";

/// Signal derived from a gate's decision artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateSignal {
    /// The gated step may proceed.
    Approved,
    /// The run must stop.
    Rejected {
        /// Reviewer feedback, if any.
        feedback: Option<String>,
    },
    /// Route work back to the gate's rework target.
    ChangesRequested {
        /// Reviewer feedback, if any.
        feedback: Option<String>,
    },
    /// No decision artifact exists yet.
    Pending,
}

/// Polls decision artifacts for the gates of one run's workspace.
#[derive(Debug, Clone)]
pub struct GateResolver {
    workspace: PathBuf,
}

impl GateResolver {
    /// Creates a resolver rooted at the given workspace.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Path where the decision artifact for `gate_id` is expected.
    pub fn artifact_path(&self, gate_id: Uuid) -> PathBuf {
        self.workspace.join(REVIEWS_DIR).join(format!("{gate_id}.json"))
    }

    /// Resolve a gate from its decision artifact.
    ///
    /// A missing artifact is `Pending`; a malformed one is an error so a
    /// corrupted review never silently approves or rejects anything.
    pub async fn resolve(&self, gate: &HumanGate) -> ConductorResult<GateSignal> {
        let path = self.artifact_path(gate.gate_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(gate_id = %gate.gate_id, "no decision artifact yet");
                return Ok(GateSignal::Pending);
            }
            Err(e) => return Err(e.into()),
        };

        let artifact: ReviewArtifact = serde_json::from_slice(&raw).map_err(|e| {
            ConductorError::Gate(format!(
                "malformed decision artifact for gate {}: {e}",
                gate.gate_id
            ))
        })?;

        info!(
            gate_id = %gate.gate_id,
            status = ?artifact.status,
            "gate decision observed"
        );

        Ok(match artifact.status {
            ReviewStatus::Approved => GateSignal::Approved,
            ReviewStatus::Rejected => GateSignal::Rejected {
                feedback: artifact.reviewer_feedback,
            },
            ReviewStatus::ChangesRequested => GateSignal::ChangesRequested {
                feedback: artifact.reviewer_feedback,
            },
        })
    }

    /// Read the raw artifact for a gate, if present. Used by the engine to
    /// de-duplicate `changes_requested` decisions by their timestamp.
    pub async fn artifact(&self, gate_id: Uuid) -> ConductorResult<Option<ReviewArtifact>> {
        let path = self.artifact_path(gate_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                ConductorError::Gate(format!("malformed decision artifact for gate {gate_id}: {e}"))
            })?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a decision artifact. This is the helper review surfaces and
    /// tests share so the path convention lives in one place; the scheduler
    /// itself never calls it.
    pub async fn write_artifact(
        &self,
        gate_id: Uuid,
        artifact: &ReviewArtifact,
    ) -> ConductorResult<PathBuf> {
        let path = self.artifact_path(gate_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(artifact)?).await?;
        Ok(path)
    }

    /// The workspace this resolver is rooted at.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}
