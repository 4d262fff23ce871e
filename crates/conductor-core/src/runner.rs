//! The agent execution collaborator seam.

use crate::{AgentKind, AgentResult, ConductorResult};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

/// Backend that actually executes one step's task with a given capability.
///
/// Implementations own subprocess/container lifecycles and must enforce the
/// timeout themselves, mapping a timeout or crash to an [`AgentResult`] with
/// `status: Failed` rather than hanging the scheduler. Returning `Err` is
/// reserved for infrastructure failures where no result descriptor could be
/// produced at all.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run `task` with the given capability inside `workspace`.
    async fn run(
        &self,
        agent: AgentKind,
        task: &str,
        workspace: &Path,
        timeout: Duration,
    ) -> ConductorResult<AgentResult>;
}
