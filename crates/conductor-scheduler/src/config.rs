use conductor_core::AgentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// A gate the rules require on the final step of a given capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MandatoryGate {
    /// The gate attaches to the highest-numbered step of this capability.
    pub after_agent: AgentKind,
    /// Capability a `changes_requested` decision routes back to.
    #[serde(default)]
    pub rework_target: Option<AgentKind>,
}

/// Platform-wide process rules every plan must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformRules {
    /// Capabilities plans may assign steps to.
    pub allowed_agents: BTreeSet<AgentKind>,
    /// Whether a QA step must exist after the developer steps.
    #[serde(default = "default_true")]
    pub require_qa_step: bool,
    /// Gates the platform mandates regardless of the plan.
    #[serde(default)]
    pub mandatory_gates: Vec<MandatoryGate>,
}

fn default_true() -> bool {
    true
}

impl Default for PlatformRules {
    fn default() -> Self {
        Self {
            allowed_agents: AgentKind::ALL.into_iter().collect(),
            require_qa_step: true,
            mandatory_gates: Vec::new(),
        }
    }
}

/// Per-project overrides layered on top of [`PlatformRules`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectRules {
    /// Capabilities this project refuses even if the platform allows them.
    #[serde(default)]
    pub denied_agents: BTreeSet<AgentKind>,
    /// Additional gates this project mandates.
    #[serde(default)]
    pub extra_gates: Vec<MandatoryGate>,
}

/// Runtime knobs for the execution scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Root of the workspace agents operate in.
    pub workspace: PathBuf,
    /// Maximum rework attempts per step lineage before it fails terminally.
    #[serde(default = "default_rework_ceiling")]
    pub rework_ceiling: u32,
    /// Per-attempt timeout handed to the agent runner, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Whether to open a pull request once the run completes.
    #[serde(default)]
    pub open_pull_request: bool,
}

fn default_rework_ceiling() -> u32 {
    2
}

fn default_step_timeout_secs() -> u64 {
    900
}

impl SchedulerConfig {
    /// Creates a config with default knobs for the given workspace.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            rework_ceiling: default_rework_ceiling(),
            step_timeout_secs: default_step_timeout_secs(),
            open_pull_request: false,
        }
    }

    /// Set the rework ceiling.
    pub fn with_rework_ceiling(mut self, ceiling: u32) -> Self {
        self.rework_ceiling = ceiling;
        self
    }

    /// Enable pull-request creation on completion.
    pub fn with_pull_request(mut self) -> Self {
        self.open_pull_request = true;
        self
    }

    /// The per-attempt timeout as a [`Duration`].
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_defaults_allow_all_agents() {
        let rules = PlatformRules::default();
        assert_eq!(rules.allowed_agents.len(), AgentKind::ALL.len());
        assert!(rules.require_qa_step);
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"workspace": "/tmp/ws"}"#).unwrap();
        assert_eq!(config.rework_ceiling, 2);
        assert_eq!(config.step_timeout(), Duration::from_secs(900));
        assert!(!config.open_pull_request);
    }

    #[test]
    fn test_config_builder() {
        let config = SchedulerConfig::new("/tmp/ws")
            .with_rework_ceiling(5)
            .with_pull_request();
        assert_eq!(config.rework_ceiling, 5);
        assert!(config.open_pull_request);
    }
}
