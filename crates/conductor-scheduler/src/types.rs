use chrono::{DateTime, Utc};
use conductor_core::{AgentKind, AgentResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Rough effort estimate attached to a plan step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Small, mechanical change.
    Low,
    /// Typical feature-sized work.
    #[default]
    Medium,
    /// Large or risky change.
    High,
}

/// One unit of work assigned to one agent capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique, stable ordinal within the plan.
    pub step_number: u32,
    /// The capability that executes this step.
    pub agent: AgentKind,
    /// Opaque instruction payload handed to the agent.
    pub task: String,
    /// Step numbers that must reach Completed before this step is ready.
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    /// Effort estimate, informational only.
    #[serde(default)]
    pub estimated_complexity: Complexity,
}

impl PlanStep {
    /// Creates a step with no dependencies.
    pub fn new(step_number: u32, agent: AgentKind, task: impl Into<String>) -> Self {
        Self {
            step_number,
            agent,
            task: task.into(),
            depends_on: BTreeSet::new(),
            estimated_complexity: Complexity::default(),
        }
    }

    /// Declare the steps this one depends on.
    pub fn with_depends_on(mut self, deps: impl IntoIterator<Item = u32>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self
    }

    /// Set the effort estimate.
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.estimated_complexity = complexity;
        self
    }
}

/// A mandatory human-approval pause point attached to a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanGate {
    /// Identifier the decision artifact is keyed by.
    pub gate_id: Uuid,
    /// The step this gate blocks.
    pub step_number: u32,
    /// Whether the gate may be skipped by policy. Gates inserted from
    /// platform rules are always required.
    pub required: bool,
    /// Capability a `changes_requested` decision routes back to.
    #[serde(default)]
    pub rework_target: Option<AgentKind>,
}

impl HumanGate {
    /// Creates a required gate on the given step.
    pub fn new(step_number: u32) -> Self {
        Self {
            gate_id: Uuid::new_v4(),
            step_number,
            required: true,
            rework_target: None,
        }
    }

    /// Set the rework routing target for `changes_requested` decisions.
    pub fn with_rework_target(mut self, target: AgentKind) -> Self {
        self.rework_target = Some(target);
        self
    }
}

/// A validated DAG of steps to execute for one ticket.
///
/// Immutable once it has passed the validator; the scheduler only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Plan identifier.
    pub plan_id: Uuid,
    /// The ticket this plan was derived from.
    pub ticket_id: String,
    /// Ticket classification (feature, bugfix, ...), informational.
    pub classification: String,
    /// The steps, in plan order.
    pub steps: Vec<PlanStep>,
    /// Sets of step numbers eligible to run concurrently.
    #[serde(default)]
    pub parallel_groups: Vec<BTreeSet<u32>>,
    /// Human approval gates keyed to step numbers.
    #[serde(default)]
    pub human_gates: Vec<HumanGate>,
}

impl ExecutionPlan {
    /// Creates an empty plan for the given ticket.
    pub fn new(ticket_id: impl Into<String>, classification: impl Into<String>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            ticket_id: ticket_id.into(),
            classification: classification.into(),
            steps: Vec::new(),
            parallel_groups: Vec::new(),
            human_gates: Vec::new(),
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Declare a parallel group.
    pub fn with_parallel_group(mut self, members: impl IntoIterator<Item = u32>) -> Self {
        self.parallel_groups.push(members.into_iter().collect());
        self
    }

    /// Attach a human gate.
    pub fn with_gate(mut self, gate: HumanGate) -> Self {
        self.human_gates.push(gate);
        self
    }

    /// Look up a step by number.
    pub fn step(&self, step_number: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// The gate attached to a step, if any.
    pub fn gate_for(&self, step_number: u32) -> Option<&HumanGate> {
        self.human_gates.iter().find(|g| g.step_number == step_number)
    }

    /// Highest step number in the plan (0 for an empty plan).
    pub fn max_step_number(&self) -> u32 {
        self.steps.iter().map(|s| s.step_number).max().unwrap_or(0)
    }
}

/// State of a single step's execution lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Waiting for dependencies to complete.
    Pending,
    /// Dependencies are complete but a human gate has not approved yet.
    Blocked,
    /// Eligible for dispatch.
    Ready,
    /// Dispatched to the agent runner.
    Running,
    /// Agent finished; checkpoint commit in progress.
    AwaitingCommit,
    /// Done and checkpointed.
    Completed,
    /// Terminally failed.
    Failed,
    /// A rework attempt has been requested.
    NeedsRework,
}

/// Mutable execution record for one step lineage, owned by the scheduler.
///
/// Rework allocates a fresh attempt on the same record: the agent switches to
/// the rework target and `attempt_count` grows, while `step_number` keeps the
/// lineage stable so dependents stay blocked until it finally completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// The plan step this record tracks.
    pub step_number: u32,
    /// Capability for the current attempt (may differ from the plan's after rework).
    pub agent: AgentKind,
    /// Current state.
    pub state: StepState,
    /// 1-based attempt number for this lineage.
    pub attempt_count: u32,
    /// Result of the most recent attempt.
    pub result: Option<AgentResult>,
    /// Whether a checkpoint commit was recorded for this step.
    pub committed: bool,
    /// When the current attempt was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the lineage reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Creates the initial record for a plan step. Steps without dependencies
    /// begin Ready, everything else Pending.
    pub fn new(step: &PlanStep) -> Self {
        let state = if step.depends_on.is_empty() {
            StepState::Ready
        } else {
            StepState::Pending
        };
        Self {
            step_number: step.step_number,
            agent: step.agent,
            state,
            attempt_count: 1,
            result: None,
            committed: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Number of rework attempts already consumed by this lineage.
    pub fn reworks_used(&self) -> u32 {
        self.attempt_count.saturating_sub(1)
    }

    /// Reset this record for a fresh rework attempt by `target`.
    pub fn begin_rework(&mut self, target: AgentKind) {
        self.agent = target;
        self.attempt_count += 1;
        self.state = StepState::Ready;
        self.result = None;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Scheduling is in progress.
    Running,
    /// Scheduling is suspended awaiting a human gate decision.
    BlockedOnGate,
    /// The run ended in failure.
    Failed,
    /// Every step completed and was checkpointed.
    Completed,
}

impl RunStatus {
    /// Whether this status ends scheduling.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Completed)
    }
}

/// Aggregate root for one end-to-end execution of a validated plan.
///
/// Mutated only by the scheduler; external monitors read cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: Uuid,
    /// The validated plan being executed.
    pub plan: ExecutionPlan,
    /// Execution records keyed by step number, in plan order.
    pub steps: BTreeMap<u32, StepExecution>,
    /// Overall status.
    pub status: RunStatus,
    /// Human-readable error for failed runs.
    pub error: Option<String>,
    /// Tokens consumed by completed attempts.
    pub total_tokens_used: u64,
    /// Cost in USD accumulated by completed attempts.
    pub total_cost_usd: f64,
    /// URL of the pull request opened after completion, if any.
    pub pr_url: Option<String>,
}

impl Run {
    /// Creates a run for a validated plan with all step records initialized.
    pub fn new(plan: ExecutionPlan) -> Self {
        let steps = plan
            .steps
            .iter()
            .map(|s| (s.step_number, StepExecution::new(s)))
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            plan,
            steps,
            status: RunStatus::Running,
            error: None,
            total_tokens_used: 0,
            total_cost_usd: 0.0,
            pr_url: None,
        }
    }

    /// Look up a step record.
    pub fn step(&self, step_number: u32) -> Option<&StepExecution> {
        self.steps.get(&step_number)
    }

    /// Whether every step has completed.
    pub fn all_completed(&self) -> bool {
        self.steps.values().all(|s| s.state == StepState::Completed)
    }

    /// Count of steps in the given state.
    pub fn count_in_state(&self, state: StepState) -> usize {
        self.steps.values().filter(|s| s.state == state).count()
    }

    /// Mark the run failed with the given error, unless already terminal.
    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = RunStatus::Failed;
            self.error = Some(error.into());
        }
    }
}

/// Summary handed back to the caller when scheduling ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run identifier.
    pub run_id: Uuid,
    /// Terminal status (`Failed` or `Completed`).
    pub status: RunStatus,
    /// Error for failed runs.
    pub error: Option<String>,
    /// Total steps in the plan.
    pub total_steps: usize,
    /// Steps that completed.
    pub completed_steps: usize,
    /// Steps that failed.
    pub failed_steps: usize,
    /// Tokens consumed across the run.
    pub total_tokens_used: u64,
    /// Cost in USD across the run.
    pub total_cost_usd: f64,
    /// URL of the opened pull request, if any.
    pub pr_url: Option<String>,
}

impl From<&Run> for RunOutcome {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            status: run.status,
            error: run.error.clone(),
            total_steps: run.steps.len(),
            completed_steps: run.count_in_state(StepState::Completed),
            failed_steps: run.count_in_state(StepState::Failed),
            total_tokens_used: run.total_tokens_used,
            total_cost_usd: run.total_cost_usd,
            pr_url: run.pr_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_plan() -> ExecutionPlan {
        ExecutionPlan::new("TICKET-1", "feature")
            .with_step(PlanStep::new(1, AgentKind::Developer, "implement"))
            .with_step(PlanStep::new(2, AgentKind::Qa, "verify").with_depends_on([1]))
    }

    #[test]
    fn test_plan_step_builder() {
        let step = PlanStep::new(3, AgentKind::Qa, "verify login")
            .with_depends_on([1, 2])
            .with_complexity(Complexity::High);
        assert_eq!(step.depends_on.len(), 2);
        assert_eq!(step.estimated_complexity, Complexity::High);
    }

    #[test]
    fn test_plan_lookup() {
        let plan = two_step_plan();
        assert_eq!(plan.step(2).map(|s| s.agent), Some(AgentKind::Qa));
        assert!(plan.step(9).is_none());
        assert_eq!(plan.max_step_number(), 2);
    }

    #[test]
    fn test_initial_step_states() {
        let run = Run::new(two_step_plan());
        assert_eq!(run.step(1).map(|s| s.state), Some(StepState::Ready));
        assert_eq!(run.step(2).map(|s| s.state), Some(StepState::Pending));
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn test_begin_rework_resets_attempt() {
        let plan = two_step_plan();
        let mut exec = StepExecution::new(&plan.steps[0]);
        exec.state = StepState::NeedsRework;
        exec.result = Some(AgentResult::complete("done"));

        exec.begin_rework(AgentKind::Developer);
        assert_eq!(exec.attempt_count, 2);
        assert_eq!(exec.reworks_used(), 1);
        assert_eq!(exec.state, StepState::Ready);
        assert!(exec.result.is_none());
    }

    #[test]
    fn test_run_fail_is_sticky() {
        let mut run = Run::new(two_step_plan());
        run.fail("first error");
        run.fail("second error");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("first error"));
    }

    #[test]
    fn test_outcome_counts() {
        let mut run = Run::new(two_step_plan());
        if let Some(s) = run.steps.get_mut(&1) {
            s.state = StepState::Completed;
        }
        let outcome = RunOutcome::from(&run);
        assert_eq!(outcome.total_steps, 2);
        assert_eq!(outcome.completed_steps, 1);
        assert_eq!(outcome.failed_steps, 0);
    }

    #[test]
    fn test_run_serialization() {
        let run = Run::new(two_step_plan());
        let json = serde_json::to_string(&run).unwrap();
        let parsed: Run = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), 2);
        assert_eq!(parsed.status, RunStatus::Running);
    }
}
