//! The execution scheduler.
//!
//! Drives a validated plan to a terminal run state: computes readiness from
//! the dependency graph, interposes human gates, dispatches ready batches to
//! the agent runner, applies the rework policy to each result, and wraps
//! every completed step in a checkpoint commit. The scheduler exclusively
//! owns the [`Run`] aggregate; every failure path resolves to a terminal run
//! status with a structured error rather than an unwound panic.

use crate::checkpoint::Checkpointer;
use crate::config::SchedulerConfig;
use crate::gate::{GateResolver, GateSignal};
use crate::graph;
use crate::rework::{self, ReworkDecision};
use crate::types::{ExecutionPlan, HumanGate, Run, RunOutcome, RunStatus, StepState};
use chrono::{DateTime, Utc};
use conductor_core::{AgentKind, AgentResult, AgentRunner, ConductorResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What one scheduling tick achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// At least one batch was dispatched and processed.
    Progressed,
    /// Scheduling is suspended until a gate decision artifact appears.
    AwaitingGate,
    /// The run reached a terminal status.
    Terminal(RunStatus),
}

/// The stateful workflow engine executing one run.
pub struct Scheduler {
    run: Arc<RwLock<Run>>,
    runner: Arc<dyn AgentRunner>,
    checkpointer: Arc<dyn Checkpointer>,
    gates: GateResolver,
    config: SchedulerConfig,
    aborted: AtomicBool,
    /// Gates already approved; a gated step is only blocked once.
    approved_gates: Mutex<HashSet<Uuid>>,
    /// `changes_requested` decisions already acted on, keyed by timestamp,
    /// so one artifact triggers exactly one rework allocation.
    handled_reviews: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl Scheduler {
    /// Creates a scheduler for a validated plan.
    pub fn new(
        plan: ExecutionPlan,
        runner: Arc<dyn AgentRunner>,
        checkpointer: Arc<dyn Checkpointer>,
        config: SchedulerConfig,
    ) -> Self {
        let gates = GateResolver::new(&config.workspace);
        Self {
            run: Arc::new(RwLock::new(Run::new(plan))),
            runner,
            checkpointer,
            gates,
            config,
            aborted: AtomicBool::new(false),
            approved_gates: Mutex::new(HashSet::new()),
            handled_reviews: Mutex::new(HashMap::new()),
        }
    }

    /// Shared handle monitors read run state through without blocking
    /// scheduling; mutations are applied atomically per completion event.
    pub fn run_handle(&self) -> Arc<RwLock<Run>> {
        Arc::clone(&self.run)
    }

    /// A point-in-time clone of the run.
    pub async fn snapshot(&self) -> Run {
        self.run.read().await.clone()
    }

    /// The gate resolver for this run's workspace (path convention shared
    /// with review surfaces).
    pub fn gate_resolver(&self) -> &GateResolver {
        &self.gates
    }

    /// Abort the run: no further batches are dispatched and results from
    /// in-flight work are discarded. Already dispatched agents are left to
    /// the runner's own timeout contract.
    pub async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut run = self.run.write().await;
        warn!(run_id = %run.run_id, "run aborted");
        run.fail("run aborted");
    }

    /// Drive the run to a terminal state, sleeping `gate_poll` between ticks
    /// while a gate decision is outstanding.
    pub async fn run_to_completion(&self, gate_poll: Duration) -> ConductorResult<RunOutcome> {
        loop {
            match self.tick().await? {
                TickOutcome::Terminal(_) => break,
                TickOutcome::AwaitingGate => tokio::time::sleep(gate_poll).await,
                TickOutcome::Progressed => {}
            }
        }
        let run = self.run.read().await;
        Ok(RunOutcome::from(&*run))
    }

    /// One scheduling tick.
    ///
    /// Resolves outstanding gates, computes the next parallel batch,
    /// dispatches it, and processes each agent result as it arrives. Callers
    /// own the polling cadence between `AwaitingGate` ticks.
    pub async fn tick(&self) -> ConductorResult<TickOutcome> {
        if self.aborted.load(Ordering::SeqCst) {
            let mut run = self.run.write().await;
            run.fail("run aborted");
            return Ok(TickOutcome::Terminal(run.status));
        }
        {
            let run = self.run.read().await;
            if run.status.is_terminal() {
                return Ok(TickOutcome::Terminal(run.status));
            }
        }

        self.block_gated_ready_steps().await;
        if let Some(outcome) = self.resolve_blocked_gates().await {
            return Ok(outcome);
        }

        let batch = self.take_next_batch().await;
        let batch = match batch {
            BatchPlan::Dispatch(batch) => batch,
            BatchPlan::AwaitingGate => {
                let mut run = self.run.write().await;
                run.status = RunStatus::BlockedOnGate;
                return Ok(TickOutcome::AwaitingGate);
            }
            BatchPlan::Finished => return Ok(self.finalize().await),
            BatchPlan::Deadlocked => {
                let mut run = self.run.write().await;
                let stranded = graph::unreachable_steps(&run);
                warn!(run_id = %run.run_id, ?stranded, "no runnable steps remain");
                run.fail(format!(
                    "no runnable steps remain; steps {stranded:?} can never satisfy their dependencies"
                ));
                return Ok(TickOutcome::Terminal(run.status));
            }
        };

        self.dispatch_batch(batch).await;

        let run = self.run.read().await;
        if run.status.is_terminal() {
            Ok(TickOutcome::Terminal(run.status))
        } else {
            Ok(TickOutcome::Progressed)
        }
    }

    /// Move ready steps that sit behind an unapproved required gate into
    /// `Blocked`.
    async fn block_gated_ready_steps(&self) {
        let approved = self.approved_gates.lock().await;
        let mut run = self.run.write().await;
        let ready = graph::ready_set(&run);
        for n in ready {
            let Some(gate) = run.plan.gate_for(n) else { continue };
            if gate.required && !approved.contains(&gate.gate_id) {
                let gate_id = gate.gate_id;
                if let Some(exec) = run.steps.get_mut(&n) {
                    exec.state = StepState::Blocked;
                    info!(step = n, gate_id = %gate_id, "step blocked on human gate");
                }
            }
        }
    }

    /// Consult the gate resolver for every blocked step. Returns a terminal
    /// outcome when a decision ends the run.
    async fn resolve_blocked_gates(&self) -> Option<TickOutcome> {
        let blocked: Vec<(u32, HumanGate)> = {
            let run = self.run.read().await;
            run.steps
                .values()
                .filter(|e| e.state == StepState::Blocked)
                .filter_map(|e| {
                    run.plan
                        .gate_for(e.step_number)
                        .map(|g| (e.step_number, g.clone()))
                })
                .collect()
        };

        for (step_number, gate) in blocked {
            let signal = match self.gates.resolve(&gate).await {
                Ok(signal) => signal,
                Err(e) => {
                    let mut run = self.run.write().await;
                    error!(gate_id = %gate.gate_id, error = %e, "gate resolution failed");
                    run.fail(format!("gate {} unresolvable: {e}", gate.gate_id));
                    return Some(TickOutcome::Terminal(run.status));
                }
            };

            match signal {
                GateSignal::Pending => {}
                GateSignal::Approved => {
                    self.approved_gates.lock().await.insert(gate.gate_id);
                    let mut run = self.run.write().await;
                    if let Some(exec) = run.steps.get_mut(&step_number) {
                        exec.state = StepState::Ready;
                    }
                    run.status = RunStatus::Running;
                    info!(step = step_number, gate_id = %gate.gate_id, "gate approved");
                }
                GateSignal::Rejected { feedback } => {
                    let mut run = self.run.write().await;
                    let detail = feedback.unwrap_or_else(|| "no feedback given".into());
                    run.fail(format!("gate {} rejected: {detail}", gate.gate_id));
                    return Some(TickOutcome::Terminal(run.status));
                }
                GateSignal::ChangesRequested { feedback } => {
                    if let Some(outcome) = self.route_changes_requested(&gate, feedback).await {
                        return Some(outcome);
                    }
                }
            }
        }
        None
    }

    /// Route a `changes_requested` decision back to the gate's rework
    /// target: the latest completed step of that capability gets a fresh
    /// attempt, bounded by the same per-lineage ceiling as agent-reported
    /// rework. The gated step stays blocked until a later approval.
    async fn route_changes_requested(
        &self,
        gate: &HumanGate,
        feedback: Option<String>,
    ) -> Option<TickOutcome> {
        // One artifact triggers at most one rework allocation.
        match self.gates.artifact(gate.gate_id).await {
            Ok(Some(artifact)) => {
                let mut handled = self.handled_reviews.lock().await;
                if handled.get(&gate.gate_id) == Some(&artifact.decided_at) {
                    return None;
                }
                handled.insert(gate.gate_id, artifact.decided_at);
            }
            _ => return None,
        }

        let Some(target) = gate.rework_target else {
            let mut run = self.run.write().await;
            run.fail(format!(
                "gate {} requested changes but no rework target is configured",
                gate.gate_id
            ));
            return Some(TickOutcome::Terminal(run.status));
        };

        let mut run = self.run.write().await;
        let candidate = run
            .plan
            .steps
            .iter()
            .filter(|s| s.agent == target)
            .map(|s| s.step_number)
            .filter(|n| {
                run.step(*n)
                    .is_some_and(|e| e.state == StepState::Completed)
            })
            .max();

        let Some(n) = candidate else {
            run.fail(format!(
                "gate {} requested changes but no completed '{target}' step exists to rework",
                gate.gate_id
            ));
            return Some(TickOutcome::Terminal(run.status));
        };

        let ceiling = self.config.rework_ceiling;
        let exhausted = run
            .step(n)
            .is_some_and(|e| e.reworks_used() >= ceiling);
        if exhausted {
            run.fail(format!(
                "step {n} exhausted its rework ceiling ({ceiling}) after reviewer feedback"
            ));
            return Some(TickOutcome::Terminal(run.status));
        }
        if let Some(exec) = run.steps.get_mut(&n) {
            info!(
                step = n,
                gate_id = %gate.gate_id,
                feedback = feedback.as_deref().unwrap_or(""),
                "reviewer requested changes; reworking step"
            );
            exec.begin_rework(target);
        }
        None
    }

    /// Compute the next batch under the write lock, marking its members
    /// Running before any dispatch so a racing monitor never observes a
    /// dispatched-but-pending step.
    async fn take_next_batch(&self) -> BatchPlan {
        let mut run = self.run.write().await;
        let ready = graph::ready_set(&run);
        let batch = graph::parallel_batch(&ready, &run.plan);

        if batch.is_empty() {
            if run.all_completed() {
                return BatchPlan::Finished;
            }
            if run.count_in_state(StepState::Blocked) > 0 {
                return BatchPlan::AwaitingGate;
            }
            return BatchPlan::Deadlocked;
        }

        run.status = RunStatus::Running;
        let mut dispatch = Vec::with_capacity(batch.len());
        for n in batch {
            let task = run
                .plan
                .step(n)
                .map(|s| s.task.clone())
                .unwrap_or_default();
            if let Some(exec) = run.steps.get_mut(&n) {
                exec.state = StepState::Running;
                exec.started_at = Some(Utc::now());
                dispatch.push(DispatchItem {
                    step_number: n,
                    agent: exec.agent,
                    task,
                });
            }
        }
        BatchPlan::Dispatch(dispatch)
    }

    /// Dispatch a batch concurrently and process each result as it arrives.
    /// A failure on one step never cancels siblings already dispatched, but
    /// once the run turns terminal remaining results are discarded.
    async fn dispatch_batch(&self, batch: Vec<DispatchItem>) {
        let mut join_set: JoinSet<(u32, AgentKind, ConductorResult<AgentResult>)> = JoinSet::new();
        for item in batch {
            let runner = Arc::clone(&self.runner);
            let workspace = self.config.workspace.clone();
            let timeout = self.config.step_timeout();
            info!(step = item.step_number, agent = %item.agent, "dispatching step");
            join_set.spawn(async move {
                let result = runner
                    .run(item.agent, &item.task, &workspace, timeout)
                    .await;
                (item.step_number, item.agent, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (step_number, agent, result) = match joined {
                Ok(tuple) => tuple,
                Err(e) => {
                    let mut run = self.run.write().await;
                    error!(error = %e, "agent dispatch task panicked");
                    run.fail(format!("agent dispatch task panicked: {e}"));
                    continue;
                }
            };

            let discard = {
                let run = self.run.read().await;
                run.status.is_terminal() || self.aborted.load(Ordering::SeqCst)
            };
            if discard {
                warn!(step = step_number, "discarding result; run already terminal");
                continue;
            }

            match result {
                Ok(agent_result) => {
                    self.apply_result(step_number, agent, agent_result).await;
                }
                Err(e) => {
                    let mut run = self.run.write().await;
                    error!(step = step_number, error = %e, "agent runner error");
                    if let Some(exec) = run.steps.get_mut(&step_number) {
                        exec.state = StepState::Failed;
                        exec.finished_at = Some(Utc::now());
                    }
                    run.fail(format!("step {step_number} runner error: {e}"));
                }
            }
        }
    }

    /// Apply the rework policy to one agent result and perform the
    /// checkpoint side effect for completed steps.
    async fn apply_result(&self, step_number: u32, agent: AgentKind, result: AgentResult) {
        let decision = {
            let run = self.run.read().await;
            match run.step(step_number) {
                Some(exec) => rework::decide(&result, exec, self.config.rework_ceiling),
                None => return,
            }
        };

        match decision {
            ReworkDecision::Complete => {
                let (run_id, workspace) = {
                    let mut run = self.run.write().await;
                    if let Some(exec) = run.steps.get_mut(&step_number) {
                        exec.state = StepState::AwaitingCommit;
                        exec.result = Some(result.clone());
                    }
                    (run.run_id, self.config.workspace.clone())
                };

                let committed = self
                    .checkpointer
                    .commit_step(&workspace, run_id, step_number, agent)
                    .await;

                let mut run = self.run.write().await;
                match committed {
                    Ok(committed) => {
                        if let Some(exec) = run.steps.get_mut(&step_number) {
                            exec.committed = committed;
                            exec.state = StepState::Completed;
                            exec.finished_at = Some(Utc::now());
                        }
                        run.total_tokens_used += result.tokens_used;
                        run.total_cost_usd += result.cost_usd;
                        info!(step = step_number, committed, "step completed");
                    }
                    Err(e) => {
                        error!(step = step_number, error = %e, "checkpoint commit failed");
                        if let Some(exec) = run.steps.get_mut(&step_number) {
                            exec.state = StepState::Failed;
                            exec.finished_at = Some(Utc::now());
                        }
                        run.fail(format!("Git checkpoint commit failed at step {step_number}: {e}"));
                    }
                }
            }
            ReworkDecision::Rework { target } => {
                let mut run = self.run.write().await;
                if let Some(exec) = run.steps.get_mut(&step_number) {
                    exec.result = Some(result);
                    exec.state = StepState::NeedsRework;
                    info!(
                        step = step_number,
                        target = %target,
                        attempt = exec.attempt_count,
                        "step needs rework"
                    );
                    exec.begin_rework(target);
                }
            }
            ReworkDecision::Fail { reason } => {
                let mut run = self.run.write().await;
                if let Some(exec) = run.steps.get_mut(&step_number) {
                    exec.result = Some(result);
                    exec.state = StepState::Failed;
                    exec.finished_at = Some(Utc::now());
                }
                error!(step = step_number, reason = %reason, "step failed terminally");
                run.fail(reason);
            }
        }
    }

    /// All steps completed: mark the run done and attempt PR creation once.
    async fn finalize(&self) -> TickOutcome {
        {
            let mut run = self.run.write().await;
            run.status = RunStatus::Completed;
            info!(
                run_id = %run.run_id,
                tokens = run.total_tokens_used,
                cost_usd = run.total_cost_usd,
                "run completed"
            );
        }

        if self.config.open_pull_request {
            let (run_id, ticket_id) = {
                let run = self.run.read().await;
                (run.run_id, run.plan.ticket_id.clone())
            };
            let pr = self
                .checkpointer
                .open_pull_request(&self.config.workspace, run_id, &ticket_id)
                .await;
            let mut run = self.run.write().await;
            match pr {
                Ok(url) => {
                    info!(pr_url = %url, "pull request opened");
                    run.pr_url = Some(url);
                }
                Err(e) => {
                    // The run stays completed: every checkpoint is on the
                    // branch, only the PR needs manual follow-up.
                    warn!(error = %e, "pull request creation failed");
                    run.error = Some(format!("pull request creation failed: {e}"));
                }
            }
        }

        TickOutcome::Terminal(RunStatus::Completed)
    }
}

/// One step's dispatch payload.
struct DispatchItem {
    step_number: u32,
    agent: AgentKind,
    task: String,
}

/// Outcome of batch selection.
enum BatchPlan {
    Dispatch(Vec<DispatchItem>),
    AwaitingGate,
    Finished,
    Deadlocked,
}
