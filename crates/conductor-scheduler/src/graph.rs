//! Topological readiness and parallel-group membership.
//!
//! Pure queries over the plan's dependency edges and the current step
//! states. Cycle absence is guaranteed by the validator; [`has_cycle`] exists
//! only as a defensive re-check for callers that build runs by hand.

use crate::types::{ExecutionPlan, Run, StepState};
use std::collections::{BTreeMap, BTreeSet};

/// Steps eligible for dispatch, in ascending step order.
///
/// A step is ready when it is already `Ready` (no dependencies, or a rework
/// attempt was allocated) or when it is `Pending` and every dependency has
/// reached `Completed`.
pub fn ready_set(run: &Run) -> Vec<u32> {
    run.steps
        .values()
        .filter(|exec| match exec.state {
            StepState::Ready => true,
            StepState::Pending => run
                .plan
                .step(exec.step_number)
                .is_some_and(|step| {
                    step.depends_on.iter().all(|dep| {
                        run.step(*dep)
                            .is_some_and(|d| d.state == StepState::Completed)
                    })
                }),
            _ => false,
        })
        .map(|exec| exec.step_number)
        .collect()
}

/// The batch to dispatch this tick.
///
/// If the lowest-numbered ready step belongs to a declared parallel group,
/// the batch is every ready member of that group; otherwise it is that step
/// alone. Steps never declared parallel are scheduled strictly one at a
/// time even when independently ready, which keeps dispatch order
/// deterministic for audit logs.
pub fn parallel_batch(ready: &[u32], plan: &ExecutionPlan) -> Vec<u32> {
    let Some(&first) = ready.first() else {
        return Vec::new();
    };
    for group in &plan.parallel_groups {
        if group.contains(&first) {
            return ready.iter().copied().filter(|n| group.contains(n)).collect();
        }
    }
    vec![first]
}

/// Defensive cycle check over the plan's dependency edges.
pub fn has_cycle(plan: &ExecutionPlan) -> bool {
    // 0 = unvisited, 1 = in progress, 2 = done.
    let mut colors: BTreeMap<u32, u8> = BTreeMap::new();
    for step in &plan.steps {
        if dfs(plan, step.step_number, &mut colors) {
            return true;
        }
    }
    false
}

fn dfs(plan: &ExecutionPlan, n: u32, colors: &mut BTreeMap<u32, u8>) -> bool {
    match colors.get(&n) {
        Some(1) => return true, // back edge
        Some(2) => return false,
        _ => {}
    }
    colors.insert(n, 1);
    if let Some(step) = plan.step(n) {
        for dep in &step.depends_on {
            if dfs(plan, *dep, colors) {
                return true;
            }
        }
    }
    colors.insert(n, 2);
    false
}

/// Step numbers whose dependency chains can never complete because they pass
/// through a failed step. Used by the engine's deadlock guard.
pub fn unreachable_steps(run: &Run) -> BTreeSet<u32> {
    let failed: BTreeSet<u32> = run
        .steps
        .values()
        .filter(|s| s.state == StepState::Failed)
        .map(|s| s.step_number)
        .collect();
    let mut poisoned = failed.clone();
    // Propagate along dependents until fixpoint; plans are small.
    loop {
        let mut grew = false;
        for step in &run.plan.steps {
            if poisoned.contains(&step.step_number) {
                continue;
            }
            if step.depends_on.iter().any(|d| poisoned.contains(d)) {
                poisoned.insert(step.step_number);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    poisoned.difference(&failed).copied().collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{PlanStep, StepExecution};
    use conductor_core::AgentKind;

    fn diamond_plan() -> ExecutionPlan {
        // 1 -> {2, 3} -> 4, with 2 and 3 declared parallel.
        ExecutionPlan::new("T", "feature")
            .with_step(PlanStep::new(1, AgentKind::Developer, "base"))
            .with_step(PlanStep::new(2, AgentKind::Developer, "left").with_depends_on([1]))
            .with_step(PlanStep::new(3, AgentKind::Developer, "right").with_depends_on([1]))
            .with_step(PlanStep::new(4, AgentKind::Qa, "verify").with_depends_on([2, 3]))
            .with_parallel_group([2, 3])
    }

    fn complete(run: &mut Run, n: u32) {
        run.steps.get_mut(&n).unwrap().state = StepState::Completed;
    }

    #[test]
    fn test_only_dependency_free_steps_start_ready() {
        let run = Run::new(diamond_plan());
        assert_eq!(ready_set(&run), vec![1]);
    }

    #[test]
    fn test_readiness_waits_for_all_dependencies() {
        let mut run = Run::new(diamond_plan());
        complete(&mut run, 1);
        assert_eq!(ready_set(&run), vec![2, 3]);

        complete(&mut run, 2);
        // 4 still waits on 3.
        assert_eq!(ready_set(&run), vec![3]);

        complete(&mut run, 3);
        assert_eq!(ready_set(&run), vec![4]);
    }

    #[test]
    fn test_readiness_across_random_dag() {
        // A wider DAG: every step's readiness must imply completed deps.
        let mut plan = ExecutionPlan::new("T", "feature");
        for n in 1..=8u32 {
            let deps: Vec<u32> = (1..n).filter(|d| (n + d) % 3 == 0).collect();
            plan = plan.with_step(
                PlanStep::new(n, AgentKind::Developer, format!("step {n}")).with_depends_on(deps),
            );
        }
        let mut run = Run::new(plan);

        // Complete steps one at a time in ready order; at every point the
        // ready set must only contain steps with fully completed deps.
        while !run.all_completed() {
            let ready = ready_set(&run);
            assert!(!ready.is_empty(), "DAG stalled");
            for n in &ready {
                let step = run.plan.step(*n).unwrap().clone();
                for dep in &step.depends_on {
                    assert_eq!(run.step(*dep).unwrap().state, StepState::Completed);
                }
            }
            complete(&mut run, ready[0]);
        }
    }

    #[test]
    fn test_parallel_batch_for_grouped_steps() {
        let mut run = Run::new(diamond_plan());
        complete(&mut run, 1);
        let ready = ready_set(&run);
        assert_eq!(parallel_batch(&ready, &run.plan), vec![2, 3]);
    }

    #[test]
    fn test_ungrouped_steps_dispatch_one_at_a_time() {
        let plan = ExecutionPlan::new("T", "feature")
            .with_step(PlanStep::new(1, AgentKind::Developer, "a"))
            .with_step(PlanStep::new(2, AgentKind::Developer, "b"));
        let run = Run::new(plan);
        let ready = ready_set(&run);
        assert_eq!(ready, vec![1, 2]);
        assert_eq!(parallel_batch(&ready, &run.plan), vec![1]);
    }

    #[test]
    fn test_has_cycle_detects_manual_cycle() {
        let mut plan = diamond_plan();
        assert!(!has_cycle(&plan));
        // Introduce 1 -> 4 back edge by hand.
        plan.steps[0].depends_on.insert(4);
        assert!(has_cycle(&plan));
    }

    #[test]
    fn test_unreachable_steps_behind_failure() {
        let mut run = Run::new(diamond_plan());
        complete(&mut run, 1);
        run.steps.get_mut(&2).unwrap().state = StepState::Failed;
        let poisoned = unreachable_steps(&run);
        assert!(poisoned.contains(&4));
        assert!(!poisoned.contains(&3));
    }

    #[test]
    fn test_rework_ready_state_included() {
        let mut run = Run::new(diamond_plan());
        complete(&mut run, 1);
        let exec = run.steps.get_mut(&2).unwrap();
        *exec = StepExecution::new(run.plan.step(2).unwrap());
        exec.begin_rework(AgentKind::Developer);
        assert!(ready_set(&run).contains(&2));
    }
}
