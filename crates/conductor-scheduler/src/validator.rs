//! Plan validation and normalization.
//!
//! Every plan passes through here before a run is created. The validator
//! checks the dependency relation is a coherent DAG, enforces the platform
//! and project process rules (inserting the mandatory QA step and mandatory
//! human gates where absent), and rejects anything the scheduler could not
//! execute safely. It is pure: identical inputs produce identical output
//! plans, including the numbering of inserted steps and the IDs of inserted
//! gates.

use crate::config::{MandatoryGate, PlatformRules, ProjectRules};
use crate::types::{ExecutionPlan, HumanGate, PlanStep};
use conductor_core::{AgentKind, ConductorError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

/// Why a plan was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The dependency relation contains a cycle.
    CyclicDependency,
    /// A step or gate references a step number that does not exist.
    DanglingDependency,
    /// A step the process rules mandate is missing and cannot be inserted.
    MissingMandatoryStep,
    /// Two steps share the same step number.
    DuplicateStepNumber,
    /// A step or rework target names a capability the rules do not allow.
    UnknownAgent,
    /// A parallel group contains dependent or unknown steps.
    InvalidParallelGroup,
}

/// Rejection produced by [`PlanValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{detail}")]
pub struct ValidationError {
    /// Rejection category.
    pub kind: ValidationErrorKind,
    /// Human-readable description.
    pub detail: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<ValidationError> for ConductorError {
    fn from(e: ValidationError) -> Self {
        ConductorError::Validation(e.to_string())
    }
}

/// Normalizes raw plans against platform and project rules.
pub struct PlanValidator {
    platform: PlatformRules,
    project: ProjectRules,
}

impl PlanValidator {
    /// Creates a validator for the given rule set.
    pub fn new(platform: PlatformRules, project: ProjectRules) -> Self {
        Self { platform, project }
    }

    /// Capabilities the combined rules permit.
    fn allowed_agents(&self) -> BTreeSet<AgentKind> {
        self.platform
            .allowed_agents
            .iter()
            .filter(|a| !self.project.denied_agents.contains(a))
            .copied()
            .collect()
    }

    /// Validate and normalize a raw plan.
    ///
    /// On success the returned plan is acyclic, references only existing
    /// steps, carries the mandatory QA step and mandatory gates, and its
    /// parallel groups contain only mutually independent steps.
    pub fn validate(&self, raw: ExecutionPlan) -> Result<ExecutionPlan, ValidationError> {
        let mut plan = raw;

        if plan.steps.is_empty() {
            return Err(ValidationError::new(
                ValidationErrorKind::MissingMandatoryStep,
                "plan has no steps",
            ));
        }

        check_step_numbers(&plan)?;
        check_dependencies(&plan)?;
        self.check_agents(&plan)?;
        topological_order(&plan.steps)?;

        if self.platform.require_qa_step {
            insert_qa_step(&mut plan);
        }

        for rule in self
            .platform
            .mandatory_gates
            .iter()
            .chain(&self.project.extra_gates)
        {
            insert_mandatory_gate(&mut plan, rule);
        }

        check_gates(&plan)?;
        check_parallel_groups(&plan)?;

        // Insertions must not have broken the DAG.
        topological_order(&plan.steps)?;

        Ok(plan)
    }

    fn check_agents(&self, plan: &ExecutionPlan) -> Result<(), ValidationError> {
        let allowed = self.allowed_agents();
        for step in &plan.steps {
            if !allowed.contains(&step.agent) {
                return Err(ValidationError::new(
                    ValidationErrorKind::UnknownAgent,
                    format!(
                        "step {} uses agent '{}' which the rules do not allow",
                        step.step_number, step.agent
                    ),
                ));
            }
        }
        for gate in &plan.human_gates {
            if let Some(target) = gate.rework_target {
                if !allowed.contains(&target) {
                    return Err(ValidationError::new(
                        ValidationErrorKind::UnknownAgent,
                        format!(
                            "gate {} routes rework to disallowed agent '{target}'",
                            gate.gate_id
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_step_numbers(plan: &ExecutionPlan) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for step in &plan.steps {
        if !seen.insert(step.step_number) {
            return Err(ValidationError::new(
                ValidationErrorKind::DuplicateStepNumber,
                format!("step number {} appears more than once", step.step_number),
            ));
        }
    }
    Ok(())
}

fn check_dependencies(plan: &ExecutionPlan) -> Result<(), ValidationError> {
    let numbers: BTreeSet<u32> = plan.steps.iter().map(|s| s.step_number).collect();
    for step in &plan.steps {
        for dep in &step.depends_on {
            if *dep == step.step_number {
                return Err(ValidationError::new(
                    ValidationErrorKind::CyclicDependency,
                    format!("step {} depends on itself", step.step_number),
                ));
            }
            if !numbers.contains(dep) {
                return Err(ValidationError::new(
                    ValidationErrorKind::DanglingDependency,
                    format!("step {} depends on missing step {dep}", step.step_number),
                ));
            }
        }
    }
    Ok(())
}

fn check_gates(plan: &ExecutionPlan) -> Result<(), ValidationError> {
    let agents: BTreeSet<AgentKind> = plan.steps.iter().map(|s| s.agent).collect();
    for gate in &plan.human_gates {
        if plan.step(gate.step_number).is_none() {
            return Err(ValidationError::new(
                ValidationErrorKind::DanglingDependency,
                format!(
                    "gate {} references missing step {}",
                    gate.gate_id, gate.step_number
                ),
            ));
        }
        if let Some(target) = gate.rework_target {
            if !agents.contains(&target) {
                return Err(ValidationError::new(
                    ValidationErrorKind::UnknownAgent,
                    format!(
                        "gate {} routes rework to '{target}' but no step uses that agent",
                        gate.gate_id
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm; `Err` means the dependency relation has a cycle.
pub(crate) fn topological_order(steps: &[PlanStep]) -> Result<Vec<u32>, ValidationError> {
    let mut in_degree: BTreeMap<u32, usize> = steps
        .iter()
        .map(|s| (s.step_number, s.depends_on.len()))
        .collect();
    let mut dependents: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents.entry(*dep).or_default().push(step.step_number);
        }
    }

    let mut queue: VecDeque<u32> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(n) = queue.pop_front() {
        order.push(n);
        for dependent in dependents.get(&n).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|(n, _)| !order.contains(n))
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(ValidationError::new(
            ValidationErrorKind::CyclicDependency,
            format!("dependency cycle involving steps [{}]", stuck.join(", ")),
        ));
    }
    Ok(order)
}

/// Insert the mandatory QA step when developer work exists without one.
///
/// The inserted step depends on every terminal developer step (developer
/// steps no other step depends on) and takes the next step number, so the
/// insertion is deterministic.
fn insert_qa_step(plan: &mut ExecutionPlan) {
    if plan.steps.iter().any(|s| s.agent == AgentKind::Qa) {
        return;
    }
    let terminal_devs: BTreeSet<u32> = plan
        .steps
        .iter()
        .filter(|s| s.agent == AgentKind::Developer)
        .filter(|dev| {
            !plan
                .steps
                .iter()
                .any(|other| other.depends_on.contains(&dev.step_number))
        })
        .map(|s| s.step_number)
        .collect();
    if terminal_devs.is_empty() {
        return;
    }

    let number = plan.max_step_number() + 1;
    plan.steps.push(
        PlanStep::new(
            number,
            AgentKind::Qa,
            "Verify the implementation produced by the developer steps",
        )
        .with_depends_on(terminal_devs),
    );
}

/// Attach a rule-mandated gate to the final step of the named capability.
///
/// No-op when the plan has no step of that capability or the step is already
/// gated. Gate IDs derive from the plan ID and step number so repeated
/// validation yields identical output.
fn insert_mandatory_gate(plan: &mut ExecutionPlan, rule: &MandatoryGate) {
    let Some(step_number) = plan
        .steps
        .iter()
        .filter(|s| s.agent == rule.after_agent)
        .map(|s| s.step_number)
        .max()
    else {
        return;
    };
    if plan.gate_for(step_number).is_some() {
        return;
    }

    let name = format!("{}:gate:{step_number}", plan.plan_id);
    plan.human_gates.push(HumanGate {
        gate_id: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
        step_number,
        required: true,
        rework_target: rule.rework_target,
    });
}

/// Parallel groups may only contain mutually independent, existing steps.
fn check_parallel_groups(plan: &ExecutionPlan) -> Result<(), ValidationError> {
    let numbers: BTreeSet<u32> = plan.steps.iter().map(|s| s.step_number).collect();
    for group in &plan.parallel_groups {
        for member in group {
            if !numbers.contains(member) {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidParallelGroup,
                    format!("parallel group references missing step {member}"),
                ));
            }
        }
        for a in group {
            for b in group {
                if a < b && (depends_transitively(plan, *a, *b) || depends_transitively(plan, *b, *a))
                {
                    return Err(ValidationError::new(
                        ValidationErrorKind::InvalidParallelGroup,
                        format!("steps {a} and {b} are dependent and cannot run in parallel"),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Whether `from` transitively depends on `to`.
fn depends_transitively(plan: &ExecutionPlan, from: u32, to: u32) -> bool {
    let mut queue = VecDeque::from([from]);
    let mut seen = BTreeSet::new();
    while let Some(n) = queue.pop_front() {
        if !seen.insert(n) {
            continue;
        }
        let Some(step) = plan.step(n) else { continue };
        for dep in &step.depends_on {
            if *dep == to {
                return true;
            }
            queue.push_back(*dep);
        }
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn validator() -> PlanValidator {
        PlanValidator::new(PlatformRules::default(), ProjectRules::default())
    }

    fn dev_only_plan() -> ExecutionPlan {
        ExecutionPlan::new("TICKET-7", "feature")
            .with_step(PlanStep::new(1, AgentKind::Developer, "scaffold module"))
            .with_step(PlanStep::new(2, AgentKind::Developer, "wire endpoints").with_depends_on([1]))
    }

    #[test]
    fn test_inserts_exactly_one_qa_step() {
        let plan = validator().validate(dev_only_plan()).unwrap();
        let qa: Vec<&PlanStep> = plan.steps.iter().filter(|s| s.agent == AgentKind::Qa).collect();
        assert_eq!(qa.len(), 1);
        assert_eq!(qa[0].step_number, 3);
        // Depends on the terminal developer step only.
        assert_eq!(qa[0].depends_on, BTreeSet::from([2]));
    }

    #[test]
    fn test_existing_qa_step_not_duplicated() {
        let raw = dev_only_plan()
            .with_step(PlanStep::new(3, AgentKind::Qa, "run suite").with_depends_on([2]));
        let plan = validator().validate(raw).unwrap();
        assert_eq!(
            plan.steps.iter().filter(|s| s.agent == AgentKind::Qa).count(),
            1
        );
    }

    #[test]
    fn test_output_plan_is_acyclic() {
        let plan = validator().validate(dev_only_plan()).unwrap();
        assert!(topological_order(&plan.steps).is_ok());
    }

    #[test]
    fn test_rejects_cycle() {
        let raw = ExecutionPlan::new("T", "bugfix")
            .with_step(PlanStep::new(1, AgentKind::Developer, "a").with_depends_on([2]))
            .with_step(PlanStep::new(2, AgentKind::Developer, "b").with_depends_on([1]));
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::CyclicDependency);
    }

    #[test]
    fn test_rejects_self_dependency() {
        let raw = ExecutionPlan::new("T", "bugfix")
            .with_step(PlanStep::new(1, AgentKind::Developer, "a").with_depends_on([1]));
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::CyclicDependency);
    }

    #[test]
    fn test_rejects_dangling_dependency() {
        let raw = ExecutionPlan::new("T", "bugfix")
            .with_step(PlanStep::new(1, AgentKind::Developer, "a").with_depends_on([42]));
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::DanglingDependency);
    }

    #[test]
    fn test_rejects_duplicate_step_numbers() {
        let raw = ExecutionPlan::new("T", "bugfix")
            .with_step(PlanStep::new(1, AgentKind::Developer, "a"))
            .with_step(PlanStep::new(1, AgentKind::Qa, "b"));
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::DuplicateStepNumber);
    }

    #[test]
    fn test_rejects_denied_agent() {
        let project = ProjectRules {
            denied_agents: BTreeSet::from([AgentKind::Devops]),
            ..ProjectRules::default()
        };
        let v = PlanValidator::new(PlatformRules::default(), project);
        let raw = ExecutionPlan::new("T", "feature")
            .with_step(PlanStep::new(1, AgentKind::Devops, "deploy"));
        let err = v.validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::UnknownAgent);
    }

    #[test]
    fn test_rejects_dependent_parallel_group() {
        let raw = dev_only_plan().with_parallel_group([1, 2]);
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::InvalidParallelGroup);
    }

    #[test]
    fn test_accepts_independent_parallel_group() {
        let raw = ExecutionPlan::new("T", "feature")
            .with_step(PlanStep::new(1, AgentKind::Developer, "backend"))
            .with_step(PlanStep::new(2, AgentKind::Developer, "frontend"))
            .with_parallel_group([1, 2]);
        assert!(validator().validate(raw).is_ok());
    }

    #[test]
    fn test_mandatory_gate_inserted_deterministically() {
        let platform = PlatformRules {
            mandatory_gates: vec![MandatoryGate {
                after_agent: AgentKind::Qa,
                rework_target: Some(AgentKind::Developer),
            }],
            ..PlatformRules::default()
        };
        let v = PlanValidator::new(platform, ProjectRules::default());

        let first = v.validate(dev_only_plan()).unwrap();
        let again = v.validate(first.clone()).unwrap();

        assert_eq!(first.human_gates.len(), 1);
        // Gate lands on the inserted QA step.
        assert_eq!(first.human_gates[0].step_number, 3);
        assert_eq!(first.human_gates[0].rework_target, Some(AgentKind::Developer));
        // Re-validating is a fixpoint: same gate, same ID.
        assert_eq!(again.human_gates.len(), 1);
        assert_eq!(again.human_gates[0].gate_id, first.human_gates[0].gate_id);
    }

    #[test]
    fn test_gate_on_missing_step_rejected() {
        let raw = dev_only_plan().with_gate(HumanGate::new(99));
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::DanglingDependency);
    }

    #[test]
    fn test_empty_plan_rejected() {
        let err = validator()
            .validate(ExecutionPlan::new("T", "feature"))
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingMandatoryStep);
    }
}
