//! Submission-time validation. Every violation is collected; nothing is
//! dispatched or persisted for a rejected workflow.

use crate::definition::WorkflowDefinition;
use crate::graph::StepGraph;
use agentmesh_core::{CapabilityKind, ValidationError};
use agentmesh_registry::Registry;
use std::collections::HashMap;

/// Structural checks only: limits, duplicates, references, cycles, bindings.
pub fn check_structure(def: &WorkflowDefinition) -> (StepGraph, Vec<ValidationError>) {
    let mut violations = Vec::new();
    if def.concurrency_limit == Some(0) {
        violations.push(ValidationError::InvalidConcurrencyLimit);
    }

    let (graph, build_violations) = StepGraph::build(def);
    violations.extend(build_violations);

    for path in graph.cycles() {
        violations.push(ValidationError::Cycle { path });
    }

    for step in graph.steps() {
        for (input, binding) in &step.input_bindings {
            if !step.predecessor_ids.contains(&binding.step) {
                violations.push(ValidationError::UnboundInput {
                    step: step.id.clone(),
                    input: input.clone(),
                    from_step: binding.step.clone(),
                });
            }
        }
    }
    (graph, violations)
}

/// Structural checks plus agent eligibility for every required capability.
pub fn validate(def: &WorkflowDefinition, registry: &Registry) -> Result<StepGraph, Vec<ValidationError>> {
    let (graph, mut violations) = check_structure(def);

    let mut eligible: HashMap<&CapabilityKind, bool> = HashMap::new();
    for step in graph.steps() {
        let cap = &step.required_capability;
        let any = *eligible
            .entry(cap)
            .or_insert_with(|| !registry.eligible(cap).is_empty());
        if !any {
            violations.push(ValidationError::NoEligibleAgent {
                step: step.id.clone(),
                capability: cap.clone(),
            });
        }
    }

    if violations.is_empty() {
        Ok(graph)
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;

    #[test]
    fn reports_every_violation() {
        let def = WorkflowDefinition::new("bad")
            .concurrency(0)
            .step(StepDefinition::new("a", "embed").after("b"))
            .step(StepDefinition::new("b", "embed").after("a"))
            .step(StepDefinition::new("c", "paint").after("ghost").bind("img", "a", "url"));
        let registry = Registry::default();
        let violations = validate(&def, &registry).unwrap_err();

        assert!(violations.contains(&ValidationError::InvalidConcurrencyLimit));
        assert!(violations.iter().any(|v| matches!(v, ValidationError::Cycle { .. })));
        assert!(violations.contains(&ValidationError::UnknownStepReference {
            step: "c".into(),
            reference: "ghost".into(),
        }));
        assert!(violations.contains(&ValidationError::UnboundInput {
            step: "c".into(),
            input: "img".into(),
            from_step: "a".into(),
        }));
        let no_agent = violations
            .iter()
            .filter(|v| matches!(v, ValidationError::NoEligibleAgent { .. }))
            .count();
        assert_eq!(no_agent, 3);
    }

    #[test]
    fn structure_check_ignores_agents() {
        let def = WorkflowDefinition::new("ok")
            .step(StepDefinition::new("a", "embed"))
            .step(StepDefinition::new("b", "store").after("a").bind("v", "a", "vector"));
        let (graph, violations) = check_structure(&def);
        assert!(violations.is_empty());
        assert_eq!(graph.len(), 2);
    }
}
