//! Flat arena of steps indexed by position. Edges are index lists, so cycle
//! detection and persistence never chase references.

use crate::definition::{StepDefinition, WorkflowDefinition};
use agentmesh_core::{StepId, ValidationError};
use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

#[derive(Clone, Debug)]
pub struct StepGraph {
    steps: Vec<StepDefinition>,
    index: HashMap<StepId, usize>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Build the arena. Duplicate declarations and edges to undeclared steps
    /// are reported and left out of the graph.
    pub fn build(def: &WorkflowDefinition) -> (Self, Vec<ValidationError>) {
        let mut violations = Vec::new();
        let mut steps = Vec::with_capacity(def.steps.len());
        let mut index = HashMap::new();
        for step in &def.steps {
            if index.contains_key(&step.id) {
                violations.push(ValidationError::DuplicateStep { step: step.id.clone() });
                continue;
            }
            index.insert(step.id.clone(), steps.len());
            steps.push(step.clone());
        }

        let mut preds = vec![Vec::new(); steps.len()];
        let mut succs = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for pred in &step.predecessor_ids {
                match index.get(pred) {
                    Some(&p) => {
                        if !preds[i].contains(&p) {
                            preds[i].push(p);
                            succs[p].push(i);
                        }
                    }
                    None => violations.push(ValidationError::UnknownStepReference {
                        step: step.id.clone(),
                        reference: pred.clone(),
                    }),
                }
            }
        }

        (
            Self {
                steps,
                index,
                preds,
                succs,
            },
            violations,
        )
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn index_of(&self, id: &StepId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn step(&self, i: usize) -> &StepDefinition {
        &self.steps[i]
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn predecessors(&self, i: usize) -> &[usize] {
        &self.preds[i]
    }

    pub fn successors(&self, i: usize) -> &[usize] {
        &self.succs[i]
    }

    /// Every cycle reachable by depth-first traversal, one per back edge,
    /// as the path of step ids that closes on itself.
    pub fn cycles(&self) -> Vec<Vec<StepId>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut found = Vec::new();
        // explicit stack of (node, next successor to try); it is also the path
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for start in 0..self.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::OnPath;
            stack.push((start, 0));
            while let Some(top) = stack.last_mut() {
                let (node, edge) = *top;
                let Some(&next) = self.succs[node].get(edge) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;
                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnPath;
                        stack.push((next, 0));
                    }
                    Mark::OnPath => {
                        let from = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut cycle: Vec<StepId> =
                            stack[from..].iter().map(|&(n, _)| self.steps[n].id.clone()).collect();
                        cycle.push(self.steps[next].id.clone());
                        found.push(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }
        found
    }

    /// Kahn order; `None` when the graph has a cycle.
    pub fn topological_order(&self) -> Option<Vec<usize>> {
        let mut indegree: Vec<usize> = self.preds.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &s in &self.succs[i] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.push_back(s);
                }
            }
        }
        (order.len() == self.len()).then_some(order)
    }

    /// Transitive dependents of `i`, excluding `i`.
    pub fn dependents(&self, i: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue: VecDeque<usize> = self.succs[i].iter().copied().collect();
        let mut out = Vec::new();
        while let Some(n) = queue.pop_front() {
            if std::mem::replace(&mut seen[n], true) {
                continue;
            }
            out.push(n);
            queue.extend(self.succs[n].iter().copied());
        }
        out.sort_unstable();
        out
    }
}
