//! Pluggable selection strategies.

use agentmesh_agent::AgentHandle;
use agentmesh_core::CapabilityKind;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one of `candidates` (all eligible, in registration order).
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, capability: &CapabilityKind, candidates: &[AgentHandle]) -> Option<usize>;
}

/// Rotates through eligible agents, one counter per capability.
#[derive(Default)]
pub struct RoundRobin {
    counters: DashMap<CapabilityKind, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, capability: &CapabilityKind, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let counter = self
            .counters
            .entry(capability.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        Some(counter.fetch_add(1, Ordering::Relaxed) % len)
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, capability: &CapabilityKind, candidates: &[AgentHandle]) -> Option<usize> {
        self.next(capability, candidates.len())
    }
}

/// Lowest recent error rate, then lowest latency; ties rotate.
#[derive(Default)]
pub struct PerformanceBased {
    tie_break: RoundRobin,
}

const EPSILON: f64 = 1e-9;

impl PerformanceBased {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for PerformanceBased {
    fn name(&self) -> &'static str {
        "performance_based"
    }

    fn select(&self, capability: &CapabilityKind, candidates: &[AgentHandle]) -> Option<usize> {
        let scores: Vec<(f64, f64)> = candidates
            .iter()
            .map(|a| {
                let p = a.performance();
                (p.error_rate, p.latency_ema_ms)
            })
            .collect();
        let best_error = scores.iter().map(|s| s.0).fold(f64::INFINITY, f64::min);
        let by_error: Vec<usize> = (0..scores.len())
            .filter(|&i| scores[i].0 - best_error < EPSILON)
            .collect();
        let best_latency = by_error
            .iter()
            .map(|&i| scores[i].1)
            .fold(f64::INFINITY, f64::min);
        let tied: Vec<usize> = by_error
            .into_iter()
            .filter(|&i| scores[i].1 - best_latency < EPSILON)
            .collect();
        let pick = self.tie_break.next(capability, tied.len())?;
        Some(tied[pick])
    }
}
