//! Capability model and the per-agent capability set

use crate::error::AgentError;
use crate::types::CapabilityKind;
use serde::{Deserialize, Serialize};

/// A typed, versioned unit of functionality an agent advertises.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub version: String,
    /// Capability kinds that must already be held before this one is added.
    #[serde(default)]
    pub depends_on: Vec<CapabilityKind>,
    /// Capability kinds that cannot be held alongside this one.
    #[serde(default)]
    pub conflicts_with: Vec<CapabilityKind>,
}

impl Capability {
    pub fn new(kind: impl Into<CapabilityKind>, version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            version: version.into(),
            depends_on: Vec::new(),
            conflicts_with: Vec::new(),
        }
    }

    pub fn depends_on(mut self, kind: impl Into<CapabilityKind>) -> Self {
        self.depends_on.push(kind.into());
        self
    }

    pub fn conflicts_with(mut self, kind: impl Into<CapabilityKind>) -> Self {
        self.conflicts_with.push(kind.into());
        self
    }
}

/// Ordered set of capabilities, at most one per kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilitySet {
    caps: Vec<Capability>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability atomically.
    ///
    /// A capability of the same kind is superseded (last writer wins) and
    /// returned. On any error the set is left unchanged.
    pub fn add(&mut self, cap: Capability) -> Result<Option<Capability>, AgentError> {
        let others = || self.caps.iter().filter(|c| c.kind != cap.kind);

        for dep in &cap.depends_on {
            if *dep != cap.kind && !others().any(|c| c.kind == *dep) {
                return Err(AgentError::MissingDependency {
                    capability: cap.kind.clone(),
                    missing: dep.clone(),
                });
            }
        }

        if let Some(existing) =
            others().find(|c| cap.conflicts_with.contains(&c.kind) || c.conflicts_with.contains(&cap.kind))
        {
            return Err(AgentError::CapabilityConflict {
                capability: cap.kind.clone(),
                existing: existing.kind.clone(),
            });
        }

        match self.caps.iter().position(|c| c.kind == cap.kind) {
            Some(idx) => {
                let superseded = self.caps.remove(idx);
                self.caps.insert(idx, cap);
                Ok(Some(superseded))
            }
            None => {
                self.caps.push(cap);
                Ok(None)
            }
        }
    }

    /// Remove a capability. Refused while another held capability depends on it.
    pub fn remove(&mut self, kind: &CapabilityKind) -> Result<Capability, AgentError> {
        let idx = self
            .caps
            .iter()
            .position(|c| &c.kind == kind)
            .ok_or_else(|| AgentError::CapabilityNotHeld(kind.clone()))?;
        if let Some(dependent) = self
            .caps
            .iter()
            .find(|c| &c.kind != kind && c.depends_on.contains(kind))
        {
            return Err(AgentError::RequiredByDependent {
                capability: kind.clone(),
                dependent: dependent.kind.clone(),
            });
        }
        Ok(self.caps.remove(idx))
    }

    pub fn get(&self, kind: &CapabilityKind) -> Option<&Capability> {
        self.caps.iter().find(|c| &c.kind == kind)
    }

    pub fn contains(&self, kind: &CapabilityKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<CapabilityKind> {
        self.caps.iter().map(|c| c.kind.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.caps.iter()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}
