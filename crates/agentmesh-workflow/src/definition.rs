//! Workflow definitions as submitted: a set of steps with predecessor edges.

use agentmesh_core::{CapabilityKind, Error, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Pulls a named output of a predecessor into this step's inputs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InputBinding {
    pub step: StepId,
    pub output: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepDefinition {
    pub id: StepId,
    pub required_capability: CapabilityKind,
    #[serde(default)]
    pub predecessor_ids: Vec<StepId>,
    /// input name -> predecessor output
    #[serde(default)]
    pub input_bindings: BTreeMap<String, InputBinding>,
    /// Static parameters sent with every attempt.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-attempt deadline; falls back to the workflow config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepDefinition {
    pub fn new(id: impl Into<StepId>, capability: impl Into<CapabilityKind>) -> Self {
        Self {
            id: id.into(),
            required_capability: capability.into(),
            predecessor_ids: Vec::new(),
            input_bindings: BTreeMap::new(),
            params: serde_json::Value::Null,
            timeout_ms: None,
        }
    }

    pub fn after(mut self, step: impl Into<StepId>) -> Self {
        self.predecessor_ids.push(step.into());
        self
    }

    pub fn bind(mut self, input: &str, step: impl Into<StepId>, output: &str) -> Self {
        self.input_bindings.insert(
            input.to_string(),
            InputBinding {
                step: step.into(),
                output: output.to_string(),
            },
        );
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub steps: Vec<StepDefinition>,
    /// Falls back to the workflow config when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<WorkflowId>) -> Self {
        Self {
            id: id.into(),
            steps: Vec::new(),
            concurrency_limit: None,
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Load a definition from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
                .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e))),
            _ => Ok(serde_json::from_str(&text)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submission_shape() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "id": "ingest",
            "concurrency_limit": 2,
            "steps": [
                {"id": "fetch", "required_capability": "image.fetch"},
                {
                    "id": "embed",
                    "required_capability": "image.embed",
                    "predecessor_ids": ["fetch"],
                    "input_bindings": {"url": {"step": "fetch", "output": "url"}}
                }
            ]
        }))
        .unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].input_bindings["url"].step.as_str(), "fetch");
        assert_eq!(def.concurrency_limit, Some(2));
    }

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        std::fs::write(
            &path,
            "id: wf\nsteps:\n  - id: a\n    required_capability: embed\n  - id: b\n    required_capability: store\n    predecessor_ids: [a]\n",
        )
        .unwrap();
        let def = WorkflowDefinition::load(&path).unwrap();
        assert_eq!(def.steps[1].predecessor_ids, vec![StepId::new("a")]);
    }
}
