//! Template-based agent creation.
//!
//! A template binds a type tag to a constructor and a default capability set.
//! Created agents are initialized, then registered; an agent whose
//! construction or initialization fails is never registered.

use crate::health::ScalingHint;
use crate::registry::Registry;
use agentmesh_agent::{Agent, AgentHandle, RuntimeOptions};
use agentmesh_core::{AgentId, Capability, CapabilityKind, CapabilitySet, FactoryError};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub type Constructor =
    Arc<dyn Fn(&AgentId, &serde_json::Value) -> Result<Box<dyn Agent>, String> + Send + Sync>;

#[derive(Clone)]
pub struct AgentTemplate {
    pub name: String,
    pub agent_type: String,
    pub capabilities: CapabilitySet,
    constructor: Constructor,
}

impl AgentTemplate {
    pub fn new<F>(name: impl Into<String>, agent_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&AgentId, &serde_json::Value) -> Result<Box<dyn Agent>, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            capabilities: CapabilitySet::new(),
            constructor: Arc::new(constructor),
        }
    }

    /// Add a default capability. An invalid one is logged and skipped.
    pub fn capability(mut self, cap: Capability) -> Self {
        if let Err(e) = self.capabilities.add(cap) {
            warn!("template {}: {}", self.name, e);
        }
        self
    }

    pub fn provides(&self, kind: &CapabilityKind) -> bool {
        self.capabilities.contains(kind)
    }
}

/// Per-instance adjustments to a template.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub id: Option<AgentId>,
    /// Added on top of the template defaults (same kind replaces).
    pub capabilities: Vec<Capability>,
    /// Passed to the constructor.
    pub params: serde_json::Value,
}

impl Overrides {
    pub fn id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn capability(mut self, cap: Capability) -> Self {
        self.capabilities.push(cap);
        self
    }

    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

pub struct AgentFactory {
    registry: Arc<Registry>,
    options: RuntimeOptions,
    /// registration order matters for capability lookups
    templates: RwLock<Vec<AgentTemplate>>,
    origins: DashMap<AgentId, (String, Overrides)>,
    counter: AtomicU64,
}

impl AgentFactory {
    pub fn new(registry: Arc<Registry>, options: RuntimeOptions) -> Self {
        Self {
            registry,
            options,
            templates: RwLock::new(Vec::new()),
            origins: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    /// Add or replace a template by name.
    pub fn register_template(&self, template: AgentTemplate) {
        let mut templates = self.templates.write();
        info!("template {} ({})", template.name, template.agent_type);
        match templates.iter_mut().find(|t| t.name == template.name) {
            Some(existing) => *existing = template,
            None => templates.push(template),
        }
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates.read().iter().map(|t| t.name.clone()).collect()
    }

    fn template(&self, name: &str) -> Option<AgentTemplate> {
        self.templates.read().iter().find(|t| t.name == name).cloned()
    }

    /// Construct, initialize and register one agent.
    pub async fn create(&self, template_name: &str, overrides: Overrides) -> Result<AgentHandle, FactoryError> {
        let template = self
            .template(template_name)
            .ok_or_else(|| FactoryError::UnknownTemplate(template_name.to_string()))?;
        let id = overrides.id.clone().unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            AgentId::new(format!("{}-{}", template.name, n))
        });

        let mut capabilities = template.capabilities.clone();
        for cap in &overrides.capabilities {
            capabilities
                .add(cap.clone())
                .map_err(|e| FactoryError::initialization_failed(&template.name, e.to_string()))?;
        }

        let agent = (template.constructor)(&id, &overrides.params)
            .map_err(|reason| FactoryError::initialization_failed(&template.name, reason))?;
        let handle = AgentHandle::spawn(id.clone(), agent, capabilities, self.options.clone())
            .await
            .map_err(|e| {
                warn!("agent {} from template {} failed: {}", id, template.name, e);
                FactoryError::initialization_failed(&template.name, e.to_string())
            })?;

        self.registry.register(handle.clone());
        self.origins.insert(id.clone(), (template.name.clone(), overrides));
        info!("created agent {} from template {}", id, template.name);
        Ok(handle)
    }

    /// Scaling hook: create `count` more instances of the first template that
    /// provides `capability`. Choosing `count` is the supervisor's job.
    pub async fn scale_up(&self, capability: &CapabilityKind, count: usize) -> Result<Vec<AgentHandle>, FactoryError> {
        let template = self
            .templates
            .read()
            .iter()
            .find(|t| t.provides(capability))
            .map(|t| t.name.clone())
            .ok_or_else(|| FactoryError::NoTemplateForCapability(capability.clone()))?;
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            created.push(self.create(&template, Overrides::default()).await?);
        }
        info!("scaled {} up by {} via {}", capability, count, template);
        Ok(created)
    }

    /// Apply a scaling hint, targeting `per_agent_load` queued messages each.
    pub async fn apply_hint(&self, hint: &ScalingHint, per_agent_load: usize) -> Result<Vec<AgentHandle>, FactoryError> {
        let extra = hint.additional_instances(per_agent_load);
        if extra == 0 {
            return Ok(Vec::new());
        }
        self.scale_up(&hint.capability, extra).await
    }

    /// Discard an agent and build a fresh one from the same template under the
    /// same id.
    pub async fn recreate(&self, id: &AgentId) -> Result<AgentHandle, FactoryError> {
        let (template, overrides) = self
            .origins
            .get(id)
            .map(|o| o.value().clone())
            .ok_or_else(|| FactoryError::UnknownTemplate(format!("no template recorded for agent {}", id)))?;
        if let Some(old) = self.registry.deregister(id) {
            // a wedged handler must not block the replacement
            tokio::spawn(async move { old.shutdown().await });
        }
        info!("recreating agent {} from template {}", id, template);
        self.create(&template, overrides.id(id.clone())).await
    }
}
