//! The runtime model: topology, model-level variables, the four stage lists
//! and the action registry.
//!
//! A `Model` is always an explicit value threaded through a [`RunContext`];
//! there is no process-wide instance. The topology's shape is fixed once the
//! model is built. Phases only change variables and host public IPs.
//!
//! [`RunContext`]: crate::context::RunContext

use crate::action::{Action, ActionRegistry};
use crate::error::{LabError, Result};
use crate::paths;
use crate::selector::{self, Selected, Selector};
use crate::stage::{Phase, Stage};
use crate::topology::{host_key, validate_topology, HostRef, HostView, Region, WarnLevel};
use crate::variables::{Scope, Variables};
use std::collections::HashMap;
use std::sync::Arc;

pub struct Model {
    id: String,
    scope: Scope,
    regions: Vec<Region>,
    stages: HashMap<Phase, Vec<Arc<dyn Stage>>>,
    actions: ActionRegistry,
    activation: Vec<String>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("id", &self.id)
            .field("regions", &self.regions.len())
            .field("actions", &self.actions.names())
            .finish()
    }
}

impl Model {
    pub fn builder(id: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            id: id.into(),
            scope: Scope::default(),
            regions: Vec::new(),
            stages: HashMap::new(),
            actions: ActionRegistry::new(),
            activation: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Model-level defaults, the outermost scope.
    pub fn variables(&self) -> &Variables {
        &self.scope.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.scope.variables
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut ActionRegistry {
        &mut self.actions
    }

    pub fn activation(&self) -> &[String] {
        &self.activation
    }

    /// Stages of one phase, cloned so the caller can run them while holding
    /// a mutable context.
    pub fn stages(&self, phase: Phase) -> Vec<Arc<dyn Stage>> {
        self.stages.get(&phase).cloned().unwrap_or_default()
    }

    pub fn select(&self, selector: &Selector) -> Vec<Selected<'_>> {
        selector::select(&self.regions, selector)
    }

    pub fn select_hosts(&self, selector: &Selector) -> Vec<HostRef<'_>> {
        selector::select_hosts(&self.regions, selector)
    }

    pub fn hosts(&self) -> impl Iterator<Item = HostRef<'_>> {
        self.regions
            .iter()
            .flat_map(|region| region.hosts.iter().map(move |host| HostRef { region, host }))
    }

    pub fn host(&self, key: &str) -> Option<HostRef<'_>> {
        self.hosts().find(|h| h.key() == key)
    }

    pub fn view(&self, host: HostRef<'_>) -> HostView {
        let variables = host
            .host
            .scope
            .variables
            .merged_over(&host.region.scope.variables.merged_over(&self.scope.variables));

        let mut tags: Vec<String> = host.host.scope.tags.clone();
        for component in &host.host.components {
            for tag in &component.scope.tags {
                if !tags.contains(tag) {
                    tags.push(tag.clone());
                }
            }
        }

        HostView {
            key: host.key(),
            id: host.host.id.clone(),
            region: host.region.id.clone(),
            site: host.region.site.clone(),
            instance_type: host.host.instance_type.clone(),
            public_ip: host.host.public_ip.clone(),
            tags,
            variables,
        }
    }

    pub fn host_view(&self, key: &str) -> Result<HostView> {
        self.host(key)
            .map(|h| self.view(h))
            .ok_or_else(|| LabError::InvalidModel(format!("no host '{key}' in model")))
    }

    pub fn host_views(&self) -> Vec<HostView> {
        self.hosts().map(|h| self.view(h)).collect()
    }

    /// Views of the distinct hosts matched by `selector`.
    pub fn selected_views(&self, selector: &Selector) -> Vec<HostView> {
        self.select_hosts(selector)
            .into_iter()
            .map(|h| self.view(h))
            .collect()
    }

    pub fn set_public_ip(&mut self, key: &str, ip: impl Into<String>) -> Result<()> {
        let ip = ip.into();
        for region in &mut self.regions {
            for host in &mut region.hosts {
                if host_key(&region.id, &host.id) == key {
                    host.public_ip = Some(ip);
                    return Ok(());
                }
            }
        }
        Err(LabError::InvalidModel(format!("no host '{key}' in model")))
    }

    pub fn clear_public_ips(&mut self) {
        for region in &mut self.regions {
            for host in &mut region.hosts {
                host.public_ip = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ModelBuilder
// ---------------------------------------------------------------------------

pub struct ModelBuilder {
    id: String,
    scope: Scope,
    regions: Vec<Region>,
    stages: HashMap<Phase, Vec<Arc<dyn Stage>>>,
    actions: ActionRegistry,
    activation: Vec<String>,
}

impl ModelBuilder {
    pub fn variable(mut self, path: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.scope.variables.set(path, value);
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.scope.variables = variables;
        self
    }

    pub fn region(mut self, region: Region) -> Self {
        self.regions.push(region);
        self
    }

    pub fn stage(mut self, phase: Phase, stage: impl Stage + 'static) -> Self {
        self.stages.entry(phase).or_default().push(Arc::new(stage));
        self
    }

    pub fn stage_arc(mut self, phase: Phase, stage: Arc<dyn Stage>) -> Self {
        self.stages.entry(phase).or_default().push(stage);
        self
    }

    pub fn action<F>(mut self, name: impl Into<String>, binder: F) -> Self
    where
        F: Fn(&Model) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.actions.bind(name, binder);
        self
    }

    pub fn activation<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activation.extend(names.into_iter().map(Into::into));
        self
    }

    /// Validate ids and topology shape. Warnings are dropped here; callers
    /// that want them use `ModelFile::validate`.
    pub fn build(self) -> Result<Model> {
        paths::validate_id(&self.id)?;
        let errors: Vec<String> = validate_topology(&self.regions)
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(LabError::InvalidModel(errors.join("; ")));
        }
        Ok(Model {
            id: self.id,
            scope: self.scope,
            regions: self.regions,
            stages: self.stages,
            actions: self.actions,
            activation: self.activation,
        })
    }
}
