//! The YAML topology file (`topolab.yaml`) and its conversion to a [`Model`].

use crate::action::{ActionSpec, NamedAction};
use crate::bootstrap::BootstrapSpec;
use crate::env::EnvSource;
use crate::error::{LabError, Result};
use crate::model::Model;
use crate::paths;
use crate::provision::ProvisionerSpec;
use crate::selector::Selector;
use crate::stage::{Phase, StageSpec};
use crate::topology::{validate_topology, ModelWarning, Region, WarnLevel};
use crate::transport::TransportSpec;
use crate::variables::{Scope, Variables};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// Directory holding config templates and data files, relative to the
    /// model file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configs: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default)]
    pub provisioner: ProvisionerSpec,
    #[serde(default)]
    pub transport: TransportSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub id: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bootstrap: Vec<BootstrapSpec>,
    #[serde(default)]
    pub regions: Vec<Region>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NamedAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activation: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infrastructure: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configuration: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub distribution: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disposal: Vec<StageSpec>,
}

impl ModelFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LabError::InvalidModel(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn stages(&self, phase: Phase) -> &[StageSpec] {
        match phase {
            Phase::Infrastructure => &self.infrastructure,
            Phase::Configuration => &self.configuration,
            Phase::Distribution => &self.distribution,
            Phase::Disposal => &self.disposal,
        }
    }

    /// Directory that `resources.configs` and exec commands are relative to.
    pub fn base_dir(path: &Path) -> PathBuf {
        match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ModelWarning> {
        let mut warnings = Vec::new();

        // 1. Model id and topology shape
        if paths::validate_id(&self.id).is_err() {
            warnings.push(ModelWarning::error(format!("invalid model id '{}'", self.id)));
        }
        warnings.extend(validate_topology(&self.regions));
        self.check_shadowing(&mut warnings);

        // 2. Stages: static checks, and stages outside their natural phase
        for phase in Phase::all() {
            for spec in self.stages(*phase) {
                if let Err(e) = spec.check() {
                    warnings.push(ModelWarning::error(format!("{phase} stage '{}': {e}", spec.kind())));
                }
                if spec.natural_phase() != *phase {
                    warnings.push(ModelWarning::warning(format!(
                        "stage '{}' is listed under {phase} but belongs to {}",
                        spec.kind(),
                        spec.natural_phase()
                    )));
                }
            }
        }

        // 3. Config templates need a resource bundle
        let renders = self
            .configuration
            .iter()
            .any(|s| matches!(s, StageSpec::RenderConfigs));
        let has_templates = self
            .regions
            .iter()
            .flat_map(|r| &r.hosts)
            .flat_map(|h| &h.components)
            .any(|c| c.config_src.is_some());
        if renders && has_templates && self.resources.configs.is_none() {
            warnings.push(ModelWarning::error(
                "render_configs needs resources.configs for component templates",
            ));
        }

        // 4. Actions and activation
        let mut seen = HashSet::new();
        for action in &self.actions {
            if paths::validate_id(&action.name).is_err() {
                warnings.push(ModelWarning::error(format!("invalid action name '{}'", action.name)));
            }
            if !seen.insert(action.name.as_str()) {
                warnings.push(ModelWarning::warning(format!(
                    "action '{}' is defined more than once; the last definition wins",
                    action.name
                )));
            }
            if let Some(sel) = action.spec.selector() {
                if let Err(e) = Selector::parse(sel) {
                    warnings.push(ModelWarning::error(format!("action '{}': {e}", action.name)));
                }
            }
            if let ActionSpec::Sequence { actions } = &action.spec {
                for name in actions {
                    if !seen_any(&self.actions, name) {
                        warnings.push(ModelWarning::error(format!(
                            "action '{}' refers to unknown action '{name}'",
                            action.name
                        )));
                    }
                }
            }
        }
        if let Some(cycle) = self.sequence_cycle() {
            warnings.push(ModelWarning::error(format!(
                "action sequence cycle: {}",
                cycle.join(" -> ")
            )));
        }
        for name in &self.activation {
            if !seen_any(&self.actions, name) {
                warnings.push(ModelWarning::error(format!(
                    "activation refers to unknown action '{name}'"
                )));
            }
        }

        warnings
    }

    pub fn has_errors(warnings: &[ModelWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }

    /// Region or host values whose type differs from the model default
    /// they shadow, e.g. a string where the model has a mapping.
    fn check_shadowing(&self, warnings: &mut Vec<ModelWarning>) {
        let defaults = &self.scope.variables;
        let mut check = |label: &str, vars: &Variables| {
            for (path, _) in vars.flatten() {
                if let (Some(inner), Some(outer)) = (vars.get(&path), defaults.get(&path)) {
                    if kind(inner) != kind(outer) {
                        warnings.push(ModelWarning::warning(format!(
                            "{label} sets '{path}' as {} but the model default is {}",
                            kind(inner),
                            kind(outer)
                        )));
                    }
                }
            }
        };
        for region in &self.regions {
            check(&format!("region '{}'", region.id), &region.scope.variables);
            for host in &region.hosts {
                check(
                    &format!("host '{}/{}'", region.id, host.id),
                    &host.scope.variables,
                );
            }
        }
    }

    fn sequence_cycle(&self) -> Option<Vec<String>> {
        let edges: HashMap<&str, &[String]> = self
            .actions
            .iter()
            .filter_map(|a| match &a.spec {
                ActionSpec::Sequence { actions } => Some((a.name.as_str(), actions.as_slice())),
                _ => None,
            })
            .collect();

        fn visit<'a>(
            node: &'a str,
            edges: &HashMap<&'a str, &'a [String]>,
            stack: &mut Vec<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Option<Vec<String>> {
            if let Some(pos) = stack.iter().position(|n| *n == node) {
                let mut cycle: Vec<String> = stack[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            if !done.insert(node) {
                return None;
            }
            stack.push(node);
            for next in edges.get(node).copied().unwrap_or_default() {
                if let Some(cycle) = visit(next, edges, stack, done) {
                    return Some(cycle);
                }
            }
            stack.pop();
            None
        }

        let mut done = HashSet::new();
        for action in &self.actions {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(&action.name, &edges, &mut stack, &mut done) {
                return Some(cycle);
            }
        }
        None
    }
}

fn seen_any(actions: &[NamedAction], name: &str) -> bool {
    actions.iter().any(|a| a.name == name)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

impl Model {
    /// Build the runtime model. Blocking validation errors are returned as
    /// `InvalidModel`; warnings are left to the caller.
    pub fn from_file(file: &ModelFile, env: &dyn EnvSource) -> Result<Model> {
        let errors: Vec<String> = file
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if !errors.is_empty() {
            return Err(LabError::InvalidModel(errors.join("; ")));
        }

        let mut builder = Model::builder(file.id.clone()).variables(file.scope.variables.clone());
        for region in &file.regions {
            builder = builder.region(region.clone());
        }
        for phase in Phase::all() {
            for spec in file.stages(*phase) {
                builder = builder.stage_arc(*phase, spec.build(env)?);
            }
        }
        builder = builder.activation(file.activation.iter().cloned());
        let mut model = builder.build()?;
        for action in &file.actions {
            model.actions_mut().bind_spec(action)?;
        }
        Ok(model)
    }
}
