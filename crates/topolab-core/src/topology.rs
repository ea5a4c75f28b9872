//! Regions, hosts and components.
//!
//! The topology is declared once and its shape never changes during a run;
//! only host public IPs and scope variables are filled in as phases execute.
//! Every collection is a `Vec` so declaration order is preserved end to end.

use crate::error::{LabError, Result};
use crate::paths;
use crate::variables::{Scope, Variables};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    /// Executable (possibly with a subcommand, e.g. `ziti controller`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Template in the config bundle rendered for this component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_src: Option<String>,
    /// File name of the rendered config under `cfg/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_identity: Option<String>,
    /// Start command override; see `action::start_command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default)]
    pub scope: Scope,
}

impl Component {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            binary: None,
            config_src: None,
            config_name: None,
            public_identity: None,
            start: None,
            scope: Scope::default(),
        }
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn config(mut self, src: impl Into<String>, name: impl Into<String>) -> Self {
        self.config_src = Some(src.into());
        self.config_name = Some(name.into());
        self
    }

    pub fn public_identity(mut self, identity: impl Into<String>) -> Self {
        self.public_identity = Some(identity.into());
        self
    }

    pub fn start(mut self, command: impl Into<String>) -> Self {
        self.start = Some(command.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn variable(mut self, path: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.scope.variables.set(path, value);
        self
    }

    /// Rendered config file name: explicit `config_name`, otherwise the
    /// source name with a trailing `.tmpl` removed.
    pub fn rendered_config_name(&self) -> Option<String> {
        if let Some(name) = &self.config_name {
            return Some(name.clone());
        }
        self.config_src
            .as_deref()
            .map(|src| src.strip_suffix(".tmpl").unwrap_or(src).to_string())
    }
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    /// Declared for pre-provisioned labs; otherwise filled in by the
    /// infrastructure phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Host {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instance_type: None,
            public_ip: None,
            scope: Scope::default(),
            components: Vec::new(),
        }
    }

    pub fn instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }

    pub fn public_ip(mut self, ip: impl Into<String>) -> Self {
        self.public_ip = Some(ip.into());
        self
    }

    pub fn variable(mut self, path: &str, value: impl Into<serde_yaml::Value>) -> Self {
        self.scope.variables.set(path, value);
        self
    }

    pub fn component(mut self, component: Component) -> Self {
        self.components.push(component);
        self
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl Region {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            site: None,
            scope: Scope::default(),
            hosts: Vec::new(),
        }
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }
}

/// `<region>/<host>`: unique across the model even though host ids are only
/// unique within their region.
pub fn host_key(region: &str, host: &str) -> String {
    format!("{region}/{host}")
}

// ---------------------------------------------------------------------------
// Borrowed references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct HostRef<'a> {
    pub region: &'a Region,
    pub host: &'a Host,
}

impl HostRef<'_> {
    pub fn key(&self) -> String {
        host_key(&self.region.id, &self.host.id)
    }
}

// ---------------------------------------------------------------------------
// HostView
// ---------------------------------------------------------------------------

/// Owned, read-only snapshot of one host with its effective variables
/// (model → region → host). Resolvers and transports only ever see a view,
/// so work for one host cannot observe or change another host's state.
#[derive(Debug, Clone, PartialEq)]
pub struct HostView {
    pub key: String,
    pub id: String,
    pub region: String,
    pub site: Option<String>,
    pub instance_type: Option<String>,
    pub public_ip: Option<String>,
    pub tags: Vec<String>,
    pub variables: Variables,
}

impl HostView {
    pub fn public_ip(&self) -> Result<&str> {
        self.public_ip
            .as_deref()
            .ok_or_else(|| LabError::NotProvisioned(self.key.clone()))
    }

    pub fn var(&self, path: &str) -> Option<String> {
        self.variables.get_str(path)
    }

    pub fn must_str(&self, path: &str) -> Result<String> {
        self.variables.must_str(path, &self.key)
    }

    pub fn ssh_username(&self) -> String {
        self.var("credentials.ssh.username")
            .unwrap_or_else(|| "root".to_string())
    }

    pub fn ssh_key_path(&self) -> Option<String> {
        self.var("credentials.ssh.key_path")
    }

    /// The host's variables plus built-ins under `host.*`.
    pub fn host_variables(&self) -> Variables {
        let mut vars = self.variables.clone();
        self.set_builtins(&mut vars);
        vars
    }

    fn set_builtins(&self, vars: &mut Variables) {
        vars.set("host.id", self.id.as_str());
        vars.set("host.key", self.key.as_str());
        vars.set("host.region", self.region.as_str());
        if let Some(site) = &self.site {
            vars.set("host.site", site.as_str());
        }
        if let Some(ip) = &self.public_ip {
            vars.set("host.public_ip", ip.as_str());
        }
    }

    /// Variables for one component on this host: the component scope over
    /// the host view, plus built-ins under `host.*` and `component.*`.
    pub fn component_variables(&self, component: &Component) -> Variables {
        let mut vars = component.scope.variables.merged_over(&self.variables);
        self.set_builtins(&mut vars);
        vars.set("component.id", component.id.as_str());
        if let Some(identity) = &component.public_identity {
            vars.set("component.public_identity", identity.as_str());
        }
        if let Some(name) = component.rendered_config_name() {
            vars.set("component.config_name", name);
        }
        vars
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWarning {
    pub level: WarnLevel,
    pub message: String,
}

impl ModelWarning {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

/// Structural checks on a topology: valid ids, unique keys at each level,
/// and a few shapes that are legal but almost certainly mistakes.
pub fn validate_topology(regions: &[Region]) -> Vec<ModelWarning> {
    let mut warnings = Vec::new();
    let mut region_ids = HashSet::new();

    for region in regions {
        if paths::validate_id(&region.id).is_err() {
            warnings.push(ModelWarning::error(format!("invalid region id '{}'", region.id)));
        }
        if !region_ids.insert(region.id.as_str()) {
            warnings.push(ModelWarning::error(format!("duplicate region '{}'", region.id)));
        }
        if region.hosts.is_empty() {
            warnings.push(ModelWarning::warning(format!("region '{}' has no hosts", region.id)));
        }

        let mut host_ids = HashSet::new();
        for host in &region.hosts {
            let key = host_key(&region.id, &host.id);
            if paths::validate_id(&host.id).is_err() {
                warnings.push(ModelWarning::error(format!("invalid host id '{key}'")));
            }
            if !host_ids.insert(host.id.as_str()) {
                warnings.push(ModelWarning::error(format!("duplicate host '{key}'")));
            }

            let mut component_ids = HashSet::new();
            for component in &host.components {
                if paths::validate_id(&component.id).is_err() {
                    warnings.push(ModelWarning::error(format!(
                        "invalid component id '{}' on {key}",
                        component.id
                    )));
                }
                if !component_ids.insert(component.id.as_str()) {
                    warnings.push(ModelWarning::error(format!(
                        "duplicate component '{}' on {key}",
                        component.id
                    )));
                }
                for tag in &component.scope.tags {
                    if tag.starts_with('#') {
                        warnings.push(ModelWarning::warning(format!(
                            "tag '{tag}' on component '{}' starts with '#'; selectors add the '#' themselves",
                            component.id
                        )));
                    }
                }
                if component.config_name.is_some() && component.config_src.is_none() {
                    warnings.push(ModelWarning::warning(format!(
                        "component '{}' on {key} has config_name but no config_src",
                        component.id
                    )));
                }
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_config_name_strips_tmpl() {
        let c = Component::new("ctrl1");
        assert_eq!(c.rendered_config_name(), None);

        let mut c = Component::new("ctrl1");
        c.config_src = Some("ctrl.yml.tmpl".into());
        assert_eq!(c.rendered_config_name().as_deref(), Some("ctrl.yml"));

        let c = Component::new("ctrl1").config("ctrl.yml.tmpl", "ctrl1.yml");
        assert_eq!(c.rendered_config_name().as_deref(), Some("ctrl1.yml"));
    }

    #[test]
    fn host_view_public_ip_requires_provisioning() {
        let view = HostView {
            key: "us-east-1/ctrl1".into(),
            id: "ctrl1".into(),
            region: "us-east-1".into(),
            site: None,
            instance_type: None,
            public_ip: None,
            tags: vec![],
            variables: Variables::new(),
        };
        assert!(matches!(view.public_ip(), Err(LabError::NotProvisioned(k)) if k == "us-east-1/ctrl1"));
        assert_eq!(view.ssh_username(), "root");
    }

    #[test]
    fn component_variables_layer_component_over_host() {
        let mut host_vars = Variables::new();
        host_vars.set("port", 80);
        host_vars.set("env", "lab");
        let view = HostView {
            key: "r/h".into(),
            id: "h".into(),
            region: "r".into(),
            site: None,
            instance_type: None,
            public_ip: Some("10.0.0.1".into()),
            tags: vec![],
            variables: host_vars,
        };
        let component = Component::new("ctrl1").variable("port", 6262);
        let vars = view.component_variables(&component);
        assert_eq!(vars.get_str("port").as_deref(), Some("6262"));
        assert_eq!(vars.get_str("env").as_deref(), Some("lab"));
        assert_eq!(vars.get_str("host.public_ip").as_deref(), Some("10.0.0.1"));
        assert_eq!(vars.get_str("component.id").as_deref(), Some("ctrl1"));
    }

    #[test]
    fn validate_flags_duplicates_per_level() {
        let regions = vec![
            Region::new("us-east-1")
                .host(
                    Host::new("ctrl1")
                        .component(Component::new("consul"))
                        .component(Component::new("consul")),
                )
                .host(Host::new("ctrl1")),
            Region::new("us-east-1"),
        ];
        let warnings = validate_topology(&regions);
        let errors: Vec<_> = warnings
            .iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message.as_str())
            .collect();
        assert!(errors.contains(&"duplicate region 'us-east-1'"));
        assert!(errors.contains(&"duplicate host 'us-east-1/ctrl1'"));
        assert!(errors.contains(&"duplicate component 'consul' on us-east-1/ctrl1"));
    }

    #[test]
    fn same_host_id_in_two_regions_is_fine() {
        let regions = vec![
            Region::new("us-east-1").host(Host::new("consul")),
            Region::new("us-west-2").host(Host::new("consul")),
        ];
        assert!(validate_topology(&regions)
            .iter()
            .all(|w| w.level != WarnLevel::Error));
    }
}
