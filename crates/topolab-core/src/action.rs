//! Named actions run on demand, outside the phase pipeline.
//!
//! The registry stores binders, not actions. A binder builds its action from
//! the model as it is at activation time, so an action bound before
//! provisioning still sees the hosts' public IPs and any variables set by
//! bootstrap or earlier phases.

use crate::context::RunContext;
use crate::error::{LabError, Result};
use crate::model::Model;
use crate::selector::Selector;
use crate::stage::{fan_out, DEFAULT_CONCURRENCY};
use crate::template;
use crate::topology::{Component, HostView};
use crate::transport::{shell_quote, Transport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()>;
}

pub type ActionBinder = Arc<dyn Fn(&Model) -> Result<Box<dyn Action>> + Send + Sync>;

// ---------------------------------------------------------------------------
// ActionRegistry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct ActionRegistry {
    binders: Vec<(String, ActionBinder)>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `binder` under `name`. Rebinding a name replaces the binder
    /// but keeps the name's original position.
    pub fn bind<F>(&mut self, name: impl Into<String>, binder: F)
    where
        F: Fn(&Model) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        let name = name.into();
        let binder: ActionBinder = Arc::new(binder);
        match self.binders.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = binder,
            None => self.binders.push((name, binder)),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.binders.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.binders.iter().any(|(n, _)| n == name)
    }

    pub fn binder(&self, name: &str) -> Option<ActionBinder> {
        self.binders
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.clone())
    }

    /// Every name must be registered; the first unknown one is the error.
    pub fn check<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        match names.iter().find(|n| !self.contains(n.as_ref())) {
            Some(unknown) => Err(LabError::UnknownAction(unknown.as_ref().to_string())),
            None => Ok(()),
        }
    }
}

/// Run `names` in order against the live model. All names are checked
/// before the first action runs; the first failing action stops the rest.
pub async fn activate<S: AsRef<str>>(ctx: &mut RunContext, names: &[S]) -> Result<()> {
    ctx.model.actions().check(names)?;
    for name in names {
        run_action(ctx, name.as_ref()).await?;
    }
    Ok(())
}

async fn run_action(ctx: &mut RunContext, name: &str) -> Result<()> {
    let binder = ctx
        .model
        .actions()
        .binder(name)
        .ok_or_else(|| LabError::UnknownAction(name.to_string()))?;
    info!(action = name, "action starting");
    let action = binder(&ctx.model)?;
    match action.execute(ctx).await {
        Ok(()) => {
            info!(action = name, "action complete");
            Ok(())
        }
        Err(e) => {
            error!(action = name, error = %e, "action failed");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Component actions
// ---------------------------------------------------------------------------

type Target = (HostView, Component);

fn targets(model: &Model, selector: &Selector) -> Vec<(String, Target)> {
    model
        .select(selector)
        .into_iter()
        .filter(|s| s.component.binary.is_some())
        .map(|s| {
            let view = model.view(s.host);
            (view.key.clone(), (view, s.component.clone()))
        })
        .collect()
}

/// `pkill -f` pattern for a component. The first character is wrapped in a
/// bracket class so the pattern never matches the shell running pkill.
pub fn pkill_pattern(component: &Component) -> Option<String> {
    let binary = component.binary.as_deref()?;
    let mut pattern = match component.rendered_config_name() {
        Some(cfg) => format!("{binary} run cfg/{cfg}"),
        None => binary.to_string(),
    };
    if let Some(first) = pattern.chars().next() {
        pattern.replace_range(..first.len_utf8(), &format!("[{first}]"));
    }
    Some(pattern)
}

/// Start command for a component: its `start` override (with `${...}`
/// placeholders expanded), or a detached launch of the kitted binary.
pub fn start_command(host: &HostView, component: &Component) -> Result<Option<String>> {
    if let Some(start) = &component.start {
        let vars = host.component_variables(component);
        let scope = format!("{}/{}", host.key, component.id);
        return template::expand(start, &vars, &scope).map(Some);
    }
    let Some(binary) = component.binary.as_deref() else {
        return Ok(None);
    };
    let log = format!("../logs/{}.log", component.id);
    let run = match component.rendered_config_name() {
        Some(cfg) => format!("bin/{binary} run cfg/{}", shell_quote(&cfg)),
        None => format!("bin/{binary}"),
    };
    Ok(Some(format!(
        "mkdir -p logs && cd {root} && nohup {run} > {log} 2>&1 < /dev/null &",
        root = crate::paths::REMOTE_ROOT,
        log = shell_quote(&log),
    )))
}

async fn exec_checked(transport: &dyn Transport, host: &HostView, command: &str) -> Result<()> {
    let out = transport.exec(host, command).await?;
    if out.success() {
        Ok(())
    } else {
        Err(LabError::Transport {
            host: host.key.clone(),
            reason: format!("'{command}' exited with {}: {}", out.status, out.hint()),
        })
    }
}

/// Kill each matched component's process. A component that is not running
/// (pkill exit 1) counts as stopped.
pub struct StopComponents {
    targets: Vec<(String, Target)>,
    concurrency: usize,
}

impl StopComponents {
    pub fn bind(model: &Model, selector: &Selector, concurrency: usize) -> Self {
        Self {
            targets: targets(model, selector),
            concurrency,
        }
    }
}

#[async_trait]
impl Action for StopComponents {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let transport = ctx.transport.clone();
        fan_out("stop", self.targets.clone(), self.concurrency, |(host, component)| {
            let transport = transport.clone();
            async move {
                let Some(pattern) = pkill_pattern(&component) else {
                    return Ok(());
                };
                let command = format!("pkill -f {}", shell_quote(&pattern));
                let out = transport.exec(&host, &command).await?;
                match out.status {
                    0 | 1 => {
                        let killed = out.status == 0;
                        debug!(host = %host.key, component = %component.id, killed, "stopped");
                        Ok(())
                    }
                    status => Err(LabError::Transport {
                        host: host.key.clone(),
                        reason: format!("stopping {} exited with {status}: {}", component.id, out.hint()),
                    }),
                }
            }
        })
        .await
    }
}

pub struct StartComponents {
    targets: Vec<(String, Target)>,
    concurrency: usize,
}

impl StartComponents {
    pub fn bind(model: &Model, selector: &Selector, concurrency: usize) -> Self {
        Self {
            targets: targets(model, selector),
            concurrency,
        }
    }
}

#[async_trait]
impl Action for StartComponents {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        // Render every command first so a missing variable starts nothing.
        let mut items = Vec::new();
        for (key, (host, component)) in &self.targets {
            if let Some(command) = start_command(host, component)? {
                items.push((key.clone(), (host.clone(), component.id.clone(), command)));
            }
        }
        let transport = ctx.transport.clone();
        fan_out("start", items, self.concurrency, |(host, id, command)| {
            let transport = transport.clone();
            async move {
                exec_checked(transport.as_ref(), &host, &command).await?;
                debug!(host = %host.key, component = %id, "started");
                Ok(())
            }
        })
        .await
    }
}

/// Run a shell command once per matched component, `${...}` expanded in the
/// component's scope.
pub struct ExecCommand {
    items: Vec<(String, (HostView, String))>,
    concurrency: usize,
}

impl ExecCommand {
    pub fn bind(model: &Model, selector: &Selector, command: &str, concurrency: usize) -> Result<Self> {
        let mut items = Vec::new();
        for selected in model.select(selector) {
            let view = model.view(selected.host);
            let vars = view.component_variables(selected.component);
            let scope = format!("{}/{}", view.key, selected.component.id);
            let rendered = template::expand(command, &vars, &scope)?;
            items.push((view.key.clone(), (view, rendered)));
        }
        Ok(Self { items, concurrency })
    }
}

#[async_trait]
impl Action for ExecCommand {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let transport = ctx.transport.clone();
        fan_out("exec", self.items.clone(), self.concurrency, |(host, command)| {
            let transport = transport.clone();
            async move { exec_checked(transport.as_ref(), &host, &command).await }
        })
        .await
    }
}

/// Run other registered actions in order.
pub struct Sequence {
    pub actions: Vec<String>,
}

#[async_trait]
impl Action for Sequence {
    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        ctx.model.actions().check(&self.actions)?;
        for name in &self.actions {
            run_action(ctx, name).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ActionSpec
// ---------------------------------------------------------------------------

fn default_selector() -> String {
    "*".to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    Stop {
        #[serde(default = "default_selector")]
        selector: String,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    Start {
        #[serde(default = "default_selector")]
        selector: String,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    Exec {
        #[serde(default = "default_selector")]
        selector: String,
        command: String,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    Sequence {
        actions: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedAction {
    pub name: String,
    #[serde(flatten)]
    pub spec: ActionSpec,
}

impl ActionSpec {
    pub fn selector(&self) -> Option<&str> {
        match self {
            ActionSpec::Stop { selector, .. }
            | ActionSpec::Start { selector, .. }
            | ActionSpec::Exec { selector, .. } => Some(selector),
            ActionSpec::Sequence { .. } => None,
        }
    }

    /// Parse the selector now; the binder itself runs at activation.
    pub fn binder(&self) -> Result<ActionBinder> {
        let selector = self.selector().map(Selector::parse).transpose()?;
        let spec = self.clone();
        Ok(Arc::new(move |model: &Model| -> Result<Box<dyn Action>> {
            let sel = selector.clone().unwrap_or(Selector::All);
            Ok(match &spec {
                ActionSpec::Stop { concurrency, .. } => {
                    Box::new(StopComponents::bind(model, &sel, *concurrency))
                }
                ActionSpec::Start { concurrency, .. } => {
                    Box::new(StartComponents::bind(model, &sel, *concurrency))
                }
                ActionSpec::Exec {
                    command,
                    concurrency,
                    ..
                } => Box::new(ExecCommand::bind(model, &sel, command, *concurrency)?),
                ActionSpec::Sequence { actions } => Box::new(Sequence {
                    actions: actions.clone(),
                }),
            })
        }))
    }
}

impl ActionRegistry {
    pub fn bind_spec(&mut self, named: &NamedAction) -> Result<()> {
        let binder = named.spec.binder()?;
        self.bind(named.name.clone(), move |model: &Model| binder(model));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Host, Region};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn ha_model(registry: impl FnOnce(crate::model::ModelBuilder) -> crate::model::ModelBuilder) -> Model {
        let ctrl = |id: &str, ip: &str| {
            Host::new(id)
                .public_ip(ip)
                .component(
                    Component::new(id)
                        .binary("ziti controller")
                        .config("ctrl.yml.tmpl", format!("{id}.yml"))
                        .tags(["ctrl"]),
                )
                .component(Component::new("consul").binary("consul"))
        };
        let builder = Model::builder("ha")
            .variable("credentials.edge.username", "admin")
            .region(
                Region::new("us-east-1")
                    .host(ctrl("ctrl1", "10.0.0.1"))
                    .host(ctrl("ctrl2", "10.0.0.2")),
            )
            .region(Region::new("us-west-2").host(ctrl("ctrl3", "10.0.1.3")));
        registry(builder).build().unwrap()
    }

    struct Record {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Action for Record {
        async fn execute(&self, _ctx: &mut RunContext) -> Result<()> {
            self.log.lock().unwrap().push(self.label.to_string());
            if self.fail {
                Err(LabError::Provision(format!("{} failed", self.label)))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(
        label: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> impl Fn(&Model) -> Result<Box<dyn Action>> + Send + Sync + 'static {
        let log = log.clone();
        move |_: &Model| -> Result<Box<dyn Action>> {
            Ok(Box::new(Record {
                label,
                log: log.clone(),
                fail,
            }))
        }
    }

    #[tokio::test]
    async fn activation_runs_in_caller_order() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = ha_model(|b| {
            b.action("stop", recorder("stop", &log, false))
                .action("bootstrap", recorder("bootstrap", &log, false))
                .action("start", recorder("start", &log, false))
        });
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        activate(&mut ctx, &["stop", "bootstrap", "start"]).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["stop", "bootstrap", "start"]);
    }

    #[tokio::test]
    async fn unknown_name_fails_before_anything_runs() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = ha_model(|b| b.action("stop", recorder("stop", &log, false)));
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        let err = activate(&mut ctx, &["stop", "login"]).await.unwrap_err();
        assert!(matches!(err, LabError::UnknownAction(n) if n == "login"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_stops_later_actions() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let model = ha_model(|b| {
            b.action("a", recorder("a", &log, true))
                .action("b", recorder("b", &log, false))
        });
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        assert!(activate(&mut ctx, &["a", "b"]).await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn rebinding_keeps_position() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ActionRegistry::new();
        reg.bind("stop", recorder("stop", &log, false));
        reg.bind("start", recorder("start", &log, false));
        reg.bind("stop", recorder("stop2", &log, false));
        assert_eq!(reg.names(), vec!["stop", "start"]);
    }

    #[tokio::test]
    async fn binder_sees_model_at_activation_time() {
        let dir = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let model = ha_model(move |b| {
            b.action("peek", move |m: &Model| -> Result<Box<dyn Action>> {
                *seen_in.lock().unwrap() = m.variables().get_str("ziti_version");
                Ok(Box::new(Sequence { actions: vec![] }))
            })
        });
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        ctx.model.variables_mut().set("ziti_version", "0.30.0");
        activate(&mut ctx, &["peek"]).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_deref(), Some("0.30.0"));
    }

    #[test]
    fn pkill_pattern_brackets_first_char() {
        let c = Component::new("ctrl1")
            .binary("ziti controller")
            .config("ctrl.yml.tmpl", "ctrl1.yml");
        assert_eq!(
            pkill_pattern(&c).as_deref(),
            Some("[z]iti controller run cfg/ctrl1.yml")
        );
        assert_eq!(pkill_pattern(&Component::new("consul").binary("consul")).as_deref(), Some("[c]onsul"));
        assert_eq!(pkill_pattern(&Component::new("bare")), None);
    }

    #[tokio::test]
    async fn exec_and_sequence_over_local_transport() {
        let dir = TempDir::new().unwrap();
        let model = ha_model(|b| b);
        let mut reg = ActionRegistry::new();
        for yaml in [
            "name: prep\ntype: exec\ncommand: mkdir -p logs\n",
            "name: mark\ntype: exec\nselector: \"#ctrl\"\ncommand: echo ${component.id} ${credentials.edge.username} > marker\n",
            "name: cycle\ntype: sequence\nactions: [prep, mark]\n",
        ] {
            let named: NamedAction = serde_yaml::from_str(yaml).unwrap();
            reg.bind_spec(&named).unwrap();
        }
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        *ctx.model.actions_mut() = reg;

        activate(&mut ctx, &["cycle"]).await.unwrap();
        let marker = std::fs::read_to_string(dir.path().join("hosts/us-west-2/ctrl3/marker")).unwrap();
        assert_eq!(marker.trim(), "ctrl3 admin");
        assert!(dir.path().join("hosts/us-east-1/ctrl1/logs").is_dir());
    }

    #[tokio::test]
    async fn exec_failure_names_host() {
        let dir = TempDir::new().unwrap();
        let model = ha_model(|b| b);
        let mut ctx = RunContext::new(model, dir.path()).unwrap();
        let action = ExecCommand::bind(&ctx.model, &Selector::parse("ctrl2").unwrap(), "exit 4", 1).unwrap();
        let err = action.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(err, LabError::Transport { host, .. } if host == "us-east-1/ctrl2"));
    }

    #[test]
    fn start_command_defaults_and_overrides() {
        let model = ha_model(|b| b);
        let view = model.host_view("us-east-1/ctrl1").unwrap();
        let ctrl = &model.host("us-east-1/ctrl1").unwrap().host.components[0];
        let cmd = start_command(&view, ctrl).unwrap().unwrap();
        assert!(cmd.contains("nohup bin/ziti controller run cfg/ctrl1.yml"));

        let custom = Component::new("echo").start("./echo --addr ${host.public_ip}");
        assert_eq!(
            start_command(&view, &custom).unwrap().as_deref(),
            Some("./echo --addr 10.0.0.1")
        );
        assert_eq!(start_command(&view, &Component::new("bare")).unwrap(), None);
    }

    #[test]
    fn bad_selector_fails_at_bind() {
        let named: NamedAction = serde_yaml::from_str("name: login\ntype: exec\nselector: \"\"\ncommand: x\n").unwrap();
        assert!(matches!(named.spec.binder(), Err(LabError::InvalidSelector(_))));
    }
}
