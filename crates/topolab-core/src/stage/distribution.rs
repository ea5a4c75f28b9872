use super::{fan_out, Stage};
use crate::context::RunContext;
use crate::error::{LabError, Result};
use crate::io;
use crate::paths;
use crate::resolver::{Replacements, Resolver};
use crate::selector::Selector;
use crate::topology::HostView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_CONCURRENCY: usize = 10;

// ---------------------------------------------------------------------------
// DistributeSshKey
// ---------------------------------------------------------------------------

/// Copy the lab keypair (from `credentials.ssh.key_path`) into `~/.ssh` on
/// every selected host so hosts can reach each other.
#[derive(Debug, Clone)]
pub struct DistributeSshKey {
    pub selector: Selector,
}

impl DistributeSshKey {
    pub fn new(selector: Selector) -> Self {
        Self { selector }
    }
}

#[async_trait]
impl Stage for DistributeSshKey {
    fn name(&self) -> &str {
        "distribute_ssh_key"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let key_path = ctx
            .model
            .variables()
            .must_str("credentials.ssh.key_path", "model")?;
        let private = Path::new(&key_path);
        let file_name = private
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| LabError::InvalidModel(format!("bad ssh key path '{key_path}'")))?
            .to_string();
        let private_key = Arc::new(std::fs::read(private)?);
        let public_key = Arc::new(std::fs::read(format!("{key_path}.pub"))?);

        let items = keyed(ctx.model.selected_views(&self.selector));
        let transport = ctx.transport.clone();
        fan_out(self.name(), items, DEFAULT_CONCURRENCY, |host| {
            let transport = transport.clone();
            let private_key = private_key.clone();
            let public_key = public_key.clone();
            let dest = format!(".ssh/{file_name}");
            async move {
                transport.put(&host, &dest, &private_key, 0o600).await?;
                transport
                    .put(&host, &format!("{dest}.pub"), &public_key, 0o644)
                    .await
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Create directories (relative to the login home) on every selected host.
#[derive(Debug, Clone)]
pub struct Locations {
    pub selector: Selector,
    pub paths: Vec<String>,
}

impl Locations {
    pub fn new<I, S>(selector: Selector, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selector,
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Stage for Locations {
    fn name(&self) -> &str {
        "locations"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let items = keyed(ctx.model.selected_views(&self.selector));
        let transport = ctx.transport.clone();
        let dirs = Arc::new(self.paths.clone());
        fan_out(self.name(), items, DEFAULT_CONCURRENCY, |host| {
            let transport = transport.clone();
            let dirs = dirs.clone();
            async move {
                for dir in dirs.iter() {
                    transport.mkdir(&host, dir).await?;
                }
                Ok(())
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// DistributeData
// ---------------------------------------------------------------------------

/// Where a distributed payload comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// A file in the config resource bundle.
    Resource(String),
    /// A process environment variable; it must be set.
    Env(String),
    Inline(String),
}

impl DataSource {
    fn check(&self, ctx: &RunContext) -> Result<()> {
        match self {
            DataSource::Resource(path) => ctx.resources.read_file(path).map(|_| ()),
            DataSource::Env(name) => ctx
                .env
                .var(name)
                .map(|_| ())
                .ok_or_else(|| LabError::MissingEnv(name.clone())),
            DataSource::Inline(_) => Ok(()),
        }
    }

    fn load(&self, ctx: &RunContext) -> Result<Vec<u8>> {
        match self {
            DataSource::Resource(path) => ctx.resources.read_file(path),
            DataSource::Env(name) => ctx
                .env
                .var(name)
                .map(String::into_bytes)
                .ok_or_else(|| LabError::MissingEnv(name.clone())),
            DataSource::Inline(text) => Ok(text.clone().into_bytes()),
        }
    }

    fn describe(&self) -> String {
        match self {
            DataSource::Resource(path) => format!("resource {path}"),
            DataSource::Env(name) => format!("env {name}"),
            DataSource::Inline(_) => "inline data".to_string(),
        }
    }
}

/// Write one payload to `dest` on every selected host, with per-host token
/// substitution.
///
/// All hosts are rendered before any is written, so a resolver failure
/// (a missing variable, an unset environment value) leaves every host
/// untouched. When two stages target the same path on a host, the later
/// stage wins.
pub struct DistributeData {
    pub selector: Selector,
    pub source: DataSource,
    pub dest: String,
    pub mode: u32,
    pub replacements: Replacements,
    /// Environment variables checked during preflight.
    pub required_env: Vec<String>,
    /// Variable paths every selected host must resolve, checked during
    /// preflight.
    pub required_variables: Vec<String>,
    pub concurrency: usize,
}

impl DistributeData {
    pub fn new(selector: Selector, source: DataSource, dest: impl Into<String>) -> Self {
        Self {
            selector,
            source,
            dest: dest.into(),
            mode: 0o644,
            replacements: Replacements::new(),
            required_env: Vec::new(),
            required_variables: Vec::new(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn replace(mut self, token: impl Into<String>, resolver: impl Resolver + 'static) -> Self {
        self.replacements = self.replacements.with(token, resolver);
        self
    }

    pub fn replacements(mut self, replacements: Replacements) -> Self {
        self.replacements = replacements;
        self
    }

    pub fn require_env(mut self, name: impl Into<String>) -> Self {
        self.required_env.push(name.into());
        self
    }

    pub fn require_variable(mut self, path: impl Into<String>) -> Self {
        self.required_variables.push(path.into());
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Per-host payloads in selection order.
    fn render_all(&self, ctx: &RunContext) -> Result<Vec<(String, (HostView, Vec<u8>))>> {
        let raw = self.source.load(ctx)?;
        let views = ctx.model.selected_views(&self.selector);
        if self.replacements.is_empty() {
            return Ok(views
                .into_iter()
                .map(|v| (v.key.clone(), (v, raw.clone())))
                .collect());
        }
        let template = String::from_utf8(raw).map_err(|_| {
            LabError::InvalidModel(format!(
                "{} is not UTF-8 and cannot take replacements",
                self.source.describe()
            ))
        })?;
        views
            .into_iter()
            .map(|view| {
                let rendered = self.replacements.render(&template, &view)?;
                Ok((view.key.clone(), (view, rendered.into_bytes())))
            })
            .collect()
    }
}

#[async_trait]
impl Stage for DistributeData {
    fn name(&self) -> &str {
        "distribute_data"
    }

    fn preflight(&self, ctx: &RunContext) -> Result<()> {
        self.source.check(ctx)?;
        for name in &self.required_env {
            if ctx.env.var(name).is_none() {
                return Err(LabError::MissingEnv(name.clone()));
            }
        }
        if self.required_variables.is_empty() {
            return Ok(());
        }
        for view in ctx.model.selected_views(&self.selector) {
            for path in &self.required_variables {
                if view.var(path).is_none() {
                    view.must_str(path)?;
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let items = self.render_all(ctx)?;
        info!(dest = %self.dest, hosts = items.len(), "distributing data");

        let transport = ctx.transport.clone();
        let dest = Arc::new(self.dest.clone());
        let mode = self.mode;
        fan_out(self.name(), items, self.concurrency, |(host, data)| {
            let transport = transport.clone();
            let dest = dest.clone();
            async move {
                transport.put(&host, &dest, &data, mode).await?;
                debug!(host = %host.key, dest = %dest, bytes = data.len(), "delivered");
                Ok(())
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// SyncStaged
// ---------------------------------------------------------------------------

/// Push the staged tree for each host (the shared kit plus that host's
/// rendered configs) to `~/topolab` on the host.
#[derive(Debug, Clone)]
pub struct SyncStaged {
    pub concurrency: usize,
}

impl Default for SyncStaged {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[async_trait]
impl Stage for SyncStaged {
    fn name(&self) -> &str {
        "sync_staged"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let kit = ctx.kit_dir();
        let mut items = Vec::new();
        for view in ctx.model.host_views() {
            let staged = ctx.host_build_dir(&view.key);
            io::ensure_dir(&staged)?;
            if kit.is_dir() {
                io::copy_dir(&kit, &staged)?;
            }
            items.push((view.key.clone(), (view, staged)));
        }

        let transport = ctx.transport.clone();
        fan_out(self.name(), items, self.concurrency, |(host, staged)| {
            let transport = transport.clone();
            async move {
                transport
                    .sync_dir(&host, &staged, paths::REMOTE_ROOT)
                    .await
            }
        })
        .await
    }
}

fn keyed(views: Vec<HostView>) -> Vec<(String, HostView)> {
    views.into_iter().map(|v| (v.key.clone(), v)).collect()
}
