//! Infrastructure providers.
//!
//! A provisioner turns the model's hosts into reachable machines and reports
//! each host's public IP, keyed by host key. The engine never talks to a
//! cloud API itself.

use crate::error::{LabError, Result};
use crate::model::Model;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    /// Bring hosts up and return `host key → public IP`.
    async fn provision(&self, model: &Model) -> Result<BTreeMap<String, String>>;

    /// Tear down whatever `provision` created. Must tolerate hosts that were
    /// never created.
    async fn dispose(&self, model: &Model) -> Result<()>;
}

// ---------------------------------------------------------------------------
// StaticProvisioner
// ---------------------------------------------------------------------------

/// Pre-provisioned labs: every host declares its `public_ip` in the model.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProvisioner;

#[async_trait]
impl Provisioner for StaticProvisioner {
    fn name(&self) -> &str {
        "static"
    }

    async fn provision(&self, model: &Model) -> Result<BTreeMap<String, String>> {
        let mut ips = BTreeMap::new();
        let mut missing = Vec::new();
        for host in model.hosts() {
            match &host.host.public_ip {
                Some(ip) => {
                    ips.insert(host.key(), ip.clone());
                }
                None => missing.push(host.key()),
            }
        }
        if !missing.is_empty() {
            return Err(LabError::Provision(format!(
                "static provisioner needs a public_ip on every host; missing: {}",
                missing.join(", ")
            )));
        }
        Ok(ips)
    }

    async fn dispose(&self, _model: &Model) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExecProvisioner
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HostRequest<'a> {
    key: String,
    region: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    site: Option<&'a str>,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_type: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    model: &'a str,
    hosts: Vec<HostRequest<'a>>,
}

fn request_json(model: &Model) -> Result<String> {
    let hosts = model
        .hosts()
        .map(|h| HostRequest {
            key: h.key(),
            region: &h.region.id,
            site: h.region.site.as_deref(),
            id: &h.host.id,
            instance_type: h.host.instance_type.as_deref(),
        })
        .collect();
    Ok(serde_json::to_string(&ProvisionRequest {
        model: model.id(),
        hosts,
    })?)
}

/// Delegates to external commands (a terraform wrapper, a cloud CLI
/// script). `apply` receives the topology as JSON on stdin and must print a
/// JSON object `{"<region>/<host>": "<ip>", ...}` on stdout. `destroy`
/// receives the same JSON. Stderr passes through to the terminal.
#[derive(Debug, Clone)]
pub struct ExecProvisioner {
    apply: String,
    destroy: Option<String>,
    workdir: PathBuf,
}

impl ExecProvisioner {
    pub fn new(apply: impl Into<String>, destroy: Option<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            apply: apply.into(),
            destroy,
            workdir: workdir.into(),
        }
    }

    async fn run(&self, command: &str, model: &Model) -> Result<String> {
        let input = request_json(model)?;
        debug!(command, workdir = %self.workdir.display(), "running provisioner command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env("TOPOLAB_MODEL_ID", model.id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LabError::Provision(format!("failed to spawn '{command}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Commands that ignore stdin may exit before reading it.
            match stdin.write_all(input.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(LabError::Provision(format!("failed to write stdin: {e}")));
                }
                _ => {}
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| LabError::Provision(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let hint = stdout.chars().take(500).collect::<String>();
            return Err(LabError::Provision(format!(
                "'{command}' exited with {}: {hint}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(stdout)
    }
}

#[async_trait]
impl Provisioner for ExecProvisioner {
    fn name(&self) -> &str {
        "exec"
    }

    async fn provision(&self, model: &Model) -> Result<BTreeMap<String, String>> {
        let stdout = self.run(&self.apply, model).await?;
        let ips: BTreeMap<String, String> = serde_json::from_str(stdout.trim()).map_err(|e| {
            LabError::Provision(format!("apply output is not a JSON host map: {e}"))
        })?;
        info!(hosts = ips.len(), "provisioner reported hosts");
        Ok(ips)
    }

    async fn dispose(&self, model: &Model) -> Result<()> {
        match &self.destroy {
            Some(command) => self.run(command, model).await.map(|_| ()),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// ProvisionerSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProvisionerSpec {
    #[default]
    Static,
    Exec {
        apply: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destroy: Option<String>,
    },
}

impl ProvisionerSpec {
    /// `base_dir` is the directory holding the model file; exec commands run
    /// there.
    pub fn build(&self, base_dir: &Path) -> Arc<dyn Provisioner> {
        match self {
            ProvisionerSpec::Static => Arc::new(StaticProvisioner),
            ProvisionerSpec::Exec { apply, destroy } => Arc::new(ExecProvisioner::new(
                apply.clone(),
                destroy.clone(),
                base_dir,
            )),
        }
    }
}
