//! Bootstrap extensions: initializers that run once, in registration order,
//! before any phase or action. They pull credentials and settings into the
//! model (from the environment, a bindings file) and make sure local
//! prerequisites such as the lab SSH key exist. A failure here stops the run
//! before any host is touched.

use crate::context::RunContext;
use crate::error::{LabError, Result};
use crate::io;
use crate::paths;
use crate::variables::Variables;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[async_trait]
pub trait BootstrapExtension: Send + Sync {
    fn name(&self) -> &str;

    /// Must be safe to run again on a lab that was already bootstrapped.
    async fn bootstrap(&self, ctx: &mut RunContext) -> Result<()>;
}

/// Run `extensions` in order, stopping at the first failure.
pub async fn run_chain(extensions: &[Box<dyn BootstrapExtension>], ctx: &mut RunContext) -> Result<()> {
    for ext in extensions {
        debug!(extension = ext.name(), "bootstrapping");
        ext.bootstrap(ctx).await.map_err(|e| match e {
            e @ (LabError::Bootstrap { .. } | LabError::MissingEnv(_) | LabError::ToolMissing(_)) => e,
            other => LabError::Bootstrap {
                extension: ext.name().to_string(),
                reason: other.to_string(),
            },
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EnvBindings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvBinding {
    /// Environment variable name.
    pub var: String,
    /// Model variable path to set.
    pub path: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Copy environment values into model variables. Every binding is resolved
/// before any variable is written, so a missing required value leaves the
/// model unchanged.
#[derive(Debug, Clone)]
pub struct EnvBindings {
    pub bindings: Vec<EnvBinding>,
}

#[async_trait]
impl BootstrapExtension for EnvBindings {
    fn name(&self) -> &str {
        "env"
    }

    async fn bootstrap(&self, ctx: &mut RunContext) -> Result<()> {
        let mut resolved = Vec::new();
        for binding in &self.bindings {
            match ctx.env.var(&binding.var).or_else(|| binding.default.clone()) {
                Some(value) => resolved.push((binding.path.as_str(), value)),
                None if binding.required => return Err(LabError::MissingEnv(binding.var.clone())),
                None => debug!(var = %binding.var, "optional binding not set"),
            }
        }
        for (path, value) in resolved {
            ctx.model.variables_mut().set(path, value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BindingsFile
// ---------------------------------------------------------------------------

/// Merge a YAML mapping of variables over the model defaults. Relative paths
/// resolve against the lab directory; the default is `<lab>/bindings.yaml`.
#[derive(Debug, Clone, Default)]
pub struct BindingsFile {
    pub path: Option<PathBuf>,
}

impl BindingsFile {
    fn resolve(&self, ctx: &RunContext) -> PathBuf {
        match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => ctx.lab_dir.join(p),
            None => paths::bindings_path(&ctx.lab_dir),
        }
    }
}

#[async_trait]
impl BootstrapExtension for BindingsFile {
    fn name(&self) -> &str {
        "bindings_file"
    }

    async fn bootstrap(&self, ctx: &mut RunContext) -> Result<()> {
        let path = self.resolve(ctx);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LabError::Bootstrap {
                    extension: self.name().to_string(),
                    reason: format!("{} not found", path.display()),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let bindings: Variables = serde_yaml::from_str(&data)?;
        ctx.model.variables_mut().extend(&bindings);
        info!(path = %path.display(), "loaded bindings");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fallbacks
// ---------------------------------------------------------------------------

/// Try each extension in turn; the first that succeeds wins.
pub struct Fallbacks {
    pub chain: Vec<Box<dyn BootstrapExtension>>,
}

#[async_trait]
impl BootstrapExtension for Fallbacks {
    fn name(&self) -> &str {
        "fallbacks"
    }

    async fn bootstrap(&self, ctx: &mut RunContext) -> Result<()> {
        let mut reasons = Vec::new();
        for ext in &self.chain {
            match ext.bootstrap(ctx).await {
                Ok(()) => {
                    debug!(extension = ext.name(), "fallback succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(extension = ext.name(), error = %e, "fallback failed, trying next");
                    reasons.push(format!("{}: {e}", ext.name()));
                }
            }
        }
        Err(LabError::Bootstrap {
            extension: self.name().to_string(),
            reason: if reasons.is_empty() {
                "no extensions configured".to_string()
            } else {
                reasons.join("; ")
            },
        })
    }
}

// ---------------------------------------------------------------------------
// SshKeyManager
// ---------------------------------------------------------------------------

/// Generate (with `ssh-keygen`) or reuse an ed25519 keypair under
/// `<lab>/keys/<name>`, then point `credentials.ssh.key_path` at it.
#[derive(Debug, Clone)]
pub struct SshKeyManager {
    pub name: String,
}

impl Default for SshKeyManager {
    fn default() -> Self {
        Self {
            name: paths::DEFAULT_KEY_NAME.to_string(),
        }
    }
}

#[async_trait]
impl BootstrapExtension for SshKeyManager {
    fn name(&self) -> &str {
        "ssh_key"
    }

    async fn bootstrap(&self, ctx: &mut RunContext) -> Result<()> {
        paths::validate_id(&self.name)?;
        let private = paths::private_key_path(&ctx.lab_dir, &self.name);
        let public = paths::public_key_path(&ctx.lab_dir, &self.name);

        if private.exists() && public.exists() {
            debug!(key = %private.display(), "reusing ssh key");
        } else {
            let keygen = which::which("ssh-keygen")
                .map_err(|_| LabError::ToolMissing("ssh-keygen".into()))?;
            io::ensure_dir(&paths::keys_dir(&ctx.lab_dir))?;
            io::remove_if_exists(&private)?;
            io::remove_if_exists(&public)?;

            let output = Command::new(keygen)
                .args(["-q", "-t", "ed25519", "-N", ""])
                .arg("-C")
                .arg(format!("topolab-{}", ctx.model.id()))
                .arg("-f")
                .arg(&private)
                .kill_on_drop(true)
                .output()
                .await?;
            if !output.status.success() {
                return Err(LabError::Bootstrap {
                    extension: self.name().to_string(),
                    reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            info!(key = %private.display(), "generated ssh key");
        }

        ctx.model
            .variables_mut()
            .set("credentials.ssh.key_path", private.display().to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BootstrapSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BootstrapSpec {
    Env {
        bindings: Vec<EnvBinding>,
    },
    BindingsFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Fallbacks {
        chain: Vec<BootstrapSpec>,
    },
    SshKey {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl BootstrapSpec {
    pub fn build(&self) -> Box<dyn BootstrapExtension> {
        match self {
            BootstrapSpec::Env { bindings } => Box::new(EnvBindings {
                bindings: bindings.clone(),
            }),
            BootstrapSpec::BindingsFile { path } => Box::new(BindingsFile { path: path.clone() }),
            BootstrapSpec::Fallbacks { chain } => Box::new(Fallbacks {
                chain: chain.iter().map(BootstrapSpec::build).collect(),
            }),
            BootstrapSpec::SshKey { name } => Box::new(match name {
                Some(name) => SshKeyManager { name: name.clone() },
                None => SshKeyManager::default(),
            }),
        }
    }

    /// Key name used by an `ssh_key` extension anywhere in this spec.
    pub fn ssh_key_name(&self) -> Option<String> {
        match self {
            BootstrapSpec::SshKey { name } => Some(
                name.clone()
                    .unwrap_or_else(|| paths::DEFAULT_KEY_NAME.to_string()),
            ),
            BootstrapSpec::Fallbacks { chain } => chain.iter().find_map(BootstrapSpec::ssh_key_name),
            _ => None,
        }
    }
}
