//! How bytes and commands reach a host.
//!
//! Stages never talk to hosts directly; they go through a [`Transport`],
//! which receives an owned [`HostView`] per call so fan-out tasks can run it
//! concurrently without sharing mutable state.

mod local;
mod ssh;

pub use local::LocalTransport;
pub use ssh::{shell_quote, SshTransport};

use crate::error::Result;
use crate::topology::HostView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// First few hundred characters of stderr (or stdout when stderr is
    /// empty), for error messages.
    pub fn hint(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        source.trim().chars().take(500).collect()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Succeeds once the host accepts commands.
    async fn probe(&self, host: &HostView) -> Result<()>;

    async fn mkdir(&self, host: &HostView, path: &str) -> Result<()>;

    /// Write `data` to `dest` (relative to the login home), creating parent
    /// directories, then apply `mode`.
    async fn put(&self, host: &HostView, dest: &str, data: &[u8], mode: u32) -> Result<()>;

    /// Mirror the contents of local directory `local` into `remote`.
    async fn sync_dir(&self, host: &HostView, local: &Path, remote: &str) -> Result<()>;

    /// Run a shell command. A non-zero exit is reported in [`ExecOutput`],
    /// not as an error; failing to run the command at all is an error.
    async fn exec(&self, host: &HostView, command: &str) -> Result<ExecOutput>;
}

// ---------------------------------------------------------------------------
// TransportSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSpec {
    /// Every host is a directory under `root` (default `<lab>/hosts`).
    Local {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    Ssh {
        /// Extra `-o` options passed to ssh and rsync.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TransportSpec {
    fn default() -> Self {
        TransportSpec::Ssh {
            options: Vec::new(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TransportSpec {
    pub fn build(&self, lab_dir: &Path) -> Result<Arc<dyn Transport>> {
        match self {
            TransportSpec::Local { root } => {
                let root = match root {
                    Some(r) if r.is_absolute() => r.clone(),
                    Some(r) => lab_dir.join(r),
                    None => lab_dir.join("hosts"),
                };
                Ok(Arc::new(LocalTransport::new(root)))
            }
            TransportSpec::Ssh {
                options,
                connect_timeout_secs,
            } => Ok(Arc::new(SshTransport::new(
                options.clone(),
                *connect_timeout_secs,
            )?)),
        }
    }
}
