use super::{ExecOutput, Transport};
use crate::error::{LabError, Result};
use crate::io;
use crate::topology::HostView;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::process::Command;

/// Maps each host to `<root>/<region>/<host>/` on the local filesystem.
/// Commands run through `sh -c` with that directory as the working
/// directory and `TOPOLAB_HOST` set to the host key.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn host_root(&self, host: &HostView) -> PathBuf {
        self.root.join(&host.key)
    }

    /// Resolve a remote path inside the host directory. Absolute paths are
    /// re-rooted; `..` is refused so one host cannot write into another.
    pub fn resolve(&self, host: &HostView, path: &str) -> Result<PathBuf> {
        let mut out = self.host_root(host);
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(LabError::Transport {
                        host: host.key.clone(),
                        reason: format!("path '{path}' escapes the host directory"),
                    })
                }
            }
        }
        Ok(out)
    }
}

fn blocking_err(host: &HostView, e: tokio::task::JoinError) -> LabError {
    LabError::Transport {
        host: host.key.clone(),
        reason: format!("file task failed: {e}"),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn probe(&self, host: &HostView) -> Result<()> {
        tokio::fs::create_dir_all(self.host_root(host)).await?;
        Ok(())
    }

    async fn mkdir(&self, host: &HostView, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(host, path)?).await?;
        Ok(())
    }

    async fn put(&self, host: &HostView, dest: &str, data: &[u8], mode: u32) -> Result<()> {
        let target = self.resolve(host, dest)?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || io::write_with_mode(&target, &data, mode))
            .await
            .map_err(|e| blocking_err(host, e))?
    }

    async fn sync_dir(&self, host: &HostView, local: &Path, remote: &str) -> Result<()> {
        let target = self.resolve(host, remote)?;
        let source = local.to_path_buf();
        tokio::task::spawn_blocking(move || io::mirror_dir(&source, &target))
            .await
            .map_err(|e| blocking_err(host, e))??;
        Ok(())
    }

    async fn exec(&self, host: &HostView, command: &str) -> Result<ExecOutput> {
        let cwd = self.host_root(host);
        tokio::fs::create_dir_all(&cwd).await?;
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env("TOPOLAB_HOST", &host.key)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LabError::Transport {
                host: host.key.clone(),
                reason: format!("failed to spawn sh: {e}"),
            })?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
