use super::{ExecOutput, Transport};
use crate::error::{LabError, Result};
use crate::topology::HostView;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Shells out to the system `ssh` and `rsync`. The login user and key come
/// from `credentials.ssh.username` / `credentials.ssh.key_path` in the
/// host's scope.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    options: Vec<String>,
    connect_timeout_secs: u64,
}

impl SshTransport {
    pub fn new(options: Vec<String>, connect_timeout_secs: u64) -> Result<Self> {
        let ssh = which::which("ssh").map_err(|_| LabError::ToolMissing("ssh".into()))?;
        Ok(Self {
            ssh,
            options,
            connect_timeout_secs,
        })
    }

    fn base_args(&self, host: &HostView) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        for opt in &self.options {
            args.push("-o".to_string());
            args.push(opt.clone());
        }
        if let Some(key) = host.ssh_key_path() {
            args.push("-i".to_string());
            args.push(key);
        }
        args
    }

    fn destination(host: &HostView) -> Result<String> {
        Ok(format!("{}@{}", host.ssh_username(), host.public_ip()?))
    }

    async fn run(&self, host: &HostView, command: &str, stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(self.base_args(host))
            .arg(Self::destination(host)?)
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        debug!(host = %host.key, command, "ssh exec");

        let spawn_err = |e: std::io::Error| LabError::Transport {
            host: host.key.clone(),
            reason: format!("failed to run ssh: {e}"),
        };
        let mut child = cmd.spawn().map_err(spawn_err)?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await.map_err(spawn_err)?;
            // Dropping the handle closes stdin so the remote `cat` sees EOF.
            drop(pipe);
        }
        let output = child.wait_with_output().await.map_err(spawn_err)?;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_checked(&self, host: &HostView, command: &str, stdin: Option<&[u8]>) -> Result<()> {
        let out = self.run(host, command, stdin).await?;
        if out.success() {
            Ok(())
        } else {
            Err(LabError::Transport {
                host: host.key.clone(),
                reason: format!("'{command}' exited with {}: {}", out.status, out.hint()),
            })
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn parent_dir(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
}

#[async_trait]
impl Transport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn probe(&self, host: &HostView) -> Result<()> {
        self.run_checked(host, "true", None).await
    }

    async fn mkdir(&self, host: &HostView, path: &str) -> Result<()> {
        self.run_checked(host, &format!("mkdir -p {}", shell_quote(path)), None)
            .await
    }

    async fn put(&self, host: &HostView, dest: &str, data: &[u8], mode: u32) -> Result<()> {
        let quoted = shell_quote(dest);
        let mut command = String::new();
        if let Some(dir) = parent_dir(dest) {
            command.push_str(&format!("mkdir -p {} && ", shell_quote(dir)));
        }
        command.push_str(&format!("cat > {quoted} && chmod {mode:o} {quoted}"));
        self.run_checked(host, &command, Some(data)).await
    }

    async fn sync_dir(&self, host: &HostView, local: &Path, remote: &str) -> Result<()> {
        let rsync = which::which("rsync").map_err(|_| LabError::ToolMissing("rsync".into()))?;
        self.mkdir(host, remote).await?;

        let mut rsh = vec![self.ssh.display().to_string()];
        rsh.extend(self.base_args(host).iter().map(|a| shell_quote(a)));
        let source = format!("{}/", local.display());
        let target = format!("{}:{}/", Self::destination(host)?, remote);
        debug!(host = %host.key, source, target, "rsync");

        let output = Command::new(rsync)
            .arg("-a")
            .arg("--delete")
            .arg("-e")
            .arg(rsh.join(" "))
            .arg(&source)
            .arg(&target)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LabError::Transport {
                host: host.key.clone(),
                reason: format!("failed to run rsync: {e}"),
            })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(LabError::Transport {
                host: host.key.clone(),
                reason: format!(
                    "rsync to {target} failed: {}",
                    stderr.trim().chars().take(500).collect::<String>()
                ),
            })
        }
    }

    async fn exec(&self, host: &HostView, command: &str) -> Result<ExecOutput> {
        self.run(host, command, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::Variables;

    #[test]
    fn quote_leaves_safe_words_alone() {
        assert_eq!(shell_quote("fablab/bin/ziti"), "fablab/bin/ziti");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn parent_dir_of_bare_file_is_none() {
        assert_eq!(parent_dir("metricbeat.yml"), None);
        assert_eq!(parent_dir("/etc/consul.d/consul.hcl"), Some("/etc/consul.d"));
    }

    #[test]
    fn args_carry_user_and_key() {
        let mut vars = Variables::new();
        vars.set("credentials.ssh.username", "ubuntu");
        vars.set("credentials.ssh.key_path", "/lab/keys/id");
        let host = HostView {
            key: "r/h".into(),
            id: "h".into(),
            region: "r".into(),
            site: None,
            instance_type: None,
            public_ip: Some("10.1.2.3".into()),
            tags: vec![],
            variables: vars,
        };
        let t = SshTransport {
            ssh: PathBuf::from("ssh"),
            options: vec!["ServerAliveInterval=5".into()],
            connect_timeout_secs: 7,
        };
        let args = t.base_args(&host);
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"ServerAliveInterval=5".to_string()));
        assert_eq!(&args[args.len() - 2..], ["-i", "/lab/keys/id"]);
        assert_eq!(SshTransport::destination(&host).unwrap(), "ubuntu@10.1.2.3");
    }
}
