use super::{fan_out, Stage};
use crate::context::RunContext;
use crate::error::{LabError, Result};
use crate::topology::HostView;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Ask the provisioner for hosts and record their public IPs in the model
/// and in the persisted instance state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Provision;

#[async_trait]
impl Stage for Provision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let provisioner = ctx.provisioner.clone();
        info!(provisioner = provisioner.name(), "provisioning hosts");
        let ips = provisioner.provision(&ctx.model).await?;

        for (key, ip) in &ips {
            ctx.model.set_public_ip(key, ip.clone()).map_err(|_| {
                LabError::Provision(format!("provisioner reported unknown host '{key}'"))
            })?;
            ctx.instance.set_host_ip(key.clone(), ip.clone());
        }
        ctx.save_instance()?;

        let missing: Vec<String> = ctx
            .model
            .hosts()
            .filter(|h| h.host.public_ip.is_none())
            .map(|h| h.key())
            .collect();
        if !missing.is_empty() {
            return Err(LabError::Provision(format!(
                "no public ip reported for: {}",
                missing.join(", ")
            )));
        }
        info!(hosts = ips.len(), "hosts provisioned");
        Ok(())
    }
}

/// Wait until every host accepts commands, probing each one until `timeout`.
#[derive(Debug, Clone)]
pub struct Ready {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Ready {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: Duration::from_secs(5),
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Stage for Ready {
    fn name(&self) -> &str {
        "ready"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let items: Vec<(String, HostView)> = ctx
            .model
            .host_views()
            .into_iter()
            .map(|v| (v.key.clone(), v))
            .collect();
        let timeout = self.timeout;
        let interval = self.interval;
        let transport = ctx.transport.clone();

        fan_out("ready", items, 0, move |host| {
            let transport = transport.clone();
            async move {
                let started = Instant::now();
                loop {
                    match transport.probe(&host).await {
                        Ok(()) => {
                            debug!(host = %host.key, "host ready");
                            return Ok(());
                        }
                        Err(e) if e.is_fatal_config() || matches!(e, LabError::NotProvisioned(_)) => {
                            return Err(e)
                        }
                        Err(e) => {
                            if started.elapsed() >= timeout {
                                return Err(LabError::HostUnreachable {
                                    host: host.key.clone(),
                                    waited_secs: timeout.as_secs(),
                                });
                            }
                            debug!(host = %host.key, error = %e, "host not ready yet");
                            tokio::time::sleep(interval).await;
                        }
                    }
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::provision::Provisioner;
    use crate::topology::{Host, Region};
    use crate::transport::{ExecOutput, Transport};
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct FixedIps(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl Provisioner for FixedIps {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn provision(&self, _model: &Model) -> Result<BTreeMap<String, String>> {
            Ok(self.0.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        }
        async fn dispose(&self, _model: &Model) -> Result<()> {
            Ok(())
        }
    }

    /// Fails `probe` a fixed number of times per call site before succeeding.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn probe(&self, host: &HostView) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(LabError::Transport {
                    host: host.key.clone(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        }
        async fn mkdir(&self, _: &HostView, _: &str) -> Result<()> {
            Ok(())
        }
        async fn put(&self, _: &HostView, _: &str, _: &[u8], _: u32) -> Result<()> {
            Ok(())
        }
        async fn sync_dir(&self, _: &HostView, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        async fn exec(&self, _: &HostView, _: &str) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
    }

    fn model() -> Model {
        Model::builder("ha")
            .region(Region::new("us-east-1").host(Host::new("ctrl1")).host(Host::new("ctrl2")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn provision_records_ips_in_model_and_state() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_provisioner(Arc::new(FixedIps(vec![
                ("us-east-1/ctrl1", "10.0.0.1"),
                ("us-east-1/ctrl2", "10.0.0.2"),
            ])));
        Provision.execute(&mut ctx).await.unwrap();

        assert_eq!(
            ctx.model.host_view("us-east-1/ctrl2").unwrap().public_ip().unwrap(),
            "10.0.0.2"
        );
        let persisted = std::fs::read_to_string(dir.path().join("instance.yaml")).unwrap();
        assert!(persisted.contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn provision_fails_when_a_host_gets_no_ip() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_provisioner(Arc::new(FixedIps(vec![("us-east-1/ctrl1", "10.0.0.1")])));
        let err = Provision.execute(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("us-east-1/ctrl2"));
        // The IP that was reported is still kept.
        assert_eq!(ctx.instance.hosts.len(), 1);
    }

    #[tokio::test]
    async fn ready_retries_until_probe_succeeds() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_transport(Arc::new(Flaky {
                failures: 3,
                calls: AtomicUsize::new(0),
            }));
        Ready::new(Duration::from_secs(5))
            .interval(Duration::from_millis(10))
            .execute(&mut ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ready_gives_up_after_timeout() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_transport(Arc::new(Flaky {
                failures: usize::MAX,
                calls: AtomicUsize::new(0),
            }));
        let err = Ready::new(Duration::from_millis(50))
            .interval(Duration::from_millis(10))
            .execute(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::HostUnreachable { .. }));
    }
}
