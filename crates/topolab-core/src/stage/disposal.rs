use super::Stage;
use crate::context::RunContext;
use crate::error::Result;
use crate::io;
use crate::paths;
use async_trait::async_trait;
use tracing::info;

/// Provisioner teardown. Forgets every host IP afterwards, so a second run
/// against an already-disposed lab is harmless.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dispose;

#[async_trait]
impl Stage for Dispose {
    fn name(&self) -> &str {
        "dispose"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let provisioner = ctx.provisioner.clone();
        info!(provisioner = provisioner.name(), "disposing hosts");
        provisioner.dispose(&ctx.model).await?;
        ctx.model.clear_public_ips();
        ctx.instance.clear_hosts();
        ctx.save_instance()
    }
}

/// Delete the generated lab keypair if there is one.
#[derive(Debug, Clone)]
pub struct RemoveSshKey {
    pub name: String,
}

impl RemoveSshKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for RemoveSshKey {
    fn name(&self) -> &str {
        "remove_ssh_key"
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let private = paths::private_key_path(&ctx.lab_dir, &self.name);
        let public = paths::public_key_path(&ctx.lab_dir, &self.name);
        let removed = io::remove_if_exists(&private)? | io::remove_if_exists(&public)?;
        info!(key = %private.display(), removed, "ssh key disposal");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::topology::{Host, Region};
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> RunContext {
        let model = Model::builder("ha")
            .region(Region::new("us-east-1").host(Host::new("ctrl1").public_ip("10.0.0.1")))
            .build()
            .unwrap();
        RunContext::new(model, dir.path()).unwrap()
    }

    #[tokio::test]
    async fn dispose_clears_ips_and_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        ctx.instance.set_host_ip("us-east-1/ctrl1", "10.0.0.1");

        Dispose.execute(&mut ctx).await.unwrap();
        assert!(ctx.instance.hosts.is_empty());
        assert!(ctx.model.host_view("us-east-1/ctrl1").unwrap().public_ip.is_none());
        Dispose.execute(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn remove_ssh_key_tolerates_missing_key() {
        let dir = TempDir::new().unwrap();
        let mut ctx = ctx(&dir);
        std::fs::create_dir_all(dir.path().join("keys")).unwrap();
        std::fs::write(dir.path().join("keys/ha"), b"k").unwrap();
        std::fs::write(dir.path().join("keys/ha.pub"), b"k").unwrap();

        let stage = RemoveSshKey::new("ha");
        stage.execute(&mut ctx).await.unwrap();
        assert!(!dir.path().join("keys/ha").exists());
        assert!(!dir.path().join("keys/ha.pub").exists());
        stage.execute(&mut ctx).await.unwrap();
    }
}
