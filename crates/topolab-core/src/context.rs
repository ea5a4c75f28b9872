use crate::env::{EnvSource, ProcessEnv};
use crate::error::Result;
use crate::instance::InstanceState;
use crate::model::Model;
use crate::paths;
use crate::provision::{Provisioner, StaticProvisioner};
use crate::resources::{MemoryResources, ResourceBundle};
use crate::transport::{LocalTransport, Transport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Everything a stage, action or bootstrap extension may touch during a run.
///
/// The collaborators are `Arc`s so fan-out tasks can take their own handle;
/// the model and instance state are owned and only mutated by the single
/// pipeline driver.
pub struct RunContext {
    pub model: Model,
    pub env: Arc<dyn EnvSource>,
    pub transport: Arc<dyn Transport>,
    pub provisioner: Arc<dyn Provisioner>,
    pub resources: Arc<dyn ResourceBundle>,
    /// Local build area and persisted state.
    pub lab_dir: PathBuf,
    /// Directory the model was loaded from; relative kit sources resolve here.
    pub base_dir: PathBuf,
    pub instance: InstanceState,
}

impl RunContext {
    /// A context with local-only defaults: process environment, a local
    /// transport rooted at `<lab>/hosts`, the static provisioner and an empty
    /// resource bundle. Host IPs recorded by an earlier run are applied to
    /// the model.
    pub fn new(model: Model, lab_dir: impl Into<PathBuf>) -> Result<Self> {
        let lab_dir = lab_dir.into();
        let instance = InstanceState::load_or_new(&lab_dir, model.id())?;
        let mut ctx = Self {
            model,
            env: Arc::new(ProcessEnv),
            transport: Arc::new(LocalTransport::new(lab_dir.join("hosts"))),
            provisioner: Arc::new(StaticProvisioner),
            resources: Arc::new(MemoryResources::new()),
            base_dir: PathBuf::from("."),
            lab_dir,
            instance,
        };
        ctx.apply_instance_ips();
        Ok(ctx)
    }

    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_resources(mut self, resources: Arc<dyn ResourceBundle>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    fn apply_instance_ips(&mut self) {
        let recorded: Vec<(String, String)> = self
            .instance
            .hosts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, ip) in recorded {
            if let Err(e) = self.model.set_public_ip(&key, ip) {
                warn!(host = %key, error = %e, "ignoring recorded host that is not in the model");
            }
        }
    }

    pub fn save_instance(&mut self) -> Result<()> {
        self.instance.save(&self.lab_dir)
    }

    pub fn kit_dir(&self) -> PathBuf {
        paths::kit_dir(&self.lab_dir)
    }

    pub fn host_build_dir(&self, host_key: &str) -> PathBuf {
        paths::host_build_dir(&self.lab_dir, host_key)
    }

    /// Resolve a path from the model file against its directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Host, Region};
    use tempfile::TempDir;

    fn model() -> Model {
        Model::builder("ha")
            .region(Region::new("us-east-1").host(Host::new("ctrl1")))
            .build()
            .unwrap()
    }

    #[test]
    fn recorded_ips_are_applied_to_the_model() {
        let dir = TempDir::new().unwrap();
        let mut state = InstanceState::new("ha");
        state.set_host_ip("us-east-1/ctrl1", "10.0.0.1");
        state.set_host_ip("us-east-1/gone", "10.0.0.9");
        state.save(dir.path()).unwrap();

        let ctx = RunContext::new(model(), dir.path()).unwrap();
        let view = ctx.model.host_view("us-east-1/ctrl1").unwrap();
        assert_eq!(view.public_ip().unwrap(), "10.0.0.1");
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_base_dir("/models/ha");
        assert_eq!(ctx.resolve_path(Path::new("kit")), PathBuf::from("/models/ha/kit"));
        assert_eq!(ctx.resolve_path(Path::new("/opt/kit")), PathBuf::from("/opt/kit"));
    }
}
