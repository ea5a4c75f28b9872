//! Drives a lab: bootstrap once, then phases or actions against one
//! [`RunContext`]. Every step's outcome lands in the instance history.

use crate::action;
use crate::bootstrap::{self, BootstrapExtension};
use crate::context::RunContext;
use crate::env::EnvSource;
use crate::error::{LabError, Result};
use crate::model::Model;
use crate::model_file::ModelFile;
use crate::paths;
use crate::resources::{DirResources, MemoryResources, ResourceBundle};
use crate::stage::{Phase, PhaseRunner};
use crate::topology::WarnLevel;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct Orchestrator {
    ctx: RunContext,
    extensions: Vec<Box<dyn BootstrapExtension>>,
    bootstrapped: bool,
    run_id: Uuid,
}

impl Orchestrator {
    pub fn new(ctx: RunContext, extensions: Vec<Box<dyn BootstrapExtension>>) -> Self {
        Self {
            ctx,
            extensions,
            bootstrapped: false,
            run_id: Uuid::new_v4(),
        }
    }

    /// Load `model_path` and wire up the backends it names. `lab_dir`
    /// defaults to `~/.topolab/<model-id>`.
    pub fn open(model_path: &Path, lab_dir: Option<&Path>, env: Arc<dyn EnvSource>) -> Result<Self> {
        let file = ModelFile::load(model_path)?;
        for w in file.validate() {
            if w.level == WarnLevel::Warning {
                warn!(model = %file.id, "{}", w.message);
            }
        }
        let model = Model::from_file(&file, env.as_ref())?;

        let lab_dir = match lab_dir {
            Some(dir) => dir.to_path_buf(),
            None => paths::default_lab_dir(&file.id)?,
        };
        let base_dir = ModelFile::base_dir(model_path);
        let resources: Arc<dyn ResourceBundle> = match &file.resources.configs {
            Some(dir) if dir.is_absolute() => Arc::new(DirResources::new(dir)),
            Some(dir) => Arc::new(DirResources::new(base_dir.join(dir))),
            None => Arc::new(MemoryResources::new()),
        };
        let transport = file.backend.transport.build(&lab_dir)?;
        let provisioner = file.backend.provisioner.build(&base_dir);

        let ctx = RunContext::new(model, &lab_dir)?
            .with_env(env)
            .with_transport(transport)
            .with_provisioner(provisioner)
            .with_resources(resources)
            .with_base_dir(base_dir);
        let extensions = file.bootstrap.iter().map(|spec| spec.build()).collect();
        Ok(Self::new(ctx, extensions))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut RunContext {
        &mut self.ctx
    }

    pub fn into_context(self) -> RunContext {
        self.ctx
    }

    fn record<T>(&mut self, step: &str, result: &Result<T>) {
        self.ctx.instance.record(self.run_id, step, result);
        if let Err(e) = self.ctx.save_instance() {
            warn!(step, error = %e, "could not save instance state");
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Run the bootstrap chain. Later calls are no-ops once it has
    /// succeeded.
    pub async fn bootstrap(&mut self) -> Result<()> {
        if self.bootstrapped {
            return Ok(());
        }
        info!(model = self.ctx.model.id(), run_id = %self.run_id, extensions = self.extensions.len(), "bootstrap");
        let result = bootstrap::run_chain(&self.extensions, &mut self.ctx).await;
        self.record("bootstrap", &result);
        result?;
        self.bootstrapped = true;
        Ok(())
    }

    pub async fn preflight(&mut self, phases: &[Phase]) -> Result<()> {
        self.bootstrap().await?;
        let result = PhaseRunner::preflight(&self.ctx, phases);
        if result.is_err() {
            self.record("preflight", &result);
        }
        result
    }

    pub async fn run_phase(&mut self, phase: Phase) -> Result<()> {
        self.preflight(&[phase]).await?;
        self.run_checked(phase).await
    }

    async fn run_checked(&mut self, phase: Phase) -> Result<()> {
        let result = PhaseRunner::run(&mut self.ctx, phase).await;
        self.record(&format!("phase:{phase}"), &result);
        result
    }

    /// Infrastructure, configuration, distribution. All three are
    /// preflighted before the first one runs.
    pub async fn up(&mut self) -> Result<()> {
        self.preflight(Phase::bring_up()).await?;
        for phase in Phase::bring_up() {
            self.run_checked(*phase).await?;
        }
        info!(model = self.ctx.model.id(), "lab is up");
        Ok(())
    }

    pub async fn dispose(&mut self) -> Result<()> {
        self.bootstrap().await?;
        self.run_checked(Phase::Disposal).await
    }

    pub async fn activate<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        self.bootstrap().await?;
        self.ctx.model.actions().check(names)?;
        for name in names {
            let name = name.as_ref();
            let result = action::activate(&mut self.ctx, &[name]).await;
            self.record(&format!("action:{name}"), &result);
            result?;
        }
        Ok(())
    }

    /// Run the model's `activation` list.
    pub async fn activate_default(&mut self) -> Result<()> {
        let names = self.ctx.model.activation().to_vec();
        if names.is_empty() {
            return Err(LabError::InvalidModel(format!(
                "model '{}' has no activation list; name the actions to run",
                self.ctx.model.id()
            )));
        }
        self.activate(&names).await
    }
}
