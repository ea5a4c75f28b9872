//! Stages, phases and the phase runner.
//!
//! A phase is an ordered list of stages. Stages run strictly one after the
//! other; within a stage, per-host work may fan out (see [`fan_out`]). The
//! first failing stage ends the phase and nothing already done is rolled
//! back. Disposal is the exception: it is best-effort, runs every stage,
//! and reports all failures together.

mod configuration;
mod disposal;
mod distribution;
mod fanout;
mod infrastructure;
mod spec;

pub use configuration::{Kit, RenderConfigs};
pub use disposal::{Dispose, RemoveSshKey};
pub use distribution::{
    DataSource, DistributeData, DistributeSshKey, Locations, SyncStaged, DEFAULT_CONCURRENCY,
};
pub use fanout::fan_out;
pub use infrastructure::{Provision, Ready};
pub use spec::{FileMode, StageSpec};

use crate::context::RunContext;
use crate::error::{LabError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Checks that can fail before any phase touches a host, such as
    /// required environment variables. Must not mutate anything.
    fn preflight(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Infrastructure,
    Configuration,
    Distribution,
    Disposal,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Infrastructure,
            Phase::Configuration,
            Phase::Distribution,
            Phase::Disposal,
        ]
    }

    /// The phases `up` runs, in order.
    pub fn bring_up() -> &'static [Phase] {
        &[Phase::Infrastructure, Phase::Configuration, Phase::Distribution]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Infrastructure => "infrastructure",
            Phase::Configuration => "configuration",
            Phase::Distribution => "distribution",
            Phase::Disposal => "disposal",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "infrastructure" | "infra" => Ok(Phase::Infrastructure),
            "configuration" | "config" => Ok(Phase::Configuration),
            "distribution" | "dist" => Ok(Phase::Distribution),
            "disposal" | "dispose" => Ok(Phase::Disposal),
            other => Err(LabError::InvalidPhase(format!(
                "'{other}' (expected infrastructure, configuration, distribution or disposal)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// PhaseRunner
// ---------------------------------------------------------------------------

pub struct PhaseRunner;

impl PhaseRunner {
    /// Preflight every stage of `phases`, stopping at the first problem.
    pub fn preflight(ctx: &RunContext, phases: &[Phase]) -> Result<()> {
        for phase in phases {
            for stage in ctx.model.stages(*phase) {
                stage.preflight(ctx).map_err(|e| {
                    error!(phase = %phase, stage = stage.name(), error = %e, "preflight failed");
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Run one phase. Disposal goes through [`PhaseRunner::dispose`].
    pub async fn run(ctx: &mut RunContext, phase: Phase) -> Result<()> {
        if phase == Phase::Disposal {
            return Self::dispose(ctx).await;
        }
        let stages = ctx.model.stages(phase);
        info!(phase = %phase, stages = stages.len(), "phase starting");
        for stage in stages {
            info!(phase = %phase, stage = stage.name(), "stage starting");
            if let Err(e) = stage.execute(ctx).await {
                error!(phase = %phase, stage = stage.name(), error = %e, "stage failed");
                return Err(e);
            }
        }
        info!(phase = %phase, "phase complete");
        Ok(())
    }

    /// Run every disposal stage even if earlier ones fail.
    pub async fn dispose(ctx: &mut RunContext) -> Result<()> {
        let stages = ctx.model.stages(Phase::Disposal);
        info!(phase = "disposal", stages = stages.len(), "phase starting");
        let mut failures = Vec::new();
        for stage in stages {
            info!(phase = "disposal", stage = stage.name(), "stage starting");
            if let Err(e) = stage.execute(ctx).await {
                warn!(phase = "disposal", stage = stage.name(), error = %e, "disposal stage failed, continuing");
                failures.push(format!("{}: {e}", stage.name()));
            }
        }
        if failures.is_empty() {
            info!(phase = "disposal", "phase complete");
            Ok(())
        } else {
            Err(LabError::Disposal(failures))
        }
    }
}
