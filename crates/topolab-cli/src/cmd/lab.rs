use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use topolab_core::env::ProcessEnv;
use topolab_core::instance::{Outcome, RunRecord};
use topolab_core::stage::Phase;
use topolab_core::Orchestrator;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

pub fn up(model: &Path, lab_dir: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let mut orch = open(model, lab_dir)?;
    let result = runtime()?.block_on(orch.up());
    finish(&orch, "up", result, json)
}

pub fn run_phase(model: &Path, lab_dir: Option<&Path>, phase: &str, json: bool) -> anyhow::Result<()> {
    let phase: Phase = phase.parse()?;
    let mut orch = open(model, lab_dir)?;
    let result = runtime()?.block_on(orch.run_phase(phase));
    finish(&orch, phase.as_str(), result, json)
}

pub fn dispose(model: &Path, lab_dir: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let mut orch = open(model, lab_dir)?;
    let result = runtime()?.block_on(orch.dispose());
    finish(&orch, "dispose", result, json)
}

/// No names runs the model's activation list.
pub fn activate(model: &Path, lab_dir: Option<&Path>, names: &[String], json: bool) -> anyhow::Result<()> {
    let mut orch = open(model, lab_dir)?;
    let rt = runtime()?;
    let result = if names.is_empty() {
        rt.block_on(orch.activate_default())
    } else {
        rt.block_on(orch.activate(names))
    };
    finish(&orch, "activate", result, json)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open(model: &Path, lab_dir: Option<&Path>) -> anyhow::Result<Orchestrator> {
    Orchestrator::open(model, lab_dir, Arc::new(ProcessEnv))
        .with_context(|| format!("failed to open {}", model.display()))
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

fn outcome_str(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Ok => "ok",
        Outcome::Failed => "failed",
    }
}

/// Report this run's steps, then surface the error if there was one.
fn finish(orch: &Orchestrator, what: &str, result: topolab_core::Result<()>, json: bool) -> anyhow::Result<()> {
    let ctx = orch.ctx();
    let steps: Vec<&RunRecord> = ctx
        .instance
        .history
        .iter()
        .filter(|r| r.run_id == orch.run_id())
        .collect();

    if json {
        print_json(&serde_json::json!({
            "model": ctx.model.id(),
            "lab_dir": ctx.lab_dir,
            "run_id": orch.run_id(),
            "ok": result.is_ok(),
            "steps": steps,
        }))?;
    } else {
        let rows = steps
            .iter()
            .map(|r| {
                vec![
                    r.step.clone(),
                    outcome_str(r.outcome).to_string(),
                    r.timestamp.format("%H:%M:%S").to_string(),
                ]
            })
            .collect();
        print_table(&["STEP", "OUTCOME", "AT"], rows);
    }

    result.with_context(|| format!("{what} failed for model '{}'", ctx.model.id()))
}
