use crate::error::{LabError, Result};
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

const MAX_HISTORY: usize = 200;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    /// `phase:<name>`, `action:<name>` or `bootstrap`.
    pub step: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// InstanceState
// ---------------------------------------------------------------------------

/// What a lab directory remembers between invocations: which model it
/// belongs to, the public IP of every provisioned host, and a bounded run
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub model: String,
    #[serde(default)]
    pub hosts: BTreeMap<String, String>,
    #[serde(default)]
    pub history: Vec<RunRecord>,
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl InstanceState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            version: 1,
            model: model.into(),
            hosts: BTreeMap::new(),
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    /// Load the state for `model` from `lab`, or start fresh if the lab has
    /// none yet. A lab created for a different model is refused.
    pub fn load_or_new(lab: &Path, model: &str) -> Result<Self> {
        let path = paths::instance_path(lab);
        if !path.exists() {
            return Ok(Self::new(model));
        }
        let data = std::fs::read_to_string(&path)?;
        let state: InstanceState = serde_yaml::from_str(&data)?;
        if state.model != model {
            return Err(LabError::InvalidModel(format!(
                "lab directory {} belongs to model '{}', not '{model}'",
                lab.display(),
                state.model
            )));
        }
        Ok(state)
    }

    pub fn save(&mut self, lab: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::instance_path(lab), data.as_bytes())
    }

    // ---------------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------------

    pub fn set_host_ip(&mut self, key: impl Into<String>, ip: impl Into<String>) {
        self.hosts.insert(key.into(), ip.into());
    }

    pub fn clear_hosts(&mut self) {
        self.hosts.clear();
    }

    pub fn record<T>(&mut self, run_id: Uuid, step: impl Into<String>, result: &Result<T>) {
        let (outcome, error) = match result {
            Ok(_) => (Outcome::Ok, None),
            Err(e) => (Outcome::Failed, Some(e.to_string())),
        };
        self.history.push(RunRecord {
            run_id,
            step: step.into(),
            outcome,
            error,
            timestamp: Utc::now(),
        });
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    pub fn last(&self) -> Option<&RunRecord> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_missing_returns_fresh_state() {
        let dir = TempDir::new().unwrap();
        let state = InstanceState::load_or_new(dir.path(), "ha").unwrap();
        assert_eq!(state.model, "ha");
        assert!(state.hosts.is_empty());
    }

    #[test]
    fn save_then_load_keeps_hosts_and_history() {
        let dir = TempDir::new().unwrap();
        let mut state = InstanceState::new("ha");
        state.set_host_ip("us-east-1/ctrl1", "10.0.0.1");
        let run = Uuid::new_v4();
        state.record(run, "phase:infrastructure", &Ok::<(), LabError>(()));
        state.record(
            run,
            "phase:distribution",
            &Err::<(), _>(LabError::MissingEnv("ELASTIC_ENDPOINT".into())),
        );
        state.save(dir.path()).unwrap();

        let loaded = InstanceState::load_or_new(dir.path(), "ha").unwrap();
        assert_eq!(loaded.hosts.get("us-east-1/ctrl1").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(loaded.history.len(), 2);
        let last = loaded.last().unwrap();
        assert_eq!(last.outcome, Outcome::Failed);
        assert!(last.error.as_deref().unwrap().contains("ELASTIC_ENDPOINT"));
    }

    #[test]
    fn lab_for_other_model_is_refused() {
        let dir = TempDir::new().unwrap();
        InstanceState::new("ha").save(dir.path()).unwrap();
        let err = InstanceState::load_or_new(dir.path(), "smoke").unwrap_err();
        assert!(matches!(err, LabError::InvalidModel(_)));
    }

    #[test]
    fn history_is_bounded() {
        let mut state = InstanceState::new("ha");
        let run = Uuid::new_v4();
        for i in 0..(MAX_HISTORY + 5) {
            state.record(run, format!("action:{i}"), &Ok::<(), LabError>(()));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].step, "action:5");
    }
}
