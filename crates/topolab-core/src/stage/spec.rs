//! Declarative stage definitions as they appear in a model file.

use super::{
    DataSource, DistributeData, DistributeSshKey, Dispose, Kit, Locations, Phase, Provision,
    Ready, RemoveSshKey, RenderConfigs, Stage, SyncStaged,
};
use crate::env::EnvSource;
use crate::error::{LabError, Result};
use crate::paths;
use crate::resolver::{ReplacementSpec, Replacements};
use crate::selector::Selector;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// FileMode
// ---------------------------------------------------------------------------

/// Unix permission bits written as octal in YAML: `"0644"`, `"0o600"`, or
/// the bare number `644`, whose digits are read as octal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl Default for FileMode {
    fn default() -> Self {
        FileMode(0o644)
    }
}

impl FileMode {
    pub fn parse(s: &str) -> Result<Self> {
        let digits = s.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        let mode = u32::from_str_radix(digits, 8)
            .map_err(|_| LabError::InvalidModel(format!("invalid file mode '{s}'")))?;
        if mode > 0o7777 {
            return Err(LabError::InvalidModel(format!("file mode '{s}' out of range")));
        }
        Ok(FileMode(mode))
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl Serialize for FileMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }
        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        FileMode::parse(&text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// StageSpec
// ---------------------------------------------------------------------------

fn default_selector() -> String {
    "*".to_string()
}

fn default_ready_timeout() -> u64 {
    60
}

fn default_concurrency() -> usize {
    super::DEFAULT_CONCURRENCY
}

fn default_key_name() -> String {
    paths::DEFAULT_KEY_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageSpec {
    Provision,
    Ready {
        #[serde(default = "default_ready_timeout")]
        timeout_secs: u64,
    },
    RenderConfigs,
    Kit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        binaries: Vec<String>,
    },
    DistributeSshKey {
        #[serde(default = "default_selector")]
        selector: String,
    },
    Locations {
        #[serde(default = "default_selector")]
        selector: String,
        paths: Vec<String>,
    },
    DistributeData {
        #[serde(default = "default_selector")]
        selector: String,
        source: DataSource,
        dest: String,
        #[serde(default)]
        mode: FileMode,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        replace: Vec<ReplacementSpec>,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    SyncStaged {
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    Dispose,
    RemoveSshKey {
        #[serde(default = "default_key_name")]
        name: String,
    },
}

impl StageSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            StageSpec::Provision => "provision",
            StageSpec::Ready { .. } => "ready",
            StageSpec::RenderConfigs => "render_configs",
            StageSpec::Kit { .. } => "kit",
            StageSpec::DistributeSshKey { .. } => "distribute_ssh_key",
            StageSpec::Locations { .. } => "locations",
            StageSpec::DistributeData { .. } => "distribute_data",
            StageSpec::SyncStaged { .. } => "sync_staged",
            StageSpec::Dispose => "dispose",
            StageSpec::RemoveSshKey { .. } => "remove_ssh_key",
        }
    }

    /// The phase this stage is written for. Placing it elsewhere is allowed
    /// but flagged by validation.
    pub fn natural_phase(&self) -> Phase {
        match self {
            StageSpec::Provision | StageSpec::Ready { .. } => Phase::Infrastructure,
            StageSpec::RenderConfigs | StageSpec::Kit { .. } => Phase::Configuration,
            StageSpec::DistributeSshKey { .. }
            | StageSpec::Locations { .. }
            | StageSpec::DistributeData { .. }
            | StageSpec::SyncStaged { .. } => Phase::Distribution,
            StageSpec::Dispose | StageSpec::RemoveSshKey { .. } => Phase::Disposal,
        }
    }

    /// Static checks that need no environment: selectors and ids.
    pub fn check(&self) -> Result<()> {
        match self {
            StageSpec::DistributeSshKey { selector }
            | StageSpec::Locations { selector, .. }
            | StageSpec::DistributeData { selector, .. } => Selector::parse(selector).map(|_| ()),
            StageSpec::Kit { binaries, .. } if binaries.is_empty() => {
                Err(LabError::InvalidModel("kit stage lists no binaries".into()))
            }
            StageSpec::RemoveSshKey { name } => paths::validate_id(name),
            _ => Ok(()),
        }
    }

    /// Build the runtime stage. Environment-backed resolvers capture their
    /// value from `env` here.
    pub fn build(&self, env: &dyn EnvSource) -> Result<Arc<dyn Stage>> {
        self.check()?;
        let stage: Arc<dyn Stage> = match self {
            StageSpec::Provision => Arc::new(Provision),
            StageSpec::Ready { timeout_secs } => {
                Arc::new(Ready::new(Duration::from_secs(*timeout_secs)))
            }
            StageSpec::RenderConfigs => Arc::new(RenderConfigs),
            StageSpec::Kit { source, binaries } => {
                let kit = Kit::new(binaries.iter().cloned());
                Arc::new(match source {
                    Some(dir) => kit.from_dir(dir.clone()),
                    None => kit,
                })
            }
            StageSpec::DistributeSshKey { selector } => {
                Arc::new(DistributeSshKey::new(Selector::parse(selector)?))
            }
            StageSpec::Locations { selector, paths } => {
                Arc::new(Locations::new(Selector::parse(selector)?, paths.iter().cloned()))
            }
            StageSpec::DistributeData {
                selector,
                source,
                dest,
                mode,
                replace,
                concurrency,
            } => {
                let mut stage =
                    DistributeData::new(Selector::parse(selector)?, source.clone(), dest.clone())
                        .mode(mode.0)
                        .replacements(Replacements::from_specs(replace, env))
                        .concurrency(*concurrency);
                for spec in replace {
                    if let Some(name) = spec.resolver.required_env() {
                        stage = stage.require_env(name);
                    }
                    if let Some(path) = spec.resolver.required_variable() {
                        stage = stage.require_variable(path);
                    }
                }
                Arc::new(stage)
            }
            StageSpec::SyncStaged { concurrency } => Arc::new(SyncStaged {
                concurrency: *concurrency,
            }),
            StageSpec::Dispose => Arc::new(Dispose),
            StageSpec::RemoveSshKey { name } => Arc::new(RemoveSshKey::new(name.clone())),
        };
        Ok(stage)
    }
}
