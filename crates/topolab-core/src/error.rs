use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    // -- fatal configuration ------------------------------------------------
    #[error("required variable '{path}' is not set (scope: {scope})")]
    MissingVariable { path: String, scope: String },

    #[error("required environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error("invalid model: {0}")]
    InvalidModel(String),

    #[error("invalid selector '{0}': expected '*', '#tag' or a component id")]
    InvalidSelector(String),

    #[error("invalid id '{0}': must be alphanumeric with '-', '_' or '.'")]
    InvalidId(String),

    #[error("invalid phase: {0}")]
    InvalidPhase(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("home directory not found: set HOME or pass --lab-dir")]
    HomeNotFound,

    // -- bootstrap ----------------------------------------------------------
    #[error("bootstrap extension '{extension}' failed: {reason}")]
    Bootstrap { extension: String, reason: String },

    #[error("'{0}' not found on PATH")]
    ToolMissing(String),

    // -- stage / action -----------------------------------------------------
    #[error("host {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("host {host} not reachable after {waited_secs}s")]
    HostUnreachable { host: String, waited_secs: u64 },

    #[error("host {0} has no public ip: run the infrastructure phase first")]
    NotProvisioned(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    // -- disposal -----------------------------------------------------------
    #[error("disposal finished with failures: {}", .0.join("; "))]
    Disposal(Vec<String>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LabError {
    /// Configuration errors are never worth retrying: the input has to change.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            LabError::MissingVariable { .. }
                | LabError::MissingEnv(_)
                | LabError::InvalidModel(_)
                | LabError::InvalidSelector(_)
                | LabError::InvalidId(_)
                | LabError::ResourceNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LabError>;
