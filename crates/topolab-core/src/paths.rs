use crate::error::{LabError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Layout constants
// ---------------------------------------------------------------------------

/// Model file looked up from the working directory when `--model` is absent.
pub const MODEL_FILE: &str = "topolab.yaml";

/// Per-user directory holding one lab directory per model id.
pub const LAB_HOME_DIR: &str = ".topolab";

pub const INSTANCE_FILE: &str = "instance.yaml";
pub const BINDINGS_FILE: &str = "bindings.yaml";
pub const KEYS_DIR: &str = "keys";
pub const DEFAULT_KEY_NAME: &str = "id_ed25519";
pub const BUILD_DIR: &str = "build";
pub const KIT_DIR: &str = "build/kit";
pub const HOSTS_BUILD_DIR: &str = "build/hosts";

/// Directory on every remote host (relative to the login home) that staged
/// kits and rendered configs are synced into.
pub const REMOTE_ROOT: &str = "topolab";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `~/.topolab/<model-id>`
pub fn default_lab_dir(model_id: &str) -> Result<PathBuf> {
    let home = home::home_dir().ok_or(LabError::HomeNotFound)?;
    Ok(home.join(LAB_HOME_DIR).join(model_id))
}

pub fn instance_path(lab: &Path) -> PathBuf {
    lab.join(INSTANCE_FILE)
}

pub fn bindings_path(lab: &Path) -> PathBuf {
    lab.join(BINDINGS_FILE)
}

pub fn keys_dir(lab: &Path) -> PathBuf {
    lab.join(KEYS_DIR)
}

pub fn private_key_path(lab: &Path, name: &str) -> PathBuf {
    keys_dir(lab).join(name)
}

pub fn public_key_path(lab: &Path, name: &str) -> PathBuf {
    keys_dir(lab).join(format!("{name}.pub"))
}

pub fn kit_dir(lab: &Path) -> PathBuf {
    lab.join(KIT_DIR)
}

/// Local build area for one host. `host_key` is `<region>/<host>`, so the
/// region becomes a directory level.
pub fn host_build_dir(lab: &Path, host_key: &str) -> PathBuf {
    lab.join(HOSTS_BUILD_DIR).join(host_key)
}

// ---------------------------------------------------------------------------
// Id validation
// ---------------------------------------------------------------------------

static ID_RE: OnceLock<Regex> = OnceLock::new();

fn id_re() -> &'static Regex {
    ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").unwrap())
}

/// Region, host and component ids end up in local paths and host keys, so
/// they may not contain separators or whitespace.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !id_re().is_match(id) {
        return Err(LabError::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        for id in ["us-east-1", "ctrl1", "router-west", "echo_server", "a.b"] {
            validate_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_ids() {
        for id in ["", "-dash", "has space", "a/b", "..", "x".repeat(65).as_str()] {
            assert!(validate_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn host_build_dir_nests_region() {
        let p = host_build_dir(Path::new("/lab"), "us-east-1/ctrl1");
        assert_eq!(p, PathBuf::from("/lab/build/hosts/us-east-1/ctrl1"));
    }
}
