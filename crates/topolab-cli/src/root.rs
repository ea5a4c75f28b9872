use std::path::{Path, PathBuf};
use topolab_core::paths::MODEL_FILE;

/// Resolve the model file.
///
/// Priority:
/// 1. `--model` flag / `TOPOLAB_MODEL` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `topolab.yaml`
pub fn resolve_model(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    let cwd = std::env::current_dir()?;
    find_upward(&cwd).ok_or_else(|| {
        anyhow::anyhow!(
            "no {MODEL_FILE} found in {} or any parent; pass --model",
            cwd.display()
        )
    })
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(MODEL_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        match dir.parent() {
            Some(p) => dir = p.to_path_buf(),
            None => return None,
        }
    }
}
