pub mod lab;
pub mod select;
pub mod show;
pub mod validate;

use anyhow::Context;
use std::path::Path;
use topolab_core::env::ProcessEnv;
use topolab_core::instance::InstanceState;
use topolab_core::{paths, Model, ModelFile};

/// Load and build the model without touching any host. Public IPs recorded
/// in the lab directory, if there is one, are applied.
pub fn load_model(model_path: &Path, lab_dir: Option<&Path>) -> anyhow::Result<Model> {
    let file = ModelFile::load(model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let mut model = Model::from_file(&file, &ProcessEnv)?;

    let lab = match lab_dir {
        Some(dir) => Some(dir.to_path_buf()),
        None => paths::default_lab_dir(model.id()).ok(),
    };
    if let Some(lab) = lab.filter(|l| paths::instance_path(l).exists()) {
        let state = InstanceState::load_or_new(&lab, model.id())?;
        for (key, ip) in &state.hosts {
            if let Err(e) = model.set_public_ip(key, ip.clone()) {
                tracing::warn!(host = %key, error = %e, "ignoring recorded host");
            }
        }
    }
    Ok(model)
}
