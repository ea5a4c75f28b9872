use crate::output::{print_json, print_warnings};
use anyhow::Context;
use std::path::Path;
use topolab_core::ModelFile;

pub fn run(model_path: &Path, json: bool) -> anyhow::Result<()> {
    let file = ModelFile::load(model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    let warnings = file.validate();

    if json {
        print_json(&serde_json::json!({
            "model": file.id,
            "warnings": warnings,
        }))?;
    } else if warnings.is_empty() {
        println!("Model '{}' is valid. No warnings.", file.id);
    } else {
        print_warnings(&warnings);
    }

    if ModelFile::has_errors(&warnings) {
        anyhow::bail!("model validation found errors");
    }
    Ok(())
}
