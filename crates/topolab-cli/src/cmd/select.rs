use crate::output::{cell, print_json, print_table};
use serde::Serialize;
use std::path::Path;
use topolab_core::selector::Selector;

#[derive(Serialize)]
struct Match {
    host: String,
    component: String,
    binary: Option<String>,
    tags: Vec<String>,
}

/// List the (host, component) pairs a selector matches, in declaration order.
pub fn run(model_path: &Path, lab_dir: Option<&Path>, selector: &str, json: bool) -> anyhow::Result<()> {
    let selector = Selector::parse(selector)?;
    let model = super::load_model(model_path, lab_dir)?;

    let matches: Vec<Match> = model
        .select(&selector)
        .into_iter()
        .map(|s| Match {
            host: s.host.key(),
            component: s.component.id.clone(),
            binary: s.component.binary.clone(),
            tags: s.component.scope.tags.clone(),
        })
        .collect();

    if json {
        return print_json(&matches);
    }
    if matches.is_empty() {
        println!("No components match '{selector}'.");
        return Ok(());
    }
    print_table(
        &["HOST", "COMPONENT", "BINARY", "TAGS"],
        matches
            .iter()
            .map(|m| {
                vec![
                    m.host.clone(),
                    m.component.clone(),
                    cell(m.binary.as_deref()),
                    m.tags.join(","),
                ]
            })
            .collect(),
    );
    Ok(())
}
