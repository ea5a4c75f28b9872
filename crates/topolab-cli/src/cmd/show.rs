use crate::output::{cell, print_json, print_table};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct HostRow {
    key: String,
    region: String,
    site: Option<String>,
    instance_type: Option<String>,
    public_ip: Option<String>,
    components: Vec<String>,
    tags: Vec<String>,
}

pub fn run(model_path: &Path, lab_dir: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let model = super::load_model(model_path, lab_dir)?;

    let rows: Vec<HostRow> = model
        .hosts()
        .map(|h| {
            let view = model.view(h);
            HostRow {
                components: h.host.components.iter().map(|c| c.id.clone()).collect(),
                key: view.key,
                region: view.region,
                site: view.site,
                instance_type: view.instance_type,
                public_ip: view.public_ip,
                tags: view.tags,
            }
        })
        .collect();

    if json {
        return print_json(&serde_json::json!({
            "model": model.id(),
            "hosts": rows,
            "actions": model.actions().names(),
            "activation": model.activation(),
        }));
    }

    println!("model: {}", model.id());
    print_table(
        &["HOST", "SITE", "TYPE", "PUBLIC IP", "COMPONENTS", "TAGS"],
        rows.iter()
            .map(|r| {
                vec![
                    r.key.clone(),
                    cell(r.site.as_deref()),
                    cell(r.instance_type.as_deref()),
                    cell(r.public_ip.as_deref()),
                    r.components.join(","),
                    r.tags.join(","),
                ]
            })
            .collect(),
    );
    let actions = model.actions().names();
    if !actions.is_empty() {
        println!();
        println!("actions: {}", actions.join(", "));
        if !model.activation().is_empty() {
            println!("activation: {}", model.activation().join(" -> "));
        }
    }
    Ok(())
}
