//! `${path}` expansion against a variable scope.
//!
//! Used for component config templates, kit source paths and exec commands.
//! Every placeholder must resolve; a missing one fails with the first
//! unresolved path rather than rendering a half-filled file.

use crate::error::{LabError, Result};
use crate::variables::Variables;
use regex::{Captures, Regex};
use std::sync::OnceLock;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_][A-Za-z0-9_.\-]*)\}").unwrap())
}

/// Placeholder paths in first-occurrence order, without duplicates.
pub fn placeholders(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cap in placeholder_re().captures_iter(text) {
        let path = cap[1].to_string();
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

pub fn expand(text: &str, vars: &Variables, scope: &str) -> Result<String> {
    let mut missing: Option<String> = None;
    let rendered = placeholder_re().replace_all(text, |cap: &Captures<'_>| {
        let path = &cap[1];
        match vars.get_str(path) {
            Some(value) => value,
            None => {
                missing.get_or_insert_with(|| path.to_string());
                String::new()
            }
        }
    });
    if let Some(path) = missing {
        return Err(LabError::MissingVariable {
            path,
            scope: scope.to_string(),
        });
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.set("host.public_ip", "10.0.0.1");
        v.set("component.id", "ctrl1");
        v.set("ctrl.port", 6262);
        v
    }

    #[test]
    fn expands_nested_paths() {
        let out = expand(
            "id: ${component.id}\nlisten: ${host.public_ip}:${ctrl.port}\n",
            &vars(),
            "us-east-1/ctrl1",
        )
        .unwrap();
        assert_eq!(out, "id: ctrl1\nlisten: 10.0.0.1:6262\n");
    }

    #[test]
    fn missing_placeholder_names_first_path() {
        let err = expand("${component.id} ${nope.one} ${nope.two}", &vars(), "r/h").unwrap_err();
        assert!(matches!(
            err,
            LabError::MissingVariable { ref path, ref scope } if path == "nope.one" && scope == "r/h"
        ));
    }

    #[test]
    fn text_without_placeholders_is_unchanged() {
        let text = "plain $HOME and {braces}";
        assert_eq!(expand(text, &Variables::new(), "x").unwrap(), text);
    }

    #[test]
    fn placeholders_are_deduplicated_in_order() {
        assert_eq!(
            placeholders("${b} ${a} ${b}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }
}
