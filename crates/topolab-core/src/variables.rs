//! Hierarchical variables and scopes.
//!
//! A [`Variables`] bag is a YAML mapping addressed with dot-delimited paths
//! (`credentials.ssh.username`). Scopes nest model → region → host →
//! component; [`Variables::merged_over`] produces the effective view where the
//! inner scope wins.

use crate::error::{LabError, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(Mapping);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_mapping(mapping: Mapping) -> Self {
        Self(mapping)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.0
    }

    /// Look up a dot-delimited path. Returns `None` when any segment is
    /// missing or an intermediate value is not a mapping.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for seg in segments {
            current = current.as_mapping()?.get(seg)?;
        }
        Some(current)
    }

    /// Scalar lookup rendered as a string. Mappings, sequences and nulls are
    /// not strings and yield `None`.
    pub fn get_str(&self, path: &str) -> Option<String> {
        self.get(path).and_then(scalar_to_string)
    }

    /// Required lookup. A missing path is a fatal configuration error naming
    /// both the path and the scope it was looked up in.
    pub fn must_get(&self, path: &str, scope: &str) -> Result<&Value> {
        self.get(path).ok_or_else(|| LabError::MissingVariable {
            path: path.to_string(),
            scope: scope.to_string(),
        })
    }

    pub fn must_str(&self, path: &str, scope: &str) -> Result<String> {
        self.get_str(path).ok_or_else(|| LabError::MissingVariable {
            path: path.to_string(),
            scope: scope.to_string(),
        })
    }

    /// Set a dot-delimited path, creating intermediate mappings. A scalar
    /// sitting where a mapping is needed is replaced.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let segments: Vec<&str> = path.split('.').collect();
        set_in(&mut self.0, &segments, value.into());
    }

    /// Effective variables for a child scope: `self` deep-merged over
    /// `parent`, with `self` winning on every conflicting leaf.
    pub fn merged_over(&self, parent: &Variables) -> Variables {
        let mut out = parent.0.clone();
        merge_into(&mut out, &self.0);
        Variables(out)
    }

    /// Merge `other` into `self` in place, `other` winning.
    pub fn extend(&mut self, other: &Variables) {
        merge_into(&mut self.0, &other.0);
    }

    /// Flattened `(path, value)` pairs for display, in declaration order.
    pub fn flatten(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        flatten_into(&self.0, "", &mut out);
        out
    }
}

pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn set_in(map: &mut Mapping, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let key = Value::String((*head).to_string());
    if rest.is_empty() {
        map.insert(key, value);
        return;
    }
    if !matches!(map.get(&key), Some(Value::Mapping(_))) {
        map.insert(key.clone(), Value::Mapping(Mapping::new()));
    }
    if let Some(Value::Mapping(child)) = map.get_mut(&key) {
        set_in(child, rest, value);
    }
}

fn merge_into(base: &mut Mapping, over: &Mapping) {
    for (k, v) in over {
        match (base.get_mut(k), v) {
            (Some(Value::Mapping(b)), Value::Mapping(o)) => merge_into(b, o),
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

fn flatten_into(map: &Mapping, prefix: &str, out: &mut Vec<(String, String)>) {
    for (k, v) in map {
        let Some(k) = k.as_str() else { continue };
        let path = if prefix.is_empty() {
            k.to_string()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Mapping(child) => flatten_into(child, &path, out),
            other => {
                let rendered = scalar_to_string(other)
                    .unwrap_or_else(|| serde_yaml::to_string(other).unwrap_or_default());
                out.push((path, rendered.trim_end().to_string()));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Variables plus the tags used for `#tag` selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Scope {
    pub fn with_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            variables: Variables::new(),
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(yaml: &str) -> Variables {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn get_walks_dot_paths() {
        let v = vars("credentials:\n  ssh:\n    username: ubuntu\n");
        assert_eq!(v.get_str("credentials.ssh.username").as_deref(), Some("ubuntu"));
        assert!(v.get("credentials.edge.username").is_none());
        assert!(v.get("credentials.ssh.username.deeper").is_none());
    }

    #[test]
    fn get_str_renders_scalars_only() {
        let v = vars("port: 8500\nenabled: true\nnested:\n  a: 1\n");
        assert_eq!(v.get_str("port").as_deref(), Some("8500"));
        assert_eq!(v.get_str("enabled").as_deref(), Some("true"));
        assert!(v.get_str("nested").is_none());
    }

    #[test]
    fn must_get_names_path_and_scope() {
        let v = Variables::new();
        let err = v.must_str("ziti_version", "us-east-1/ctrl1").unwrap_err();
        match err {
            LabError::MissingVariable { path, scope } => {
                assert_eq!(path, "ziti_version");
                assert_eq!(scope, "us-east-1/ctrl1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn set_creates_intermediate_mappings() {
        let mut v = Variables::new();
        v.set("credentials.ssh.key_path", "/tmp/key");
        assert_eq!(v.get_str("credentials.ssh.key_path").as_deref(), Some("/tmp/key"));
    }

    #[test]
    fn set_replaces_scalar_intermediate() {
        let mut v = vars("credentials: none\n");
        v.set("credentials.ssh.username", "admin");
        assert_eq!(v.get_str("credentials.ssh.username").as_deref(), Some("admin"));
    }

    #[test]
    fn merged_over_child_wins_and_keeps_siblings() {
        let parent = vars("credentials:\n  ssh:\n    username: ubuntu\n  edge:\n    username: admin\n");
        let child = vars("credentials:\n  ssh:\n    username: root\n");
        let merged = child.merged_over(&parent);
        assert_eq!(merged.get_str("credentials.ssh.username").as_deref(), Some("root"));
        assert_eq!(merged.get_str("credentials.edge.username").as_deref(), Some("admin"));
    }

    #[test]
    fn flatten_lists_leaf_paths_in_order() {
        let v = vars("b: 1\na:\n  x: y\n");
        let flat = v.flatten();
        assert_eq!(
            flat,
            vec![("b".to_string(), "1".to_string()), ("a.x".to_string(), "y".to_string())]
        );
    }

    #[test]
    fn scope_has_tag() {
        let s = Scope::with_tags(["ctrl", "spiffe:controller"]);
        assert!(s.has_tag("ctrl"));
        assert!(!s.has_tag("edge-router"));
    }
}
