//! Environment lookup behind a trait so runs can be driven from a fixed map
//! in tests instead of the process environment.

use std::collections::HashMap;

pub trait EnvSource: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The real process environment. Unset and non-UTF-8 values read as `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapEnv(HashMap<String, String>);

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl EnvSource for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_env_lookup() {
        let env = MapEnv::new().with("BUILD_NUMBER", "42");
        assert_eq!(env.var("BUILD_NUMBER").as_deref(), Some("42"));
        assert!(env.var("ELASTIC_ENDPOINT").is_none());
    }

    #[test]
    fn map_env_from_iter() {
        let env: MapEnv = [("A", "1"), ("B", "")].into_iter().collect();
        assert_eq!(env.var("B").as_deref(), Some(""));
    }
}
