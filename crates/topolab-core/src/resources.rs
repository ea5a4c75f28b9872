//! Config resource bundle: named template files keyed by relative path.

use crate::error::{LabError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

pub trait ResourceBundle: Send + Sync {
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read_file(path)?;
        String::from_utf8(bytes)
            .map_err(|_| LabError::InvalidModel(format!("resource '{path}' is not valid UTF-8")))
    }
}

/// Resources served from a directory on disk (usually `configs/` next to the
/// model file). Paths may not escape the directory.
#[derive(Debug, Clone)]
pub struct DirResources {
    root: PathBuf,
}

impl DirResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceBundle for DirResources {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(LabError::ResourceNotFound(path.to_string()));
        }
        match std::fs::read(self.root.join(rel)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LabError::ResourceNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryResources(HashMap<String, Vec<u8>>);

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.0.insert(path.into(), data.into());
        self
    }
}

impl ResourceBundle for MemoryResources {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.0
            .get(path)
            .cloned()
            .ok_or_else(|| LabError::ResourceNotFound(path.to_string()))
    }
}
