use super::Stage;
use crate::context::RunContext;
use crate::error::{LabError, Result};
use crate::io;
use crate::template;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

/// Render every component's `config_src` template from the resource bundle
/// into `<lab>/build/hosts/<host-key>/cfg/<config_name>`.
///
/// Placeholders are `${path}` lookups in the component's effective scope,
/// which includes `host.*` and `component.*` built-ins. A placeholder with
/// no value fails the stage naming the path and the component.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderConfigs;

#[async_trait]
impl Stage for RenderConfigs {
    fn name(&self) -> &str {
        "render_configs"
    }

    fn preflight(&self, ctx: &RunContext) -> Result<()> {
        for host in ctx.model.hosts() {
            for component in &host.host.components {
                if let Some(src) = &component.config_src {
                    ctx.resources.read_file(src)?;
                }
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let mut rendered = 0;
        for host in ctx.model.hosts() {
            let view = ctx.model.view(host);
            for component in &host.host.components {
                let (Some(src), Some(name)) =
                    (&component.config_src, component.rendered_config_name())
                else {
                    continue;
                };
                let text = ctx.resources.read_to_string(src)?;
                let vars = view.component_variables(component);
                let scope = format!("{}/{}", view.key, component.id);
                let output = template::expand(&text, &vars, &scope)?;

                let dest = ctx.host_build_dir(&view.key).join("cfg").join(&name);
                io::atomic_write(&dest, output.as_bytes())?;
                debug!(host = %view.key, component = %component.id, dest = %dest.display(), "rendered config");
                rendered += 1;
            }
        }
        info!(rendered, "component configs rendered");
        Ok(())
    }
}

/// Stage local binaries into `<lab>/build/kit/bin`.
///
/// With a `source` directory each binary is copied from there (the path may
/// contain `${var}` placeholders resolved against model variables);
/// otherwise each one is looked up on `PATH`.
#[derive(Debug, Clone)]
pub struct Kit {
    pub source: Option<String>,
    pub binaries: Vec<String>,
}

impl Kit {
    pub fn new<I, S>(binaries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: None,
            binaries: binaries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_dir(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn locate(&self, ctx: &RunContext, binary: &str) -> Result<PathBuf> {
        match &self.source {
            Some(source) => {
                let dir = template::expand(source, ctx.model.variables(), "kit")?;
                let path = ctx.resolve_path(&PathBuf::from(dir)).join(binary);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LabError::ResourceNotFound(format!(
                        "kit binary {}",
                        path.display()
                    )))
                }
            }
            None => which::which(binary).map_err(|_| LabError::ToolMissing(binary.to_string())),
        }
    }
}

#[async_trait]
impl Stage for Kit {
    fn name(&self) -> &str {
        "kit"
    }

    fn preflight(&self, ctx: &RunContext) -> Result<()> {
        for binary in &self.binaries {
            self.locate(ctx, binary)?;
        }
        Ok(())
    }

    async fn execute(&self, ctx: &mut RunContext) -> Result<()> {
        let bin_dir = ctx.kit_dir().join("bin");
        io::ensure_dir(&bin_dir)?;
        for binary in &self.binaries {
            let from = self.locate(ctx, binary)?;
            let to = bin_dir.join(binary);
            std::fs::copy(&from, &to)?;
            io::set_mode(&to, 0o755)?;
            debug!(binary, from = %from.display(), "kitted");
        }
        info!(binaries = self.binaries.len(), kit = %bin_dir.display(), "kit staged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::resources::MemoryResources;
    use crate::topology::{Component, Host, Region};
    use std::sync::Arc;
    use tempfile::TempDir;

    const CTRL_TMPL: &str = "identity: ${component.public_identity}\nadvertise: ${host.public_ip}:${ctrl.port}\n";

    fn model() -> Model {
        Model::builder("ha")
            .variable("ctrl.port", 6262)
            .region(
                Region::new("us-east-1").host(
                    Host::new("ctrl1")
                        .public_ip("10.0.0.1")
                        .component(
                            Component::new("ctrl1")
                                .binary("ziti controller")
                                .config("ctrl.yml.tmpl", "ctrl1.yml")
                                .public_identity("ctrl1"),
                        )
                        .component(Component::new("consul").binary("consul")),
                ),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn renders_each_component_config_into_host_build_dir() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_resources(Arc::new(MemoryResources::new().with("ctrl.yml.tmpl", CTRL_TMPL)));
        RenderConfigs.preflight(&ctx).unwrap();
        RenderConfigs.execute(&mut ctx).await.unwrap();

        let out = std::fs::read_to_string(dir.path().join("build/hosts/us-east-1/ctrl1/cfg/ctrl1.yml")).unwrap();
        assert_eq!(out, "identity: ctrl1\nadvertise: 10.0.0.1:6262\n");
    }

    #[tokio::test]
    async fn missing_template_fails_preflight() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new(model(), dir.path()).unwrap();
        assert!(matches!(
            RenderConfigs.preflight(&ctx),
            Err(LabError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unresolved_placeholder_names_component() {
        let dir = TempDir::new().unwrap();
        let mut ctx = RunContext::new(model(), dir.path())
            .unwrap()
            .with_resources(Arc::new(MemoryResources::new().with("ctrl.yml.tmpl", "v: ${ziti_version}")));
        let err = RenderConfigs.execute(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err,
            LabError::MissingVariable { path, scope } if path == "ziti_version" && scope == "us-east-1/ctrl1/ctrl1"
        ));
    }

    #[tokio::test]
    async fn kit_copies_binaries_from_templated_source() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("dist/0.30.0");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("ziti"), b"elf").unwrap();

        let mut m = model();
        m.variables_mut().set("ziti_version", "0.30.0");
        let mut ctx = RunContext::new(m, dir.path().join("lab"))
            .unwrap()
            .with_base_dir(dir.path());
        let kit = Kit::new(["ziti"]).from_dir("dist/${ziti_version}");
        kit.preflight(&ctx).unwrap();
        kit.execute(&mut ctx).await.unwrap();
        assert!(dir.path().join("lab/build/kit/bin/ziti").is_file());

        let missing = Kit::new(["ziti-echo"]).from_dir("dist/${ziti_version}");
        assert!(missing.preflight(&ctx).is_err());
    }
}
