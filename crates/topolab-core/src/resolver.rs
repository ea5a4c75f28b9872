//! Per-host placeholder substitution for distributed data.
//!
//! A [`Replacements`] set is an ordered list of `(token, resolver)` pairs.
//! Rendering is a literal token replace, not a template language: the input
//! is scanned once left to right and at each position the longest matching
//! token wins. Resolver output is never rescanned, so a value containing
//! another token's text is copied through verbatim, and a token that is a
//! prefix of another (`${host}` vs `${host_port}`) cannot shadow it.

use crate::env::EnvSource;
use crate::error::{LabError, Result};
use crate::topology::HostView;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Produces the replacement text for one host. Implementations must depend
/// only on the host they are given.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &HostView) -> Result<String>;
}

impl<F> Resolver for F
where
    F: Fn(&HostView) -> Result<String> + Send + Sync,
{
    fn resolve(&self, host: &HostView) -> Result<String> {
        self(host)
    }
}

#[derive(Debug, Clone)]
pub struct Literal(pub String);

impl Resolver for Literal {
    fn resolve(&self, _host: &HostView) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Environment value captured when the stage is built. Missing without a
/// default is an error naming the variable; a default (possibly empty) is
/// used verbatim.
#[derive(Debug, Clone)]
pub struct EnvValue {
    pub name: String,
    pub value: Option<String>,
    pub default: Option<String>,
}

impl Resolver for EnvValue {
    fn resolve(&self, _host: &HostView) -> Result<String> {
        self.value
            .clone()
            .or_else(|| self.default.clone())
            .ok_or_else(|| LabError::MissingEnv(self.name.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublicIp;

impl Resolver for PublicIp {
    fn resolve(&self, host: &HostView) -> Result<String> {
        host.public_ip().map(str::to_string)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HostId;

impl Resolver for HostId {
    fn resolve(&self, host: &HostView) -> Result<String> {
        Ok(host.id.clone())
    }
}

/// Required host-scoped variable.
#[derive(Debug, Clone)]
pub struct HostVariable {
    pub path: String,
    pub default: Option<String>,
}

impl Resolver for HostVariable {
    fn resolve(&self, host: &HostView) -> Result<String> {
        match (&self.default, host.var(&self.path)) {
            (_, Some(v)) => Ok(v),
            (Some(d), None) => Ok(d.clone()),
            (None, None) => host.must_str(&self.path),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolverSpec (declarative form used in model files)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ResolverSpec {
    Literal {
        value: String,
    },
    Env {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    PublicIp,
    HostId,
    Variable {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
}

impl ResolverSpec {
    pub fn build(&self, env: &dyn EnvSource) -> Box<dyn Resolver> {
        match self {
            ResolverSpec::Literal { value } => Box::new(Literal(value.clone())),
            ResolverSpec::Env { name, default } => Box::new(EnvValue {
                name: name.clone(),
                value: env.var(name),
                default: default.clone(),
            }),
            ResolverSpec::PublicIp => Box::new(PublicIp),
            ResolverSpec::HostId => Box::new(HostId),
            ResolverSpec::Variable { path, default } => Box::new(HostVariable {
                path: path.clone(),
                default: default.clone(),
            }),
        }
    }

    /// Environment variable this resolver cannot do without, if any.
    pub fn required_env(&self) -> Option<&str> {
        match self {
            ResolverSpec::Env {
                name,
                default: None,
            } => Some(name),
            _ => None,
        }
    }

    /// Variable path this resolver cannot do without, if any.
    pub fn required_variable(&self) -> Option<&str> {
        match self {
            ResolverSpec::Variable {
                path,
                default: None,
            } => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementSpec {
    pub token: String,
    #[serde(flatten)]
    pub resolver: ResolverSpec,
}

// ---------------------------------------------------------------------------
// Replacements
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Replacements {
    /// Sorted by token length, longest first; ties keep insertion order.
    entries: Vec<(String, Box<dyn Resolver>)>,
}

impl Replacements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: &[ReplacementSpec], env: &dyn EnvSource) -> Self {
        specs.iter().fold(Self::new(), |set, spec| {
            set.with_boxed(spec.token.clone(), spec.resolver.build(env))
        })
    }

    pub fn with(self, token: impl Into<String>, resolver: impl Resolver + 'static) -> Self {
        self.with_boxed(token.into(), Box::new(resolver))
    }

    /// Adding a token that is already present replaces its resolver.
    pub fn with_boxed(mut self, token: String, resolver: Box<dyn Resolver>) -> Self {
        self.entries.retain(|(t, _)| *t != token);
        let pos = self
            .entries
            .iter()
            .position(|(t, _)| t.len() < token.len())
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, (token, resolver));
        self
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(t, _)| t.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render `template` for one host. Resolvers run at most once per render
    /// and only for tokens that actually occur in the template.
    pub fn render(&self, template: &str, host: &HostView) -> Result<String> {
        let mut cache: Vec<Option<String>> = vec![None; self.entries.len()];
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        'scan: while !rest.is_empty() {
            for (idx, (token, resolver)) in self.entries.iter().enumerate() {
                if token.is_empty() || !rest.starts_with(token.as_str()) {
                    continue;
                }
                if cache[idx].is_none() {
                    cache[idx] = Some(resolver.resolve(host)?);
                }
                if let Some(value) = &cache[idx] {
                    out.push_str(value);
                }
                rest = &rest[token.len()..];
                continue 'scan;
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }

        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use crate::variables::Variables;

    fn host(id: &str, ip: &str) -> HostView {
        HostView {
            key: format!("us-east-1/{id}"),
            id: id.to_string(),
            region: "us-east-1".into(),
            site: None,
            instance_type: None,
            public_ip: Some(ip.to_string()),
            tags: vec![],
            variables: Variables::new(),
        }
    }

    #[test]
    fn per_host_render_never_swaps_values() {
        let set = Replacements::new()
            .with("${user}", Literal("admin".into()))
            .with("${host}", PublicIp);
        let a = host("h1", "10.0.0.1");
        let b = host("h2", "10.0.0.2");
        let template = "user=${user} host=${host}";

        assert_eq!(set.render(template, &a).unwrap(), "user=admin host=10.0.0.1");
        assert_eq!(set.render(template, &b).unwrap(), "user=admin host=10.0.0.2");
        // Interleaving renders must not leak state between hosts.
        assert_eq!(set.render(template, &a).unwrap(), "user=admin host=10.0.0.1");
    }

    #[test]
    fn longer_token_wins_over_its_prefix() {
        let set = Replacements::new()
            .with("${host}", Literal("H".into()))
            .with("${host}_port}", Literal("P".into()));
        let h = host("h1", "10.0.0.1");
        assert_eq!(set.render("${host}_port} ${host}", &h).unwrap(), "P H");
        let tokens: Vec<&str> = set.tokens().collect();
        assert_eq!(tokens, vec!["${host}_port}", "${host}"]);
    }

    #[test]
    fn resolver_output_is_not_rescanned() {
        let set = Replacements::new()
            .with("${a}", Literal("${b}".into()))
            .with("${b}", Literal("B".into()));
        let h = host("h1", "10.0.0.1");
        assert_eq!(set.render("${a}|${b}", &h).unwrap(), "${b}|B");
    }

    #[test]
    fn closure_resolvers_see_only_their_host() {
        let set = Replacements::new().with("@id@", |h: &HostView| -> Result<String> { Ok(h.id.to_uppercase()) });
        assert_eq!(set.render("x=@id@", &host("ctrl1", "1.1.1.1")).unwrap(), "x=CTRL1");
        assert_eq!(set.render("x=@id@", &host("ctrl2", "1.1.1.2")).unwrap(), "x=CTRL2");
    }

    #[test]
    fn missing_env_fails_loudly_unless_defaulted() {
        let env = MapEnv::new();
        let specs = vec![ReplacementSpec {
            token: "${password}".into(),
            resolver: ResolverSpec::Env {
                name: "ELASTIC_PASSWORD".into(),
                default: None,
            },
        }];
        let set = Replacements::from_specs(&specs, &env);
        let err = set.render("p=${password}", &host("h", "1.1.1.1")).unwrap_err();
        assert!(matches!(err, LabError::MissingEnv(n) if n == "ELASTIC_PASSWORD"));

        let specs = vec![ReplacementSpec {
            token: "${password}".into(),
            resolver: ResolverSpec::Env {
                name: "ELASTIC_PASSWORD".into(),
                default: Some(String::new()),
            },
        }];
        let set = Replacements::from_specs(&specs, &env);
        assert_eq!(set.render("p=${password}", &host("h", "1.1.1.1")).unwrap(), "p=");
    }

    #[test]
    fn unused_tokens_are_not_resolved() {
        let set = Replacements::new().with("${ziti_version}", HostVariable {
            path: "ziti_version".into(),
            default: None,
        });
        let h = host("h1", "10.0.0.1");
        assert_eq!(set.render("no tokens here", &h).unwrap(), "no tokens here");
        assert!(matches!(
            set.render("v=${ziti_version}", &h),
            Err(LabError::MissingVariable { path, .. }) if path == "ziti_version"
        ));
    }

    #[test]
    fn adding_same_token_replaces_resolver() {
        let set = Replacements::new()
            .with("${x}", Literal("1".into()))
            .with("${x}", Literal("2".into()));
        assert_eq!(set.len(), 1);
        assert_eq!(set.render("${x}", &host("h", "1.1.1.1")).unwrap(), "2");
    }

    #[test]
    fn multibyte_text_passes_through() {
        let set = Replacements::new().with("${ip}", PublicIp);
        assert_eq!(
            set.render("héllo ${ip} ✓", &host("h", "10.0.0.9")).unwrap(),
            "héllo 10.0.0.9 ✓"
        );
    }

    #[test]
    fn resolver_spec_yaml_shape() {
        let yaml = "token: \"${host}\"\nfrom: env\nname: ELASTIC_ENDPOINT\n";
        let spec: ReplacementSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.resolver.required_env(), Some("ELASTIC_ENDPOINT"));

        let yaml = "token: \"${public_ip}\"\nfrom: public_ip\n";
        let spec: ReplacementSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.resolver, ResolverSpec::PublicIp);
    }
}
