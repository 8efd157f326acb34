//! Annotation engine.
//!
//! Every supported annotation has one [`Processor`] that reads its value and
//! updates a configuration fragment. Values are looked up in the ingress,
//! then the service, then the main config map annotations, and finally in
//! the built-in defaults. A processor failing on one annotation is logged
//! and the other annotations still apply.

mod backend;
mod frontend;
mod global;
mod parse;

pub use backend::{BACKEND_PROCESSORS, BackendModel, CertRequest, backend_model};
pub use frontend::{
    FRONTEND_PROCESSORS, FrontendRules, apply_frontend_cr, bind_from_cr, frontend_from_cr,
    frontend_rules,
};
pub use global::{
    DEFAULTS_PROCESSORS, GLOBAL_PROCESSORS, GlobalSection, defaults_from_cr, global_from_cr,
    quote_log_format,
};
pub use parse::{
    lines, parse_addresses, parse_bool, parse_duration, parse_k8s_path, parse_number, parse_size,
};

use crate::store::{Annotations, Ingress, K8s, StoreError};
use haproxy_ingress_api::constants::ANNOTATION_PREFIXES;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("invalid boolean '{0}'")]
    InvalidBool(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("invalid size '{0}'")]
    InvalidSize(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid IP address or network '{0}'")]
    InvalidAddress(String),
    #[error("invalid reference '{0}', expected 'name' or 'namespace/name'")]
    InvalidReference(String),
    #[error("{0}")]
    Invalid(String),
    #[error("config snippets are disabled in this scope")]
    SnippetDisabled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AnnotationError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

const DEFAULT_VALUES: &[(&str, &str)] = &[
    ("auth-realm", "Protected Content"),
    ("check", "true"),
    ("cookie-indirect", "true"),
    ("cookie-nocache", "true"),
    ("cookie-type", "insert"),
    ("cors-allow-headers", "*"),
    ("cors-allow-methods", "*"),
    ("cors-allow-origin", "*"),
    ("cors-max-age", "5s"),
    ("client-crt-optional", "false"),
    ("forwarded-for", "true"),
    ("load-balance", "roundrobin"),
    ("rate-limit-period", "1s"),
    ("rate-limit-size", "100k"),
    ("rate-limit-status-code", "403"),
    ("request-capture-len", "128"),
    ("request-redirect-code", "302"),
    ("scale-server-slots", "42"),
    ("server-ssl", "false"),
    ("ssl-passthrough", "false"),
    ("ssl-redirect-code", "302"),
    ("ssl-redirect-port", "8443"),
    ("tls-alpn", "h2,http/1.1"),
    ("clean-certs", "true"),
    ("path-regex", "false"),
    ("standalone-backend", "false"),
    ("client-strict-sni", "false"),
];

/// Former names still honoured.
const ALIASES: &[(&str, &[&str])] = &[
    ("allow-list", &["whitelist"]),
    ("deny-list", &["blacklist"]),
    ("check-interval", &["check-inter"]),
    ("send-proxy-protocol", &["send-proxy"]),
    ("scale-server-slots", &["servers-increment", "server-slots"]),
    ("server-ca", &["ca.crt"]),
    ("server-crt", &["crt"]),
    ("server-proto", &["proto"]),
];

pub fn default_value(name: &str) -> Option<&'static str> {
    DEFAULT_VALUES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| *value)
}

fn candidate_keys(name: &str) -> Vec<String> {
    let aliases = ALIASES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, aliases)| *aliases)
        .unwrap_or_default();
    std::iter::once(name)
        .chain(aliases.iter().copied())
        .flat_map(|key| {
            std::iter::once(key.to_string()).chain(
                ANNOTATION_PREFIXES
                    .iter()
                    .map(move |prefix| format!("{prefix}{key}")),
            )
        })
        .collect()
}

/// Annotation sources of one object, most specific first.
#[derive(Debug, Clone, Default)]
pub struct Values<'a> {
    sources: Vec<&'a Annotations>,
}

impl<'a> Values<'a> {
    pub fn new(sources: impl IntoIterator<Item = &'a Annotations>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
        }
    }

    /// First non-empty value set on an object, ignoring built-in defaults.
    pub fn explicit(&self, name: &str) -> Option<&'a str> {
        let keys = candidate_keys(name);
        self.sources.iter().copied().find_map(|annotations| {
            keys.iter()
                .filter_map(|key| annotations.get(key))
                .map(|value| value.trim())
                .find(|value| !value.is_empty())
        })
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.explicit(name).or_else(|| default_value(name))
    }

    pub fn bool(&self, name: &str) -> Result<Option<bool>, AnnotationError> {
        self.get(name).map(parse_bool).transpose()
    }

    pub fn duration(&self, name: &str) -> Result<Option<u64>, AnnotationError> {
        self.get(name).map(parse_duration).transpose()
    }

    pub fn size(&self, name: &str) -> Result<Option<u64>, AnnotationError> {
        self.get(name).map(parse_size).transpose()
    }

    pub fn number<T: FromStr>(&self, name: &str) -> Result<Option<T>, AnnotationError> {
        self.get(name).map(parse_number).transpose()
    }
}

/// Scopes in which config snippets are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisabledSnippets {
    pub global: bool,
    pub frontend: bool,
    pub backend: bool,
}

impl FromStr for DisabledSnippets {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut disabled = Self::default();
        for scope in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match scope {
                "all" => {
                    disabled = Self {
                        global: true,
                        frontend: true,
                        backend: true,
                    };
                }
                "global" => disabled.global = true,
                "frontend" => disabled.frontend = true,
                "backend" => disabled.backend = true,
                other => {
                    return Err(AnnotationError::invalid(format!(
                        "unknown config snippet scope '{other}'"
                    )));
                }
            }
        }
        Ok(disabled)
    }
}

/// Controller wide inputs of the annotation processors.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub maps_dir: PathBuf,
    pub patterns_dir: PathBuf,
    pub disabled_snippets: DisabledSnippets,
}

/// What processors may look at besides the annotation values.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub store: &'a K8s,
    /// Namespace of the annotated object.
    pub namespace: &'a str,
    pub ingress: Option<&'a Ingress>,
    pub maps_dir: &'a Path,
    pub patterns_dir: &'a Path,
    pub disabled_snippets: DisabledSnippets,
}

impl<'a> Context<'a> {
    pub fn new(
        store: &'a K8s,
        namespace: &'a str,
        ingress: Option<&'a Ingress>,
        settings: &'a Settings,
    ) -> Self {
        Self {
            store,
            namespace,
            ingress,
            maps_dir: &settings.maps_dir,
            patterns_dir: &settings.patterns_dir,
            disabled_snippets: settings.disabled_snippets,
        }
    }

    /// Path of a `patterns/<name>` reference, if `value` is one.
    pub fn pattern_file(&self, value: &str) -> Option<PathBuf> {
        value
            .trim()
            .strip_prefix("patterns/")
            .filter(|name| !name.is_empty())
            .map(|name| self.patterns_dir.join(name))
    }

    pub fn map_file(&self, name: &str) -> PathBuf {
        self.maps_dir.join(format!("{name}.map"))
    }
}

pub type Apply<T> =
    fn(&mut T, &'static str, &Values<'_>, &Context<'_>) -> Result<(), AnnotationError>;

/// One annotation and the function applying it to a `T`.
pub struct Processor<T: 'static> {
    name: &'static str,
    apply: Apply<T>,
}

impl<T> Processor<T> {
    pub const fn new(name: &'static str, apply: Apply<T>) -> Self {
        Self { name, apply }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn apply(
        &self,
        target: &mut T,
        values: &Values<'_>,
        ctx: &Context<'_>,
    ) -> Result<(), AnnotationError> {
        (self.apply)(target, self.name, values, ctx)
    }
}

/// Runs `processors` in order over `target`. `owner` names the annotated
/// object in warnings.
pub fn process<T>(
    processors: &[Processor<T>],
    target: &mut T,
    values: &Values<'_>,
    ctx: &Context<'_>,
    owner: &str,
) {
    for processor in processors {
        if let Err(err) = processor.apply(target, values, ctx) {
            warn!("{owner}: annotation '{}': {err}", processor.name());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::StoreParams;
    use rstest::rstest;

    pub(crate) fn annotations(pairs: &[(&str, &str)]) -> Annotations {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect()
    }

    pub(crate) fn context<'a>(store: &'a K8s, ingress: Option<&'a Ingress>) -> Context<'a> {
        Context {
            store,
            namespace: "default",
            ingress,
            maps_dir: Path::new("/etc/haproxy/maps"),
            patterns_dir: Path::new("/etc/haproxy/patterns"),
            disabled_snippets: DisabledSnippets::default(),
        }
    }

    #[test]
    fn test_lookup_order() {
        let ingress = annotations(&[("ssl-redirect-code", "301")]);
        let service = annotations(&[("haproxy.org/ssl-redirect-code", "308"), ("check", "")]);
        let config_map = annotations(&[("check", "false"), ("load-balance", "leastconn")]);
        let values = Values::new([&ingress, &service, &config_map]);

        assert_eq!(values.get("ssl-redirect-code"), Some("301"));
        assert_eq!(values.get("check"), Some("false"));
        assert_eq!(values.get("load-balance"), Some("leastconn"));
        assert_eq!(values.get("rate-limit-period"), Some("1s"));
        assert_eq!(values.explicit("rate-limit-period"), None);
        assert_eq!(values.get("unknown"), None);
    }

    #[rstest]
    #[case("whitelist")]
    #[case("haproxy.org/whitelist")]
    #[case("ingress.kubernetes.io/allow-list")]
    #[case("haproxy.com/allow-list")]
    fn test_prefixes_and_aliases(#[case] key: &str) {
        let ingress = annotations(&[(key, "10.0.0.1")]);
        let values = Values::new([&ingress]);
        assert_eq!(values.explicit("allow-list"), Some("10.0.0.1"));
    }

    #[test]
    fn test_typed_getters() {
        let ingress = annotations(&[
            ("rate-limit-size", "1m"),
            ("timeout-check", "5s"),
            ("check", "maybe"),
        ]);
        let values = Values::new([&ingress]);
        assert_eq!(values.size("rate-limit-size"), Ok(Some(1_048_576)));
        assert_eq!(values.duration("timeout-check"), Ok(Some(5_000)));
        assert_eq!(values.duration("timeout-server"), Ok(None));
        assert_eq!(values.number::<u16>("ssl-redirect-port"), Ok(Some(8443)));
        assert!(values.bool("check").is_err());
    }

    #[rstest]
    #[case("", DisabledSnippets::default())]
    #[case("all", DisabledSnippets { global: true, frontend: true, backend: true })]
    #[case("global,backend", DisabledSnippets { global: true, frontend: false, backend: true })]
    fn test_disabled_snippets(#[case] input: &str, #[case] expected: DisabledSnippets) {
        assert_eq!(input.parse::<DisabledSnippets>(), Ok(expected));
    }

    #[test]
    fn test_disabled_snippets_rejects_unknown_scope() {
        assert!("defaults".parse::<DisabledSnippets>().is_err());
    }

    #[test]
    fn test_pattern_file() {
        let store = K8s::new(StoreParams::default());
        let ctx = context(&store, None);
        assert_eq!(
            ctx.pattern_file("patterns/trusted"),
            Some(PathBuf::from("/etc/haproxy/patterns/trusted"))
        );
        assert_eq!(ctx.pattern_file("10.0.0.1"), None);
        assert_eq!(ctx.pattern_file("patterns/"), None);
    }
}
