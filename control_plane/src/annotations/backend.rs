//! Processors of service backends. Values come from the ingress, the
//! service and the main config map, on top of an optional `Backend`
//! custom resource.

use super::{
    AnnotationError, Context, Processor, Values, lines, parse_bool, parse_duration,
    parse_k8s_path, parse_number,
};
use crate::store::NamespacedName;
use haproxy_ingress_api::v3::{BackendSpec, ProxyMode};
use haproxy_ingress_dataplane::certs::SecretType;
use haproxy_ingress_dataplane::models::{Acl, Backend, Balance, Cookie, HttpCheck, Mode, RuleLine};

const ALGORITHMS: [&str; 10] = [
    "roundrobin",
    "static-rr",
    "leastconn",
    "first",
    "source",
    "uri",
    "url_param",
    "hdr",
    "random",
    "rdp-cookie",
];

/// Dynamic cookie key used when none is configured.
pub const DEFAULT_DYNAMIC_COOKIE_KEY: &str = "ohph7OoGhong";

/// A certificate a backend needs written to disk before it can be
/// referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequest {
    pub kind: SecretType,
    pub secret: NamespacedName,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendModel {
    pub backend: Backend,
    pub certs: Vec<CertRequest>,
}

pub static BACKEND_PROCESSORS: [Processor<BackendModel>; 18] = [
    Processor::new("abortonclose", abortonclose),
    Processor::new("timeout-check", timeout),
    Processor::new("timeout-server", timeout),
    Processor::new("load-balance", load_balance),
    Processor::new("check", check),
    Processor::new("check-interval", check_interval),
    Processor::new("cookie-persistence", cookie_persistence),
    Processor::new("cookie-persistence-no-dynamic", cookie_persistence),
    Processor::new("pod-maxconn", pod_maxconn),
    Processor::new("send-proxy-protocol", send_proxy_protocol),
    Processor::new("server-ssl", server_ssl),
    Processor::new("server-crt", server_cert),
    Processor::new("server-ca", server_cert),
    Processor::new("server-proto", server_proto),
    Processor::new("backend-config-snippet", backend_snippet),
    Processor::new("check-http", check_http),
    Processor::new("forwarded-for", forwarded_for),
    Processor::new("dynamic-cookie-key", dynamic_cookie_key),
];

/// Backend named `name` built from the optional custom resource, then the
/// annotations.
pub fn backend_model(
    name: &str,
    mode: Mode,
    cr: Option<&BackendSpec>,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> BackendModel {
    let mut model = BackendModel {
        backend: cr.map_or_else(|| Backend::new(name, mode), |cr| from_cr(name, mode, cr)),
        certs: Vec::new(),
    };
    super::process(&BACKEND_PROCESSORS, &mut model, values, ctx, name);
    model
}

/// A `Backend` custom resource. The resource may switch an HTTP backend to
/// TCP, never the other way round.
fn from_cr(name: &str, mode: Mode, cr: &BackendSpec) -> Backend {
    let config = &cr.config;
    let mode = match (mode, config.mode) {
        (Mode::Http, Some(ProxyMode::Tcp)) => Mode::Tcp,
        (mode, _) => mode,
    };
    let mut backend = Backend::new(name, mode);
    if let Some(balance) = &config.balance {
        backend.balance = Some(match balance.algorithm.as_str() {
            "hdr" => Balance {
                param: balance.hdr_name.clone(),
                ..Balance::new("hdr")
            },
            "url_param" => Balance {
                modifiers: balance.url_param.iter().cloned().collect(),
                ..Balance::new("url_param")
            },
            algorithm => Balance::new(algorithm),
        });
    }
    backend.abortonclose = config.abortonclose.unwrap_or_default();
    backend.forwardfor = config.forwardfor.unwrap_or_default() && mode == Mode::Http;
    backend.timeouts.check = config.check_timeout;
    backend.timeouts.server = config.server_timeout;
    backend.timeouts.connect = config.connect_timeout;
    backend.maxconn = config.maxconn;
    backend.http_check = config.http_check_uri.as_ref().map(|uri| HttpCheck {
        uri: uri.clone(),
        ..HttpCheck::default()
    });
    backend.acls = cr
        .acls
        .iter()
        .map(|acl| Acl {
            name: acl.acl_name.clone(),
            criterion: acl.criterion.clone(),
            value: acl.value.clone(),
        })
        .collect();
    backend.http_request_rules = cr.http_requests.iter().map(RuleLine::new).collect();
    backend
}

fn abortonclose(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        model.backend.abortonclose = parse_bool(value)?;
    }
    Ok(())
}

fn timeout(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let value = Some(parse_duration(value)?);
    match name {
        "timeout-check" => model.backend.timeouts.check = value,
        _ => model.backend.timeouts.server = value,
    }
    Ok(())
}

/// `algorithm[(param)] [modifiers]`, with `url_param` taking its parameter
/// as the next word.
pub fn parse_balance(value: &str) -> Result<Balance, AnnotationError> {
    let mut tokens = value.split_whitespace();
    let Some(first) = tokens.next() else {
        return Err(AnnotationError::invalid("empty load-balance value"));
    };
    let (algorithm, param) = match first.split_once('(') {
        Some((algorithm, rest)) => {
            let param = rest.strip_suffix(')').filter(|p| !p.is_empty()).ok_or_else(|| {
                AnnotationError::invalid(format!("unbalanced parameter in '{first}'"))
            })?;
            (algorithm, Some(param.to_string()))
        }
        None => (first, None),
    };
    if !ALGORITHMS.contains(&algorithm) {
        return Err(AnnotationError::invalid(format!(
            "unknown balance algorithm '{algorithm}'"
        )));
    }
    if algorithm == "hdr" && param.is_none() {
        return Err(AnnotationError::invalid("hdr requires a header name"));
    }

    let mut balance = Balance {
        param,
        ..Balance::new(algorithm)
    };
    if algorithm == "url_param" {
        let url_param = tokens
            .next()
            .ok_or_else(|| AnnotationError::invalid("url_param requires a parameter"))?;
        balance.modifiers.push(url_param.to_string());
    }
    while let Some(token) = tokens.next() {
        match token {
            "whole" | "path-only" | "use_domain_only" => {
                balance.modifiers.push(token.to_string());
            }
            "len" | "depth" | "max_wait" | "check_post" => {
                let amount = tokens
                    .next()
                    .ok_or_else(|| AnnotationError::invalid(format!("'{token}' needs a value")))?;
                parse_number::<u64>(amount)?;
                balance.modifiers.push(format!("{token} {amount}"));
            }
            other => {
                return Err(AnnotationError::invalid(format!(
                    "unknown balance modifier '{other}'"
                )));
            }
        }
    }
    Ok(balance)
}

fn load_balance(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let explicit = values.explicit(name);
    if explicit.is_none() && model.backend.balance.is_some() {
        return Ok(());
    }
    if let Some(value) = explicit.or_else(|| values.get(name)) {
        model.backend.balance = Some(parse_balance(value)?);
    }
    Ok(())
}

fn check(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    model.backend.default_server.check = values.bool(name)?.unwrap_or_default();
    Ok(())
}

fn check_interval(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    model.backend.default_server.inter = values.duration(name)?;
    Ok(())
}

fn cookie_persistence(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(cookie) = values.explicit(name) else {
        return Ok(());
    };
    model.backend.cookie = Some(Cookie {
        name: cookie.to_string(),
        kind: values.get("cookie-type").unwrap_or("insert").to_string(),
        indirect: values.bool("cookie-indirect")?.unwrap_or(true),
        nocache: values.bool("cookie-nocache")?.unwrap_or(true),
        dynamic: name == "cookie-persistence",
    });
    if name == "cookie-persistence" && model.backend.dynamic_cookie_key.is_none() {
        model.backend.dynamic_cookie_key = Some(DEFAULT_DYNAMIC_COOKIE_KEY.to_string());
    }
    Ok(())
}

fn dynamic_cookie_key(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(key) = values.explicit(name) else {
        return Ok(());
    };
    if model.backend.cookie.as_ref().is_some_and(|cookie| cookie.dynamic) {
        model.backend.dynamic_cookie_key = Some(key.to_string());
    }
    Ok(())
}

/// The limit is shared between controller replicas.
fn pod_maxconn(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(maxconn) = values.number::<u64>(name)? else {
        return Ok(());
    };
    let replicas = u64::try_from(ctx.store.replica_count()).unwrap_or(1).max(1);
    model.backend.default_server.maxconn = Some((maxconn / replicas).max(1));
    Ok(())
}

fn send_proxy_protocol(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let directive = match value {
        "proxy" | "proxy-v1" => "send-proxy",
        "proxy-v2" => "send-proxy-v2",
        "proxy-v2-ssl" => "send-proxy-v2-ssl",
        "proxy-v2-ssl-cn" => "send-proxy-v2-ssl-cn",
        other => {
            return Err(AnnotationError::invalid(format!(
                "unknown proxy protocol version '{other}'"
            )));
        }
    };
    model.backend.default_server.send_proxy = Some(directive.to_string());
    Ok(())
}

fn server_ssl(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if values.bool(name)?.unwrap_or_default() {
        let server = &mut model.backend.default_server;
        server.ssl = true;
        server.verify.get_or_insert_with(|| "none".to_string());
        if model.backend.mode == Mode::Http {
            server.alpn = values.get("tls-alpn").map(str::to_string);
        }
    }
    Ok(())
}

/// `server-crt` is the client certificate presented to servers,
/// `server-ca` the authority servers are verified against.
fn server_cert(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let secret = parse_k8s_path(value, ctx.namespace)?;
    ctx.store.get_secret(&secret.namespace, &secret.name)?;
    let kind = if name == "server-ca" {
        model.backend.default_server.verify = Some("required".to_string());
        SecretType::Ca
    } else {
        SecretType::Backend
    };
    model.backend.default_server.ssl = true;
    model.certs.push(CertRequest { kind, secret });
    Ok(())
}

fn server_proto(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    match values.explicit(name) {
        None => Ok(()),
        Some(proto @ ("h1" | "h2")) => {
            model.backend.default_server.proto = Some(proto.to_string());
            Ok(())
        }
        Some(other) => Err(AnnotationError::invalid(format!(
            "unsupported server protocol '{other}'"
        ))),
    }
}

fn backend_snippet(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    if ctx.disabled_snippets.backend {
        return Err(AnnotationError::SnippetDisabled);
    }
    model.backend.config_snippets = lines(value).map(str::to_string).collect();
    Ok(())
}

/// `uri`, `method uri` or `method uri version`.
fn check_http(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    if model.backend.mode != Mode::Http {
        return Ok(());
    }
    let fields = value.split_whitespace().collect::<Vec<_>>();
    let check = match fields.as_slice() {
        [uri] => HttpCheck {
            uri: (*uri).to_string(),
            ..HttpCheck::default()
        },
        [method, uri] => HttpCheck {
            method: Some((*method).to_string()),
            uri: (*uri).to_string(),
            version: None,
        },
        [method, uri, version] => HttpCheck {
            method: Some((*method).to_string()),
            uri: (*uri).to_string(),
            version: Some((*version).to_string()),
        },
        _ => {
            return Err(AnnotationError::invalid(format!(
                "expected 'uri', 'method uri' or 'method uri version', got '{value}'"
            )));
        }
    };
    model.backend.http_check = Some(check);
    Ok(())
}

fn forwarded_for(
    model: &mut BackendModel,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if model.backend.mode != Mode::Http {
        model.backend.forwardfor = false;
        return Ok(());
    }
    if let Some(enabled) = values.bool(name)? {
        model.backend.forwardfor = enabled;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::tests::{annotations, context};
    use crate::store::{K8s, Secret, Status, StoreParams};
    use assertables::{assert_err, assert_ok};
    use haproxy_ingress_api::v3::{Balance as CrBalance, BackendConfig};
    use rstest::{fixture, rstest};
    use std::collections::BTreeMap;

    #[fixture]
    fn store() -> K8s {
        let mut store = K8s::new(StoreParams::default());
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), b"cert".to_vec());
        data.insert("tls.key".to_string(), b"key".to_vec());
        store.event_secret(Secret {
            namespace: "default".to_string(),
            name: "client".to_string(),
            data,
            status: Status::Added,
        });
        store
    }

    fn build(store: &K8s, mode: Mode, pairs: &[(&str, &str)]) -> BackendModel {
        let source = annotations(pairs);
        backend_model(
            "default_web_http",
            mode,
            None,
            &Values::new([&source]),
            &context(store, None),
        )
    }

    #[rstest]
    fn test_defaults(store: K8s) {
        let model = build(&store, Mode::Http, &[]);
        let backend = &model.backend;
        assert_eq!(backend.balance, Some(Balance::new("roundrobin")));
        assert!(backend.default_server.check);
        assert!(backend.forwardfor);
        assert!(!backend.default_server.ssl);
        assert!(backend.cookie.is_none());
        assert!(model.certs.is_empty());
    }

    #[rstest]
    fn test_tcp_backend_drops_http_options(store: K8s) {
        let model = build(
            &store,
            Mode::Tcp,
            &[("check-http", "/healthz"), ("forwarded-for", "true")],
        );
        assert!(!model.backend.forwardfor);
        assert!(model.backend.http_check.is_none());
    }

    #[rstest]
    #[case("roundrobin", "roundrobin", None, &[])]
    #[case("hdr(X-Tenant)", "hdr", Some("X-Tenant"), &[])]
    #[case("random(2)", "random", Some("2"), &[])]
    #[case("url_param userid check_post 64", "url_param", None, &["userid", "check_post 64"])]
    #[case("uri len 10 depth 2 whole path-only", "uri", None, &["len 10", "depth 2", "whole", "path-only"])]
    fn test_parse_balance(
        #[case] input: &str,
        #[case] algorithm: &str,
        #[case] param: Option<&str>,
        #[case] modifiers: &[&str],
    ) {
        let balance = assert_ok!(parse_balance(input));
        assert_eq!(balance.algorithm, algorithm);
        assert_eq!(balance.param.as_deref(), param);
        assert_eq!(balance.modifiers, modifiers);
    }

    #[rstest]
    #[case("")]
    #[case("fastest")]
    #[case("hdr")]
    #[case("hdr(X")]
    #[case("url_param")]
    #[case("uri len")]
    #[case("uri len ten")]
    #[case("uri sideways")]
    fn test_parse_balance_rejects(#[case] input: &str) {
        assert_err!(parse_balance(input));
    }

    #[rstest]
    fn test_cookie_persistence(store: K8s) {
        let model = build(&store, Mode::Http, &[("cookie-persistence", "SRV")]);
        assert_eq!(
            model.backend.cookie,
            Some(Cookie {
                name: "SRV".to_string(),
                kind: "insert".to_string(),
                indirect: true,
                nocache: true,
                dynamic: true,
            })
        );
        assert_eq!(
            model.backend.dynamic_cookie_key.as_deref(),
            Some(DEFAULT_DYNAMIC_COOKIE_KEY)
        );

        let model = build(&store, Mode::Http, &[("cookie-persistence-no-dynamic", "SRV")]);
        assert!(model.backend.cookie.is_some_and(|cookie| !cookie.dynamic));
        assert!(model.backend.dynamic_cookie_key.is_none());
    }

    #[rstest]
    fn test_pod_maxconn_is_shared_between_replicas(store: K8s) {
        let mut store = store;
        store.replicas.insert("haproxy-ingress-5d9f7c-abcde".to_string());
        store.replicas.insert("haproxy-ingress-5d9f7c-fghij".to_string());
        let model = build(&store, Mode::Http, &[("pod-maxconn", "100")]);
        assert_eq!(model.backend.default_server.maxconn, Some(50));
    }

    #[rstest]
    #[case("proxy", Some("send-proxy"))]
    #[case("proxy-v1", Some("send-proxy"))]
    #[case("proxy-v2", Some("send-proxy-v2"))]
    #[case("proxy-v2-ssl-cn", Some("send-proxy-v2-ssl-cn"))]
    #[case("proxy-v3", None)]
    fn test_send_proxy(store: K8s, #[case] value: &str, #[case] expected: Option<&str>) {
        let model = build(&store, Mode::Http, &[("send-proxy", value)]);
        assert_eq!(model.backend.default_server.send_proxy.as_deref(), expected);
    }

    #[rstest]
    fn test_server_ssl_and_certs(store: K8s) {
        let model = build(
            &store,
            Mode::Http,
            &[
                ("server-ssl", "true"),
                ("server-crt", "client"),
                ("server-ca", "default/missing"),
                ("server-proto", "h2"),
            ],
        );
        let server = &model.backend.default_server;
        assert!(server.ssl);
        assert_eq!(server.verify.as_deref(), Some("none"));
        assert_eq!(server.alpn.as_deref(), Some("h2,http/1.1"));
        assert_eq!(server.proto.as_deref(), Some("h2"));
        assert_eq!(
            model.certs,
            vec![CertRequest {
                kind: SecretType::Backend,
                secret: NamespacedName::new("default", "client"),
            }]
        );
    }

    #[rstest]
    #[case("/healthz", None, "/healthz", None)]
    #[case("HEAD /healthz", Some("HEAD"), "/healthz", None)]
    #[case("GET /healthz HTTP/1.1", Some("GET"), "/healthz", Some("HTTP/1.1"))]
    fn test_check_http(
        store: K8s,
        #[case] value: &str,
        #[case] method: Option<&str>,
        #[case] uri: &str,
        #[case] version: Option<&str>,
    ) {
        let model = build(&store, Mode::Http, &[("check-http", value)]);
        assert_eq!(
            model.backend.http_check,
            Some(HttpCheck {
                method: method.map(str::to_string),
                uri: uri.to_string(),
                version: version.map(str::to_string),
            })
        );
    }

    #[rstest]
    fn test_timeouts_and_snippet(store: K8s) {
        let model = build(
            &store,
            Mode::Http,
            &[
                ("timeout-check", "2s"),
                ("timeout-server", "1m"),
                ("check-interval", "500ms"),
                ("backend-config-snippet", "http-send-name-header x-dst-server\n"),
            ],
        );
        assert_eq!(model.backend.timeouts.check, Some(2_000));
        assert_eq!(model.backend.timeouts.server, Some(60_000));
        assert_eq!(model.backend.default_server.inter, Some(500));
        assert_eq!(
            model.backend.config_snippets,
            vec!["http-send-name-header x-dst-server"]
        );
    }

    #[rstest]
    fn test_custom_resource_then_annotations(store: K8s) {
        let cr = BackendSpec {
            config: BackendConfig {
                balance: Some(CrBalance {
                    algorithm: "hdr".to_string(),
                    hdr_name: Some("X-Tenant".to_string()),
                    url_param: None,
                }),
                abortonclose: Some(true),
                server_timeout: Some(30_000),
                ..BackendConfig::default()
            },
            acls: Vec::new(),
            http_requests: vec!["set-header X-From cr".to_string()],
        };
        let source = annotations(&[("timeout-server", "5s")]);
        let model = backend_model(
            "default_web_http",
            Mode::Http,
            Some(&cr),
            &Values::new([&source]),
            &context(&store, None),
        );
        let backend = &model.backend;
        assert_eq!(backend.balance.as_ref().map(|b| b.algorithm.as_str()), Some("hdr"));
        assert_eq!(backend.balance.as_ref().and_then(|b| b.param.as_deref()), Some("X-Tenant"));
        assert!(backend.abortonclose);
        assert_eq!(backend.timeouts.server, Some(5_000));
        assert_eq!(backend.http_request_rules, vec![RuleLine::new("set-header X-From cr")]);
    }
}
