//! Processors turning ingress and config map annotations into frontend
//! rules. Related annotations (`rate-limit-*`, `cors-*`, ...) each have
//! their processor and are assembled into rules once all of them ran.

use super::{
    AnnotationError, Context, Processor, Values, lines, parse_addresses, parse_bool,
    parse_duration, parse_k8s_path, parse_number,
};
use haproxy_ingress_core::utils::content_hash;
use super::global::quote_log_format;
use haproxy_ingress_api::v3::{Bind as CrBind, FrontendConfig};
use haproxy_ingress_dataplane::models::{Backend, Bind, Frontend, Mode, StickTable};
use haproxy_ingress_dataplane::rules::{
    ReqBasicAuth, ReqCapture, ReqDeny, ReqPathRewrite, ReqRateLimit, ReqReturnStatus, ReqSetHost,
    ReqSetSrc, ReqSetVar, ReqTrack, RequestRedirect, Rule, SetHdr,
};
use std::collections::BTreeMap;

const CORS_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Rules compiled from one set of annotations, with the map files and
/// stick tables they rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrontendRules {
    pub rules: Vec<Rule>,
    /// Map files by name, one address per row.
    pub maps: Vec<(String, Vec<String>)>,
    pub tables: Vec<Backend>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RateLimit {
    requests: Option<u64>,
    period: u64,
    size: u64,
    status: u16,
    whitelist_ips: Vec<String>,
    whitelist_maps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cors {
    enabled: bool,
    /// `None` once an invalid value was given, which drops the header.
    origin: Option<String>,
    methods: Option<String>,
    headers: String,
    max_age: Option<u64>,
    credentials: bool,
    respond_to_options: bool,
}

/// Annotation values gathered before rules are built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendState {
    rules: Vec<Rule>,
    maps: Vec<(String, Vec<String>)>,
    ssl_redirect: bool,
    ssl_redirect_port: u16,
    ssl_redirect_code: u16,
    request_redirect: Option<(String, bool)>,
    request_redirect_code: u16,
    rate_limit: RateLimit,
    basic_auth: bool,
    auth_realm: String,
    auth_credentials: Option<BTreeMap<String, String>>,
    captures: Vec<String>,
    capture_len: u64,
    cors: Cors,
}

impl Default for FrontendState {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            maps: Vec::new(),
            ssl_redirect: false,
            ssl_redirect_port: 8443,
            ssl_redirect_code: 302,
            request_redirect: None,
            request_redirect_code: 302,
            rate_limit: RateLimit {
                requests: None,
                period: 1_000,
                size: 100 * 1024,
                status: 403,
                whitelist_ips: Vec::new(),
                whitelist_maps: Vec::new(),
            },
            basic_auth: false,
            auth_realm: "Protected-Content".to_string(),
            auth_credentials: None,
            captures: Vec::new(),
            capture_len: 128,
            cors: Cors {
                enabled: false,
                origin: Some("*".to_string()),
                methods: Some("*".to_string()),
                headers: "*".to_string(),
                max_age: Some(5),
                credentials: false,
                respond_to_options: false,
            },
        }
    }
}

pub static FRONTEND_PROCESSORS: [Processor<FrontendState>; 30] = [
    Processor::new("deny-list", access_list),
    Processor::new("allow-list", access_list),
    Processor::new("src-ip-header", src_ip_header),
    Processor::new("set-host", set_host),
    Processor::new("path-rewrite", path_rewrite),
    Processor::new("request-set-header", set_header),
    Processor::new("response-set-header", set_header),
    Processor::new("ssl-redirect", ssl_redirect),
    Processor::new("ssl-redirect-port", ssl_redirect_port),
    Processor::new("ssl-redirect-code", ssl_redirect_code),
    Processor::new("request-redirect", request_redirect),
    Processor::new("request-redirect-code", request_redirect_code),
    Processor::new("rate-limit-requests", rate_limit_requests),
    Processor::new("rate-limit-period", rate_limit_period),
    Processor::new("rate-limit-size", rate_limit_size),
    Processor::new("rate-limit-status-code", rate_limit_status_code),
    Processor::new("rate-limit-whitelist", rate_limit_whitelist),
    Processor::new("auth-type", auth_type),
    Processor::new("auth-realm", auth_realm),
    Processor::new("auth-secret", auth_secret),
    Processor::new("request-capture", request_capture),
    Processor::new("request-capture-len", request_capture_len),
    Processor::new("cors-enable", cors_enable),
    Processor::new("cors-allow-origin", cors_allow_origin),
    Processor::new("cors-allow-methods", cors_allow_methods),
    Processor::new("cors-allow-headers", cors_allow_headers),
    Processor::new("cors-max-age", cors_max_age),
    Processor::new("cors-allow-credentials", cors_allow_credentials),
    Processor::new("cors-respond-to-options", cors_respond_to_options),
    Processor::new("frontend-config-snippet", main_config_map_only),
];

/// Runs every frontend processor and assembles the resulting rules.
pub fn frontend_rules(values: &Values<'_>, ctx: &Context<'_>, owner: &str) -> FrontendRules {
    let mut state = FrontendState::default();
    super::process(&FRONTEND_PROCESSORS, &mut state, values, ctx, owner);
    state.finish(ctx)
}

impl FrontendState {
    fn finish(self, ctx: &Context<'_>) -> FrontendRules {
        let Self {
            mut rules,
            maps,
            ssl_redirect,
            ssl_redirect_port,
            ssl_redirect_code,
            request_redirect,
            request_redirect_code,
            rate_limit,
            basic_auth,
            auth_realm,
            auth_credentials,
            captures,
            capture_len,
            cors,
        } = self;
        let mut tables = Vec::new();

        if ssl_redirect {
            rules.push(Rule::from(RequestRedirect {
                host: String::new(),
                redirect_code: ssl_redirect_code,
                redirect_port: ssl_redirect_port,
                ssl_request: false,
                ssl_redirect: true,
            }));
        }
        if let Some((host, ssl_request)) = request_redirect {
            rules.push(Rule::from(RequestRedirect {
                host,
                redirect_code: request_redirect_code,
                redirect_port: 0,
                ssl_request,
                ssl_redirect: false,
            }));
        }

        if let Some(requests) = rate_limit.requests {
            let table_name = format!("RateLimit-{}", rate_limit.period);
            rules.push(Rule::from(ReqTrack {
                table_name: table_name.clone(),
                track_key: "src".to_string(),
            }));
            rules.push(Rule::from(ReqRateLimit {
                table_name: table_name.clone(),
                reqs_limit: requests,
                deny_status_code: Some(rate_limit.status),
                whitelist_ips: rate_limit.whitelist_ips,
                whitelist_maps: rate_limit.whitelist_maps,
            }));
            tables.push(Backend {
                stick_table: Some(StickTable {
                    kind: "ip".to_string(),
                    size: rate_limit.size,
                    expire: rate_limit.period,
                    store: format!("http_req_rate({})", rate_limit.period),
                    peers: None,
                }),
                ..Backend::new(table_name, Mode::Http)
            });
        }

        if basic_auth {
            if let Some(credentials) = auth_credentials {
                let auth_group = ctx.ingress.map_or_else(
                    || "Global".to_string(),
                    |ingress| format!("{}-{}", ingress.namespace, ingress.name),
                );
                rules.push(Rule::from(ReqBasicAuth {
                    auth_group,
                    auth_realm,
                    credentials,
                }));
            }
        }

        for expression in captures {
            rules.push(Rule::from(ReqCapture {
                expression,
                capture_len,
            }));
        }

        if cors.enabled {
            cors_rules(&mut rules, cors);
        }

        FrontendRules {
            rules,
            maps,
            tables,
        }
    }
}

fn cors_rules(rules: &mut Vec<Rule>, cors: Cors) {
    let (acl, origin) = match cors.origin.as_deref() {
        Some("*") => (
            "{ var(txn.cors_origin) -m found }".to_string(),
            Some("*".to_string()),
        ),
        Some(pattern) => (
            format!("{{ var(txn.cors_origin) -m reg {pattern} }}"),
            Some("%[var(txn.cors_origin)]".to_string()),
        ),
        None => ("{ var(txn.cors_origin) -m found }".to_string(), None),
    };
    rules.push(Rule::from(ReqSetVar {
        name: "cors_origin".to_string(),
        scope: "txn".to_string(),
        expression: "req.hdr(origin)".to_string(),
        cond_test: None,
    }));
    let header = |name: &str, format: String| {
        Rule::from(SetHdr {
            cond_test: Some(acl.clone()),
            after_response: true,
            ..SetHdr::response(name, format)
        })
    };
    if let Some(origin) = origin {
        rules.push(header("Access-Control-Allow-Origin", format!("\"{origin}\"")));
    }
    if let Some(methods) = &cors.methods {
        rules.push(header("Access-Control-Allow-Methods", format!("\"{methods}\"")));
    }
    rules.push(header(
        "Access-Control-Allow-Headers",
        format!("\"{}\"", cors.headers),
    ));
    if let Some(max_age) = cors.max_age {
        rules.push(header("Access-Control-Max-Age", format!("\"{max_age}\"")));
    }
    if cors.credentials {
        rules.push(header(
            "Access-Control-Allow-Credentials",
            "\"true\"".to_string(),
        ));
    }
    if cors.respond_to_options {
        rules.push(Rule::from(ReqReturnStatus { status_code: 204 }));
    }
}

fn access_list(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let whitelist = name == "allow-list";
    let map = match ctx.pattern_file(value) {
        Some(path) => path.display().to_string(),
        None => {
            let addresses = parse_addresses(value)?;
            if addresses.is_empty() {
                return Err(AnnotationError::invalid("empty address list"));
            }
            let prefix = if whitelist { "allowlist" } else { "denylist" };
            let map_name = format!("{prefix}-{}", content_hash(addresses.join(",")));
            let path = ctx.map_file(&map_name).display().to_string();
            state.maps.push((map_name, addresses));
            path
        }
    };
    state.rules.push(Rule::from(ReqDeny {
        src_ips_map: map,
        whitelist,
    }));
    Ok(())
}

fn src_ip_header(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(header) = values.explicit(name) {
        state.rules.push(Rule::from(ReqSetSrc {
            header_name: header.to_string(),
        }));
    }
    Ok(())
}

fn set_host(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(host) = values.explicit(name) {
        state.rules.push(Rule::from(ReqSetHost {
            host: host.to_string(),
        }));
    }
    Ok(())
}

/// `fmt` alone rewrites the whole path, `match fmt` rewrites matching paths.
fn path_rewrite(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let mut invalid = None;
    for line in lines(value) {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        let (path_match, path_fmt) = match fields.as_slice() {
            [fmt] => ("(.*)", *fmt),
            [path_match, fmt] => (*path_match, *fmt),
            _ => {
                invalid.get_or_insert_with(|| line.to_string());
                continue;
            }
        };
        state.rules.push(Rule::from(ReqPathRewrite {
            path_match: path_match.to_string(),
            path_fmt: path_fmt.to_string(),
        }));
    }
    match invalid {
        Some(line) => Err(AnnotationError::invalid(format!(
            "incorrect path rewrite '{line}'"
        ))),
        None => Ok(()),
    }
}

/// `Name value` lines of `request-set-header` and `response-set-header`.
fn set_header(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let response = name == "response-set-header";
    let mut invalid = None;
    for line in lines(value) {
        let Some((header, format)) = line
            .split_once(char::is_whitespace)
            .map(|(header, format)| (header, format.trim()))
            .filter(|(_, format)| !format.is_empty())
        else {
            invalid.get_or_insert_with(|| line.to_string());
            continue;
        };
        let rule = if response {
            SetHdr::response(header, format)
        } else {
            SetHdr::request(header, format)
        };
        state.rules.push(Rule::from(rule));
    }
    match invalid {
        Some(line) => Err(AnnotationError::invalid(format!(
            "incorrect header '{line}', expected 'Name value'"
        ))),
        None => Ok(()),
    }
}

/// Unset, the redirect is enabled for ingresses declaring TLS.
fn ssl_redirect(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    state.ssl_redirect = match values.explicit(name) {
        Some(value) => parse_bool(value)?,
        None => ctx.ingress.is_some_and(|ingress| !ingress.tls.is_empty()),
    };
    Ok(())
}

fn ssl_redirect_port(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(port) = values.number(name)? {
        state.ssl_redirect_port = port;
    }
    Ok(())
}

fn ssl_redirect_code(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(code) = values.number(name)? {
        state.ssl_redirect_code = redirect_code(code)?;
    }
    Ok(())
}

fn redirect_code(code: u16) -> Result<u16, AnnotationError> {
    match code {
        301 | 302 | 303 | 307 | 308 => Ok(code),
        _ => Err(AnnotationError::invalid(format!(
            "redirect code {code} is not one of 301, 302, 303, 307, 308"
        ))),
    }
}

fn request_redirect(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let (host, ssl) = match value.strip_prefix("https://") {
        Some(host) => (host, true),
        None => (value.strip_prefix("http://").unwrap_or(value), false),
    };
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return Err(AnnotationError::invalid(format!("no host in '{value}'")));
    }
    state.request_redirect = Some((host.to_string(), ssl));
    Ok(())
}

fn request_redirect_code(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(code) = values.number(name)? {
        state.request_redirect_code = redirect_code(code)?;
    }
    Ok(())
}

fn rate_limit_requests(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        state.rate_limit.requests = Some(parse_number(value)?);
    }
    Ok(())
}

fn rate_limit_period(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(period) = values.duration(name)? {
        if period == 0 {
            return Err(AnnotationError::invalid("rate limit period must not be zero"));
        }
        state.rate_limit.period = period;
    }
    Ok(())
}

fn rate_limit_size(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(size) = values.size(name)? {
        state.rate_limit.size = size;
    }
    Ok(())
}

fn rate_limit_status_code(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(status) = values.number::<u16>(name)? {
        if !(100..600).contains(&status) {
            return Err(AnnotationError::invalid(format!(
                "status code {status} out of range"
            )));
        }
        state.rate_limit.status = status;
    }
    Ok(())
}

/// Literal addresses and `patterns/<name>` references, comma separated.
fn rate_limit_whitelist(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let mut addresses = Vec::new();
    for item in value.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        match ctx.pattern_file(item) {
            Some(path) => state
                .rate_limit
                .whitelist_maps
                .push(path.display().to_string()),
            None => addresses.push(item),
        }
    }
    state.rate_limit.whitelist_ips = parse_addresses(&addresses.join(","))?;
    Ok(())
}

fn auth_type(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    match values.explicit(name) {
        None => Ok(()),
        Some("basic-auth") => {
            state.basic_auth = true;
            Ok(())
        }
        Some(other) => Err(AnnotationError::invalid(format!(
            "unsupported authentication type '{other}'"
        ))),
    }
}

fn auth_realm(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(realm) = values.get(name) {
        state.auth_realm = realm.replace(' ', "-");
    }
    Ok(())
}

/// Users and passwords of the referenced secret. A trailing newline left by
/// `htpasswd`-like tools is removed.
fn auth_secret(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    if !state.basic_auth {
        return Ok(());
    }
    let Some(value) = values.explicit(name) else {
        return Err(AnnotationError::invalid("basic-auth requires 'auth-secret'"));
    };
    let reference = parse_k8s_path(value, ctx.namespace)?;
    let secret = ctx
        .store
        .get_secret(&reference.namespace, &reference.name)?;
    let credentials = secret
        .data
        .iter()
        .map(|(user, password)| {
            let password = String::from_utf8_lossy(password);
            let password = password.strip_suffix('\n').unwrap_or(&password);
            (user.clone(), password.to_string())
        })
        .collect::<BTreeMap<_, _>>();
    if credentials.is_empty() {
        return Err(AnnotationError::invalid(format!(
            "secret '{reference}' has no credentials"
        )));
    }
    state.auth_credentials = Some(credentials);
    Ok(())
}

fn request_capture(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        state.captures = lines(value).map(str::to_string).collect();
    }
    Ok(())
}

fn request_capture_len(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(len) = values.number(name)? {
        state.capture_len = len;
    }
    Ok(())
}

fn cors_enable(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        state.cors.enabled = parse_bool(value)?;
    }
    Ok(())
}

fn cors_allow_origin(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(origin) = values.get(name) {
        if origin != "*" {
            if let Err(err) = regex::Regex::new(origin) {
                state.cors.origin = None;
                return Err(AnnotationError::invalid(format!(
                    "invalid origin pattern '{origin}': {err}"
                )));
            }
        }
        state.cors.origin = Some(origin.to_string());
    }
    Ok(())
}

fn cors_allow_methods(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.get(name) else {
        return Ok(());
    };
    if value == "*" {
        state.cors.methods = Some(value.to_string());
        return Ok(());
    }
    let methods = value
        .split(',')
        .map(|method| method.trim().to_ascii_uppercase())
        .filter(|method| !method.is_empty())
        .collect::<Vec<_>>();
    if let Some(unknown) = methods
        .iter()
        .find(|method| !CORS_METHODS.contains(&method.as_str()))
    {
        state.cors.methods = None;
        return Err(AnnotationError::invalid(format!(
            "unsupported HTTP method '{unknown}'"
        )));
    }
    state.cors.methods = Some(methods.join(", "));
    Ok(())
}

fn cors_allow_headers(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(headers) = values.get(name) {
        state.cors.headers = headers.split_whitespace().collect();
    }
    Ok(())
}

fn cors_max_age(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    match values.get(name) {
        None => {}
        Some("-1") => state.cors.max_age = None,
        Some(value) => state.cors.max_age = Some(parse_duration(value)? / 1_000),
    }
    Ok(())
}

fn cors_allow_credentials(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        state.cors.credentials = parse_bool(value)?;
    }
    Ok(())
}

fn cors_respond_to_options(
    state: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        state.cors.respond_to_options = parse_bool(value)?;
    }
    Ok(())
}

/// Frontend snippets are applied by the global handler from the main config
/// map; on an ingress they are only reported.
fn main_config_map_only(
    _: &mut FrontendState,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    match (ctx.ingress, values.explicit(name)) {
        (Some(_), Some(_)) => Err(AnnotationError::invalid(
            "only supported in the main config map",
        )),
        _ => Ok(()),
    }
}

/// Settings of a `Frontend` custom resource applied over an existing
/// frontend. Name, mode and binds stay controller owned.
pub fn apply_frontend_cr(frontend: &mut Frontend, config: &FrontendConfig) {
    if config.maxconn.is_some() {
        frontend.maxconn = config.maxconn;
    }
    if let Some(format) = config.log_format.as_deref().filter(|f| !f.trim().is_empty()) {
        frontend.log_format = Some(quote_log_format(format));
    }
    if config.client_timeout.is_some() {
        frontend.client_timeout = config.client_timeout;
    }
    if let Some(tcplog) = config.tcplog {
        frontend.tcplog = tcplog;
    }
    if let Some(dontlognull) = config.dontlognull {
        frontend.dontlognull = dontlognull;
    }
}

/// A frontend fully described by a custom resource, binds included.
pub fn frontend_from_cr(name: &str, mode: Mode, config: &FrontendConfig) -> Frontend {
    let mut frontend = Frontend::new(name, mode);
    apply_frontend_cr(&mut frontend, config);
    frontend.binds = config.binds.iter().map(bind_from_cr).collect();
    frontend
}

pub fn bind_from_cr(bind: &CrBind) -> Bind {
    Bind {
        v4v6: bind.v4v6,
        ssl: bind.ssl,
        ssl_certificate: bind.ssl_certificate.clone(),
        accept_proxy: bind.accept_proxy,
        ..Bind::new(
            bind.name.as_str(),
            bind.address.as_deref().unwrap_or_default(),
            bind.port,
        )
    }
}
