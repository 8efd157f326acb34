use crate::configuration::Configuration;
use crate::models::{Mode, RuleLine, User, Userlist};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::{Display, EnumIter};
use thiserror::Error;

/// Rule types in the order HAProxy evaluates them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Display, EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    ReqAcceptContent,
    ReqInspectDelay,
    ReqProxyProtocol,
    ReqSetVar,
    ReqSetSrc,
    ReqDeny,
    ReqTrack,
    ReqAuth,
    ReqRatelimit,
    ReqCapture,
    ReqRedirect,
    ReqForwardedProto,
    ReqSetHeader,
    ReqSetHost,
    ReqPathRewrite,
    ReqReturnStatus,
    ResSetHeader,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("{0} cannot be configured in TCP mode")]
    TcpMode(RuleType),
    #[error("frontend {0} not found")]
    FrontendNotFound(String),
}

const DEFAULT_RATE_LIMIT_STATUS: u16 = 403;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqInspectDelay {
    pub timeout: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqProxyProtocol {
    pub src_ips_map: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqSetVar {
    pub name: String,
    pub scope: String,
    pub expression: String,
    pub cond_test: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqSetSrc {
    pub header_name: String,
}

/// Denies sources listed in a map, or every source but those when
/// `whitelist` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqDeny {
    pub src_ips_map: String,
    pub whitelist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqTrack {
    pub table_name: String,
    pub track_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqBasicAuth {
    pub auth_group: String,
    pub auth_realm: String,
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqRateLimit {
    pub table_name: String,
    /// Zero disables the rule.
    pub reqs_limit: u64,
    pub deny_status_code: Option<u16>,
    pub whitelist_ips: Vec<String>,
    pub whitelist_maps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqCapture {
    pub expression: String,
    pub capture_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestRedirect {
    pub host: String,
    pub redirect_code: u16,
    pub redirect_port: u16,
    pub ssl_request: bool,
    pub ssl_redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetHdr {
    pub name: String,
    pub format: String,
    pub cond_test: Option<String>,
    pub response: bool,
    pub after_response: bool,
    pub forwarded_proto: bool,
}

impl SetHdr {
    pub fn request(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            format: format.into(),
            cond_test: None,
            response: false,
            after_response: false,
            forwarded_proto: false,
        }
    }

    pub fn response(name: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            response: true,
            ..Self::request(name, format)
        }
    }

    pub fn forwarded_proto() -> Self {
        Self {
            forwarded_proto: true,
            ..Self::request("X-Forwarded-Proto", "https")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqSetHost {
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqPathRewrite {
    pub path_match: String,
    pub path_fmt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReqReturnStatus {
    pub status_code: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Rule {
    AcceptContent,
    InspectDelay(ReqInspectDelay),
    ProxyProtocol(ReqProxyProtocol),
    SetVar(ReqSetVar),
    SetSrc(ReqSetSrc),
    Deny(ReqDeny),
    Track(ReqTrack),
    BasicAuth(ReqBasicAuth),
    RateLimit(ReqRateLimit),
    Capture(ReqCapture),
    Redirect(RequestRedirect),
    SetHdr(SetHdr),
    SetHost(ReqSetHost),
    PathRewrite(ReqPathRewrite),
    ReturnStatus(ReqReturnStatus),
}

macro_rules! rule_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for Rule {
            fn from(value: $ty) -> Self {
                Rule::$variant(value)
            }
        })*
    };
}

rule_from!(
    InspectDelay(ReqInspectDelay),
    ProxyProtocol(ReqProxyProtocol),
    SetVar(ReqSetVar),
    SetSrc(ReqSetSrc),
    Deny(ReqDeny),
    Track(ReqTrack),
    BasicAuth(ReqBasicAuth),
    RateLimit(ReqRateLimit),
    Capture(ReqCapture),
    Redirect(RequestRedirect),
    SetHdr(SetHdr),
    SetHost(ReqSetHost),
    PathRewrite(ReqPathRewrite),
    ReturnStatus(ReqReturnStatus),
);

impl Rule {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Rule::AcceptContent => RuleType::ReqAcceptContent,
            Rule::InspectDelay(_) => RuleType::ReqInspectDelay,
            Rule::ProxyProtocol(_) => RuleType::ReqProxyProtocol,
            Rule::SetVar(_) => RuleType::ReqSetVar,
            Rule::SetSrc(_) => RuleType::ReqSetSrc,
            Rule::Deny(_) => RuleType::ReqDeny,
            Rule::Track(_) => RuleType::ReqTrack,
            Rule::BasicAuth(_) => RuleType::ReqAuth,
            Rule::RateLimit(_) => RuleType::ReqRatelimit,
            Rule::Capture(_) => RuleType::ReqCapture,
            Rule::Redirect(_) => RuleType::ReqRedirect,
            Rule::SetHdr(rule) if rule.forwarded_proto => RuleType::ReqForwardedProto,
            Rule::SetHdr(rule) if rule.response || rule.after_response => RuleType::ResSetHeader,
            Rule::SetHdr(_) => RuleType::ReqSetHeader,
            Rule::SetHost(_) => RuleType::ReqSetHost,
            Rule::PathRewrite(_) => RuleType::ReqPathRewrite,
            Rule::ReturnStatus(_) => RuleType::ReqReturnStatus,
        }
    }

    /// Adds the rule to `frontend`. `ingress_acl` restricts the rule to the
    /// routes owning it and is empty for global rules.
    pub(crate) fn create(
        &self,
        config: &mut Configuration,
        frontend: &str,
        ingress_acl: &str,
    ) -> Result<(), RuleError> {
        let mode = config
            .frontends
            .get(frontend)
            .map(|frontend| frontend.mode)
            .ok_or_else(|| RuleError::FrontendNotFound(frontend.to_string()))?;
        let tcp = mode == Mode::Tcp;
        let http_only = || {
            if tcp {
                Err(RuleError::TcpMode(self.rule_type()))
            } else {
                Ok(())
            }
        };

        let (target, line) = match self {
            Rule::AcceptContent => (
                Target::Tcp,
                RuleLine::new("content accept").when("{ req_ssl_hello_type 1 }"),
            ),
            Rule::InspectDelay(rule) => (
                Target::Tcp,
                RuleLine::new(format!("inspect-delay {}", rule.timeout)),
            ),
            Rule::ProxyProtocol(rule) => (
                Target::Tcp,
                RuleLine::new("connection expect-proxy layer4")
                    .when(format!("{{ src -f {} }}", rule.src_ips_map)),
            ),
            Rule::SetVar(rule) => {
                let action = format!("set-var({}.{}) {}", rule.scope, rule.name, rule.expression);
                let line = RuleLine::new(action).when(rule.cond_test.clone().unwrap_or_default());
                if tcp {
                    (
                        Target::Tcp,
                        RuleLine {
                            action: format!("content {}", line.action),
                            ..line
                        },
                    )
                } else {
                    (Target::HttpRequest, line)
                }
            }
            Rule::SetSrc(rule) => {
                http_only()?;
                (
                    Target::HttpRequest,
                    RuleLine::new(format!("set-src hdr({})", rule.header_name)),
                )
            }
            Rule::Deny(rule) => {
                let negate = if rule.whitelist { "!" } else { "" };
                let cond = format!("{negate}{{ src -f {} }}", rule.src_ips_map);
                if tcp {
                    (Target::Tcp, RuleLine::new("content reject").when(cond))
                } else {
                    (Target::HttpRequest, RuleLine::new("deny").when(cond))
                }
            }
            Rule::Track(rule) => {
                http_only()?;
                (
                    Target::HttpRequest,
                    RuleLine::new(format!(
                        "track-sc0 {} table {}",
                        rule.track_key, rule.table_name
                    )),
                )
            }
            Rule::BasicAuth(rule) => {
                http_only()?;
                add_userlist(config, rule);
                (
                    Target::HttpRequest,
                    RuleLine::new(format!("auth realm {}", rule.auth_realm)).when(format!(
                        "!{{ http_auth_group({}) authenticated-users }}",
                        rule.auth_group
                    )),
                )
            }
            Rule::RateLimit(rule) => {
                http_only()?;
                if rule.reqs_limit == 0 {
                    return Ok(());
                }
                (Target::HttpRequest, rate_limit_line(rule))
            }
            Rule::Capture(rule) => {
                let action = format!("capture {} len {}", rule.expression, rule.capture_len);
                if tcp {
                    (Target::Tcp, RuleLine::new(format!("content {action}")))
                } else {
                    (Target::HttpRequest, RuleLine::new(action))
                }
            }
            Rule::Redirect(rule) => {
                http_only()?;
                (Target::HttpRequest, redirect_line(rule))
            }
            Rule::SetHdr(rule) => {
                http_only()?;
                let line = RuleLine::new(format!("set-header {} {}", rule.name, rule.format))
                    .when(rule.cond_test.clone().unwrap_or_default());
                let target = if rule.after_response {
                    Target::HttpAfterResponse
                } else if rule.response {
                    Target::HttpResponse
                } else {
                    Target::HttpRequest
                };
                (target, line)
            }
            Rule::SetHost(rule) => {
                http_only()?;
                (
                    Target::HttpRequest,
                    RuleLine::new(format!("set-header Host {}", rule.host)),
                )
            }
            Rule::PathRewrite(rule) => {
                http_only()?;
                (
                    Target::HttpRequest,
                    RuleLine::new(format!(
                        "replace-path {} {}",
                        rule.path_match, rule.path_fmt
                    )),
                )
            }
            Rule::ReturnStatus(rule) => {
                http_only()?;
                (
                    Target::HttpRequest,
                    RuleLine::new(format!("return status {}", rule.status_code))
                        .when("METH_OPTIONS"),
                )
            }
        };

        let line = line.scoped(ingress_acl);
        let frontend = config
            .frontends
            .get_mut(frontend)
            .ok_or_else(|| RuleError::FrontendNotFound(frontend.to_string()))?;
        match target {
            Target::Tcp => frontend.tcp_request_rules.push(line),
            Target::HttpRequest => frontend.http_request_rules.push(line),
            Target::HttpResponse => frontend.http_response_rules.push(line),
            Target::HttpAfterResponse => frontend.http_after_response_rules.push(line),
        }
        Ok(())
    }
}

enum Target {
    Tcp,
    HttpRequest,
    HttpResponse,
    HttpAfterResponse,
}

fn rate_limit_line(rule: &ReqRateLimit) -> RuleLine {
    let mut parts = vec![format!(
        "{{ sc0_http_req_rate({}) gt {} }}",
        rule.table_name, rule.reqs_limit
    )];
    if !rule.whitelist_ips.is_empty() {
        parts.push(format!("!{{ src {} }}", rule.whitelist_ips.join(" ")));
    }
    parts.extend(
        rule.whitelist_maps
            .iter()
            .map(|map| format!("!{{ src -f {map} }}")),
    );
    let cond = parts.join(" ");
    let status = rule.deny_status_code.unwrap_or(DEFAULT_RATE_LIMIT_STATUS);
    RuleLine::new(format!("deny deny_status {status}")).when(cond)
}

fn redirect_line(rule: &RequestRedirect) -> RuleLine {
    let location = if rule.ssl_redirect {
        format!(
            "https://%[hdr(host),field(1,:)]:{}%[capture.req.uri]",
            rule.redirect_port
        )
    } else {
        let scheme = if rule.ssl_request { "https" } else { "http" };
        format!("{scheme}://{}%[capture.req.uri]", rule.host)
    };
    RuleLine::new(format!(
        "redirect location {location} code {}",
        rule.redirect_code
    ))
}

fn add_userlist(config: &mut Configuration, rule: &ReqBasicAuth) {
    let users = rule
        .credentials
        .iter()
        .map(|(name, password)| User {
            name: name.clone(),
            password: password.clone(),
            groups: vec!["authenticated-users".to_string()],
        })
        .collect();
    config.userlists.insert(
        rule.auth_group.clone(),
        Userlist {
            name: rule.auth_group.clone(),
            groups: vec!["authenticated-users".to_string()],
            users,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Frontend;
    use assertables::{assert_err, assert_ok};
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> Configuration {
        let mut config = Configuration::default();
        config
            .frontends
            .insert("http".to_string(), Frontend::new("http", Mode::Http));
        config
            .frontends
            .insert("ssl".to_string(), Frontend::new("ssl", Mode::Tcp));
        config
    }

    fn http_request_lines(config: &Configuration) -> Vec<(String, Option<String>)> {
        config.frontends["http"]
            .http_request_rules
            .iter()
            .map(|rule| (rule.action.clone(), rule.cond.clone()))
            .collect()
    }

    #[rstest]
    fn test_rate_limit_with_whitelist(mut config: Configuration) {
        let rule = Rule::from(ReqRateLimit {
            table_name: "RateLimit-5000".to_string(),
            reqs_limit: 5,
            deny_status_code: Some(429),
            whitelist_ips: vec!["10.0.0.0/8".to_string(), "192.168.1.1".to_string()],
            whitelist_maps: vec!["/etc/haproxy/patterns/trusted".to_string()],
        });
        assert_ok!(rule.create(&mut config, "http", "{ var(txn.path_match) -m dom abc }"));
        assert_eq!(
            http_request_lines(&config),
            vec![(
                "deny deny_status 429".to_string(),
                Some(
                    "{ var(txn.path_match) -m dom abc } { sc0_http_req_rate(RateLimit-5000) gt 5 } !{ src 10.0.0.0/8 192.168.1.1 } !{ src -f /etc/haproxy/patterns/trusted }"
                        .to_string()
                )
            )]
        );
    }

    #[rstest]
    fn test_rate_limit_defaults_and_disabled(mut config: Configuration) {
        let mut rule = ReqRateLimit {
            table_name: "RateLimit-1000".to_string(),
            reqs_limit: 0,
            deny_status_code: None,
            whitelist_ips: Vec::new(),
            whitelist_maps: Vec::new(),
        };
        assert_ok!(Rule::from(rule.clone()).create(&mut config, "http", ""));
        assert!(http_request_lines(&config).is_empty());

        rule.reqs_limit = 10;
        assert_ok!(Rule::from(rule).create(&mut config, "http", ""));
        assert_eq!(
            http_request_lines(&config)[0].0,
            "deny deny_status 403".to_string()
        );
    }

    #[rstest]
    #[case::ssl(true, false, "redirect location https://%[hdr(host),field(1,:)]:443%[capture.req.uri] code 301")]
    #[case::host(false, true, "redirect location https://example.com%[capture.req.uri] code 301")]
    #[case::host_plain(false, false, "redirect location http://example.com%[capture.req.uri] code 301")]
    fn test_redirect(
        mut config: Configuration,
        #[case] ssl_redirect: bool,
        #[case] ssl_request: bool,
        #[case] expected: &str,
    ) {
        let rule = Rule::from(RequestRedirect {
            host: "example.com".to_string(),
            redirect_code: 301,
            redirect_port: 443,
            ssl_request,
            ssl_redirect,
        });
        assert_ok!(rule.create(&mut config, "http", ""));
        assert_eq!(http_request_lines(&config)[0].0, expected);
    }

    #[rstest]
    fn test_http_only_rules_fail_in_tcp_mode(mut config: Configuration) {
        let rule = Rule::from(SetHdr::forwarded_proto());
        assert_eq!(rule.rule_type(), RuleType::ReqForwardedProto);
        let err = assert_err!(rule.create(&mut config, "ssl", ""));
        assert_eq!(err, RuleError::TcpMode(RuleType::ReqForwardedProto));
    }

    #[rstest]
    fn test_set_var_in_tcp_mode(mut config: Configuration) {
        let rule = Rule::from(ReqSetVar {
            name: "sni".to_string(),
            scope: "sess".to_string(),
            expression: "req_ssl_sni".to_string(),
            cond_test: None,
        });
        assert_ok!(rule.create(&mut config, "ssl", ""));
        let lines = &config.frontends["ssl"].tcp_request_rules;
        assert_eq!(lines[0].action, "content set-var(sess.sni) req_ssl_sni");
    }

    #[rstest]
    fn test_basic_auth_creates_userlist(mut config: Configuration) {
        let rule = Rule::from(ReqBasicAuth {
            auth_group: "default-app".to_string(),
            auth_realm: "Protected-Content".to_string(),
            credentials: BTreeMap::from([("admin".to_string(), "$5$hash".to_string())]),
        });
        assert_ok!(rule.create(&mut config, "http", ""));
        let userlist = &config.userlists["default-app"];
        assert_eq!(userlist.users[0].name, "admin");
        assert_eq!(
            http_request_lines(&config)[0],
            (
                "auth realm Protected-Content".to_string(),
                Some("!{ http_auth_group(default-app) authenticated-users }".to_string())
            )
        );
    }

    #[rstest]
    fn test_cors_headers_go_after_response(mut config: Configuration) {
        let rule = Rule::from(SetHdr {
            after_response: true,
            cond_test: Some("{ var(txn.cors_origin) -m found }".to_string()),
            ..SetHdr::request("Access-Control-Allow-Origin", "*")
        });
        assert_eq!(rule.rule_type(), RuleType::ResSetHeader);
        assert_ok!(rule.create(&mut config, "http", ""));
        assert_eq!(config.frontends["http"].http_after_response_rules.len(), 1);
    }

    #[rstest]
    fn test_missing_frontend(mut config: Configuration) {
        let err = assert_err!(Rule::AcceptContent.create(&mut config, "https", ""));
        assert_eq!(err, RuleError::FrontendNotFound("https".to_string()));
    }
}
