//! In-memory model of the sections of an HAProxy configuration file.
//!
//! Only the directives this controller emits are modelled. Durations are
//! stored in milliseconds, which HAProxy accepts without a unit suffix.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    #[default]
    Http,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HttpConnectionMode {
    HttpKeepAlive,
    HttpServerClose,
    Httpclose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeApi {
    pub address: String,
    pub level: String,
    pub expose_fd_listeners: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    pub daemon: bool,
    pub master_worker: bool,
    pub runtime_apis: Vec<RuntimeApi>,
    pub pidfile: Option<String>,
    pub localpeer: Option<String>,
    pub maxconn: Option<u64>,
    pub nbthread: Option<u32>,
    pub hard_stop_after: Option<u64>,
    pub stats_timeout: Option<u64>,
    pub server_state_base: Option<String>,
    pub ssl_default_bind_ciphers: Option<String>,
    pub ssl_default_bind_ciphersuites: Option<String>,
    pub ssl_default_bind_options: Option<String>,
    pub ssl_default_server_ciphers: Option<String>,
    pub tune_ssl_default_dh_param: Option<u32>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTarget {
    pub address: String,
    pub port: Option<u16>,
    pub length: Option<u32>,
    pub format: Option<String>,
    pub facility: Option<String>,
    pub level: Option<String>,
    pub minlevel: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    pub client: Option<u64>,
    pub client_fin: Option<u64>,
    pub connect: Option<u64>,
    pub http_keep_alive: Option<u64>,
    pub http_request: Option<u64>,
    pub queue: Option<u64>,
    pub server: Option<u64>,
    pub server_fin: Option<u64>,
    pub tunnel: Option<u64>,
    pub check: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errorfile {
    pub code: u16,
    pub file: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub mode: Mode,
    pub maxconn: Option<u64>,
    pub log_format: Option<String>,
    pub httplog: bool,
    pub dontlognull: bool,
    pub logasap: bool,
    pub redispatch: bool,
    pub forwardfor: bool,
    pub http_connection_mode: Option<HttpConnectionMode>,
    pub timeouts: Timeouts,
    pub errorfiles: Vec<Errorfile>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub v4v6: bool,
    pub accept_proxy: bool,
    pub ssl: bool,
    pub ssl_certificate: Option<String>,
    pub ssl_cafile: Option<String>,
    pub verify: Option<String>,
    pub alpn: Option<String>,
    pub strict_sni: bool,
}

impl Bind {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ..Self::default()
        }
    }
}

/// One `http-request`, `http-response` or `tcp-request` line without its
/// keyword. `cond` is the test following `if`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLine {
    pub action: String,
    pub cond: Option<String>,
}

impl RuleLine {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            cond: None,
        }
    }

    #[must_use]
    pub fn when(mut self, cond: impl Into<String>) -> Self {
        let cond = cond.into();
        if !cond.is_empty() {
            self.cond = Some(cond);
        }
        self
    }

    /// Prepends `acl` to the condition, as rules owned by an ingress only
    /// fire for that ingress's routes.
    #[must_use]
    pub fn scoped(mut self, acl: &str) -> Self {
        if acl.is_empty() {
            return self;
        }
        self.cond = Some(match self.cond.take() {
            Some(cond) => format!("{acl} {cond}"),
            None => acl.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSwitchingRule {
    pub backend: String,
    pub cond: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub uri: String,
    pub refresh: Option<u64>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    pub name: String,
    pub mode: Mode,
    pub binds: Vec<Bind>,
    pub default_backend: Option<String>,
    pub maxconn: Option<u64>,
    pub log_format: Option<String>,
    pub httplog: bool,
    pub tcplog: bool,
    pub dontlognull: bool,
    pub dontlog_normal: bool,
    pub client_timeout: Option<u64>,
    pub monitor_uri: Option<String>,
    pub stats: Option<Stats>,
    pub tcp_request_rules: Vec<RuleLine>,
    pub http_request_rules: Vec<RuleLine>,
    pub http_response_rules: Vec<RuleLine>,
    pub http_after_response_rules: Vec<RuleLine>,
    pub backend_switching_rules: Vec<BackendSwitchingRule>,
    pub config_snippets: Vec<String>,
}

impl Frontend {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            ..Self::default()
        }
    }

    pub fn bind(&self, name: &str) -> Option<&Bind> {
        self.binds.iter().find(|bind| bind.name == name)
    }

    /// Creates or replaces the bind named like `bind`.
    pub fn set_bind(&mut self, bind: Bind) {
        match self.binds.iter_mut().find(|b| b.name == bind.name) {
            Some(existing) => *existing = bind,
            None => self.binds.push(bind),
        }
    }

    pub fn remove_bind(&mut self, name: &str) -> bool {
        let before = self.binds.len();
        self.binds.retain(|bind| bind.name != name);
        before != self.binds.len()
    }

    pub fn ssl_offload_enabled(&self) -> bool {
        self.binds.iter().any(|bind| bind.ssl)
    }

    pub fn clear_rules(&mut self) {
        self.tcp_request_rules.clear();
        self.http_request_rules.clear();
        self.http_response_rules.clear();
        self.http_after_response_rules.clear();
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub algorithm: String,
    pub param: Option<String>,
    pub modifiers: Vec<String>,
}

impl Balance {
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Self::default()
        }
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub kind: String,
    pub indirect: bool,
    pub nocache: bool,
    pub dynamic: bool,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub method: Option<String>,
    pub uri: String,
    pub version: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultServer {
    pub check: bool,
    pub inter: Option<u64>,
    pub maxconn: Option<u64>,
    pub send_proxy: Option<String>,
    pub ssl: bool,
    pub verify: Option<String>,
    pub ca_file: Option<String>,
    pub crt: Option<String>,
    pub alpn: Option<String>,
    pub proto: Option<String>,
    /// Resolution order of server addresses given as DNS names.
    pub init_addr: Option<String>,
}

impl DefaultServer {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub disabled: bool,
    pub check: bool,
    pub send_proxy_v2: bool,
}

impl Server {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickTable {
    pub kind: String,
    pub size: u64,
    pub expire: u64,
    pub store: String,
    pub peers: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub name: String,
    pub criterion: String,
    pub value: Option<String>,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    pub mode: Mode,
    pub balance: Option<Balance>,
    pub cookie: Option<Cookie>,
    pub dynamic_cookie_key: Option<String>,
    pub http_check: Option<HttpCheck>,
    pub default_server: DefaultServer,
    pub forwardfor: bool,
    pub abortonclose: bool,
    pub maxconn: Option<u64>,
    pub timeouts: Timeouts,
    pub stick_table: Option<StickTable>,
    pub acls: Vec<Acl>,
    pub http_request_rules: Vec<RuleLine>,
    pub servers: Vec<Server>,
    pub config_snippets: Vec<String>,
}

impl Backend {
    pub fn new(name: impl Into<String>, mode: Mode) -> Self {
        Self {
            name: name.into(),
            mode,
            ..Self::default()
        }
    }

    pub fn server(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|server| server.name == name)
    }

    /// Creates or replaces a server, keeping servers ordered by slot index.
    pub fn set_server(&mut self, server: Server) {
        match self.servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server,
            None => {
                self.servers.push(server);
                self.servers
                    .sort_by(|a, b| a.name.len().cmp(&b.name.len()).then(a.name.cmp(&b.name)));
            }
        }
    }

    /// Backend parameters without the servers, for change detection.
    pub fn without_servers(&self) -> Backend {
        Backend {
            servers: Vec::new(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub password: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Userlist {
    pub name: String,
    pub groups: Vec<String>,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    pub name: String,
    pub entries: Vec<PeerEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_line_scoped() {
        let rule = RuleLine::new("deny deny_status 403")
            .when("{ src -f /etc/haproxy/maps/blacklist-1.map }")
            .scoped("{ var(txn.path_match) -m dom abc }");
        assert_eq!(
            rule.cond.as_deref(),
            Some("{ var(txn.path_match) -m dom abc } { src -f /etc/haproxy/maps/blacklist-1.map }")
        );

        let rule = RuleLine::new("set-header X-Forwarded-Proto https").scoped("");
        assert_eq!(rule.cond, None);
    }

    #[test]
    fn test_set_server_keeps_slot_order() {
        let mut backend = Backend::new("default_app_http", Mode::Http);
        for index in [10, 2, 1, 11, 3] {
            backend.set_server(Server::new(format!("SRV_{index}"), "127.0.0.1", Some(1)));
        }
        let names = backend
            .servers
            .iter()
            .map(|server| server.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["SRV_1", "SRV_2", "SRV_3", "SRV_10", "SRV_11"]);
    }

    #[test]
    fn test_frontend_binds() {
        let mut frontend = Frontend::new("http", Mode::Http);
        frontend.set_bind(Bind::new("v4", "0.0.0.0", Some(80)));
        frontend.set_bind(Bind::new("v4", "0.0.0.0", Some(8080)));
        assert_eq!(frontend.binds.len(), 1);
        assert_eq!(frontend.bind("v4").and_then(|b| b.port), Some(8080));
        assert!(!frontend.ssl_offload_enabled());
        assert!(frontend.remove_bind("v4"));
        assert!(!frontend.remove_bind("v4"));
    }
}
