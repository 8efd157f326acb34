//! Renders a [`Configuration`] to HAProxy configuration text.
//!
//! Sections always come out in the same order (global, defaults, userlists,
//! peers, frontends, backends) and named sections are sorted by name, so equal
//! configurations render to equal bytes.

use crate::configuration::Configuration;
use crate::models::{
    Backend, Bind, Defaults, Frontend, Global, LogTarget, Peers, RuleLine, Server, Timeouts,
    Userlist,
};
use itertools::Itertools;
use std::fmt::{self, Display, Formatter, Write};

pub const DEFAULTS_SECTION_NAME: &str = "haproxytech";

const INDENT: &str = "  ";

pub fn render(config: &Configuration) -> String {
    let mut out = String::with_capacity(8 * 1024);
    let _ = write!(out, "{}", Rendered(config));
    out
}

struct Rendered<'a>(&'a Configuration);

impl Display for Rendered<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let config = self.0;
        write_global(f, &config.global, &config.log_targets, &config.global_snippet)?;
        write_defaults(f, &config.defaults)?;
        for userlist in config.userlists.values() {
            write_userlist(f, userlist)?;
        }
        for peers in config.peers.values() {
            write_peers(f, peers)?;
        }
        for frontend in config.frontends.values() {
            write_frontend(f, frontend)?;
        }
        for backend in config.backends.values() {
            write_backend(f, backend)?;
        }
        Ok(())
    }
}

fn directive(f: &mut Formatter<'_>, text: impl Display) -> fmt::Result {
    writeln!(f, "{INDENT}{text}")
}

fn opt_directive<T: Display>(f: &mut Formatter<'_>, keyword: &str, value: Option<T>) -> fmt::Result {
    match value {
        Some(value) => directive(f, format_args!("{keyword} {value}")),
        None => Ok(()),
    }
}

fn flag(f: &mut Formatter<'_>, keyword: &str, enabled: bool) -> fmt::Result {
    if enabled { directive(f, keyword) } else { Ok(()) }
}

fn write_global(
    f: &mut Formatter<'_>,
    global: &Global,
    log_targets: &[LogTarget],
    snippet: &[String],
) -> fmt::Result {
    writeln!(f, "global")?;
    flag(f, "daemon", global.daemon)?;
    flag(f, "master-worker", global.master_worker)?;
    opt_directive(f, "pidfile", global.pidfile.as_ref())?;
    opt_directive(f, "localpeer", global.localpeer.as_ref())?;
    for api in &global.runtime_apis {
        let expose = if api.expose_fd_listeners {
            " expose-fd listeners"
        } else {
            ""
        };
        directive(
            f,
            format_args!("stats socket {} level {}{expose}", api.address, api.level),
        )?;
    }
    opt_directive(f, "stats timeout", global.stats_timeout)?;
    opt_directive(f, "maxconn", global.maxconn)?;
    opt_directive(f, "nbthread", global.nbthread)?;
    opt_directive(f, "hard-stop-after", global.hard_stop_after)?;
    opt_directive(f, "server-state-base", global.server_state_base.as_ref())?;
    opt_directive(
        f,
        "ssl-default-bind-ciphers",
        global.ssl_default_bind_ciphers.as_ref(),
    )?;
    opt_directive(
        f,
        "ssl-default-bind-ciphersuites",
        global.ssl_default_bind_ciphersuites.as_ref(),
    )?;
    opt_directive(
        f,
        "ssl-default-bind-options",
        global.ssl_default_bind_options.as_ref(),
    )?;
    opt_directive(
        f,
        "ssl-default-server-ciphers",
        global.ssl_default_server_ciphers.as_ref(),
    )?;
    opt_directive(
        f,
        "tune.ssl.default-dh-param",
        global.tune_ssl_default_dh_param,
    )?;
    for target in log_targets {
        directive(f, log_target(target))?;
    }
    write_snippet(f, snippet)?;
    writeln!(f)
}

fn log_target(target: &LogTarget) -> String {
    let mut line = format!("log {}", target.address);
    if let Some(port) = target.port {
        let _ = write!(line, ":{port}");
    }
    if let Some(length) = target.length {
        let _ = write!(line, " len {length}");
    }
    if let Some(format) = &target.format {
        let _ = write!(line, " format {format}");
    }
    let _ = write!(
        line,
        " {}",
        target.facility.as_deref().unwrap_or("local0")
    );
    if let Some(level) = &target.level {
        let _ = write!(line, " {level}");
        if let Some(minlevel) = &target.minlevel {
            let _ = write!(line, " {minlevel}");
        }
    }
    line
}

fn write_snippet(f: &mut Formatter<'_>, snippet: &[String]) -> fmt::Result {
    if snippet.is_empty() {
        return Ok(());
    }
    directive(f, "###_config-snippet_### BEGIN")?;
    for line in snippet {
        directive(f, line)?;
    }
    directive(f, "###_config-snippet_### END")
}

fn write_timeouts(f: &mut Formatter<'_>, timeouts: &Timeouts) -> fmt::Result {
    opt_directive(f, "timeout client", timeouts.client)?;
    opt_directive(f, "timeout client-fin", timeouts.client_fin)?;
    opt_directive(f, "timeout connect", timeouts.connect)?;
    opt_directive(f, "timeout http-keep-alive", timeouts.http_keep_alive)?;
    opt_directive(f, "timeout http-request", timeouts.http_request)?;
    opt_directive(f, "timeout queue", timeouts.queue)?;
    opt_directive(f, "timeout server", timeouts.server)?;
    opt_directive(f, "timeout server-fin", timeouts.server_fin)?;
    opt_directive(f, "timeout tunnel", timeouts.tunnel)?;
    opt_directive(f, "timeout check", timeouts.check)
}

fn write_defaults(f: &mut Formatter<'_>, defaults: &Defaults) -> fmt::Result {
    writeln!(f, "defaults {DEFAULTS_SECTION_NAME}")?;
    directive(f, format_args!("mode {}", defaults.mode))?;
    directive(f, "log global")?;
    flag(f, "option httplog", defaults.httplog)?;
    opt_directive(f, "log-format", defaults.log_format.as_ref())?;
    flag(f, "option dontlognull", defaults.dontlognull)?;
    flag(f, "option logasap", defaults.logasap)?;
    flag(f, "option redispatch", defaults.redispatch)?;
    flag(f, "option forwardfor", defaults.forwardfor)?;
    if let Some(mode) = defaults.http_connection_mode {
        directive(f, format_args!("option {mode}"))?;
    }
    opt_directive(f, "maxconn", defaults.maxconn)?;
    write_timeouts(f, &defaults.timeouts)?;
    for errorfile in &defaults.errorfiles {
        directive(
            f,
            format_args!("errorfile {} {}", errorfile.code, errorfile.file),
        )?;
    }
    writeln!(f)
}

fn write_userlist(f: &mut Formatter<'_>, userlist: &Userlist) -> fmt::Result {
    writeln!(f, "userlist {}", userlist.name)?;
    for group in &userlist.groups {
        directive(f, format_args!("group {group}"))?;
    }
    for user in &userlist.users {
        let mut line = format!("user {} password {}", user.name, user.password);
        if !user.groups.is_empty() {
            let _ = write!(line, " groups {}", user.groups.join(","));
        }
        directive(f, line)?;
    }
    writeln!(f)
}

fn write_peers(f: &mut Formatter<'_>, peers: &Peers) -> fmt::Result {
    writeln!(f, "peers {}", peers.name)?;
    for entry in &peers.entries {
        directive(
            f,
            format_args!("peer {} {}:{}", entry.name, entry.address, entry.port),
        )?;
    }
    writeln!(f)
}

pub(crate) fn bind_line(bind: &Bind) -> String {
    let mut line = match bind.port {
        Some(port) => format!("bind {}:{port}", bind.address),
        None => format!("bind {}", bind.address),
    };
    let _ = write!(line, " name {}", bind.name);
    if bind.v4v6 {
        line.push_str(" v4v6");
    }
    if bind.accept_proxy {
        line.push_str(" accept-proxy");
    }
    if bind.ssl {
        line.push_str(" ssl");
        if let Some(crt) = &bind.ssl_certificate {
            let _ = write!(line, " crt {crt}");
        }
        if let Some(ca) = &bind.ssl_cafile {
            let _ = write!(line, " ca-file {ca}");
        }
        if let Some(verify) = &bind.verify {
            let _ = write!(line, " verify {verify}");
        }
        if let Some(alpn) = &bind.alpn {
            let _ = write!(line, " alpn {alpn}");
        }
        if bind.strict_sni {
            line.push_str(" strict-sni");
        }
    }
    line
}

fn rule_line(keyword: &str, rule: &RuleLine) -> String {
    match &rule.cond {
        Some(cond) => format!("{keyword} {} if {cond}", rule.action),
        None => format!("{keyword} {}", rule.action),
    }
}

fn write_frontend(f: &mut Formatter<'_>, frontend: &Frontend) -> fmt::Result {
    writeln!(f, "frontend {}", frontend.name)?;
    directive(f, format_args!("mode {}", frontend.mode))?;
    for bind in &frontend.binds {
        directive(f, bind_line(bind))?;
    }
    opt_directive(f, "maxconn", frontend.maxconn)?;
    flag(f, "option httplog", frontend.httplog)?;
    flag(f, "option tcplog", frontend.tcplog)?;
    opt_directive(f, "log-format", frontend.log_format.as_ref())?;
    flag(f, "option dontlognull", frontend.dontlognull)?;
    flag(f, "option dontlog-normal", frontend.dontlog_normal)?;
    opt_directive(f, "timeout client", frontend.client_timeout)?;
    opt_directive(f, "monitor-uri", frontend.monitor_uri.as_ref())?;
    if let Some(stats) = &frontend.stats {
        directive(f, "stats enable")?;
        directive(f, format_args!("stats uri {}", stats.uri))?;
        opt_directive(f, "stats refresh", stats.refresh)?;
    }
    for rule in &frontend.tcp_request_rules {
        directive(f, rule_line("tcp-request", rule))?;
    }
    for rule in &frontend.http_request_rules {
        directive(f, rule_line("http-request", rule))?;
    }
    for rule in &frontend.http_response_rules {
        directive(f, rule_line("http-response", rule))?;
    }
    for rule in &frontend.http_after_response_rules {
        directive(f, rule_line("http-after-response", rule))?;
    }
    write_snippet(f, &frontend.config_snippets)?;
    for rule in &frontend.backend_switching_rules {
        if rule.cond.is_empty() {
            directive(f, format_args!("use_backend {}", rule.backend))?;
        } else {
            directive(f, format_args!("use_backend {} if {}", rule.backend, rule.cond))?;
        }
    }
    opt_directive(f, "default_backend", frontend.default_backend.as_ref())?;
    writeln!(f)
}

pub(crate) fn server_line(server: &Server) -> String {
    let mut line = match server.port {
        Some(port) => format!("server {} {}:{port}", server.name, server.address),
        None => format!("server {} {}", server.name, server.address),
    };
    if server.check {
        line.push_str(" check");
    }
    if server.send_proxy_v2 {
        line.push_str(" send-proxy-v2");
    }
    line.push_str(if server.disabled { " disabled" } else { " enabled" });
    line
}

fn write_backend(f: &mut Formatter<'_>, backend: &Backend) -> fmt::Result {
    writeln!(f, "backend {}", backend.name)?;
    directive(f, format_args!("mode {}", backend.mode))?;
    if let Some(balance) = &backend.balance {
        let mut line = format!("balance {}", balance.algorithm);
        if let Some(param) = &balance.param {
            let _ = write!(line, "({param})");
        }
        for modifier in &balance.modifiers {
            let _ = write!(line, " {modifier}");
        }
        directive(f, line)?;
    }
    flag(f, "option forwardfor", backend.forwardfor)?;
    flag(f, "option abortonclose", backend.abortonclose)?;
    opt_directive(f, "fullconn", backend.maxconn)?;
    if let Some(check) = &backend.http_check {
        let parts = [
            check.method.as_deref(),
            Some(check.uri.as_str()),
            check.version.as_deref(),
        ];
        directive(
            f,
            format_args!("option httpchk {}", parts.iter().flatten().join(" ")),
        )?;
    }
    if let Some(cookie) = &backend.cookie {
        let mut line = format!("cookie {} {}", cookie.name, cookie.kind);
        if cookie.indirect {
            line.push_str(" indirect");
        }
        if cookie.nocache {
            line.push_str(" nocache");
        }
        if cookie.dynamic {
            line.push_str(" dynamic");
        }
        directive(f, line)?;
    }
    opt_directive(f, "dynamic-cookie-key", backend.dynamic_cookie_key.as_ref())?;
    if let Some(table) = &backend.stick_table {
        let mut line = format!(
            "stick-table type {} size {} expire {} store {}",
            table.kind, table.size, table.expire, table.store
        );
        if let Some(peers) = &table.peers {
            let _ = write!(line, " peers {peers}");
        }
        directive(f, line)?;
    }
    write_timeouts(f, &backend.timeouts)?;
    for acl in &backend.acls {
        match &acl.value {
            Some(value) => directive(f, format_args!("acl {} {} {value}", acl.name, acl.criterion))?,
            None => directive(f, format_args!("acl {} {}", acl.name, acl.criterion))?,
        }
    }
    for rule in &backend.http_request_rules {
        directive(f, rule_line("http-request", rule))?;
    }
    if !backend.default_server.is_empty() {
        let server = &backend.default_server;
        let mut line = String::from("default-server");
        if server.check {
            line.push_str(" check");
        }
        if let Some(inter) = server.inter {
            let _ = write!(line, " inter {inter}");
        }
        if let Some(maxconn) = server.maxconn {
            let _ = write!(line, " maxconn {maxconn}");
        }
        if let Some(send_proxy) = &server.send_proxy {
            let _ = write!(line, " {send_proxy}");
        }
        if server.ssl {
            line.push_str(" ssl");
            if let Some(verify) = &server.verify {
                let _ = write!(line, " verify {verify}");
            }
            if let Some(ca) = &server.ca_file {
                let _ = write!(line, " ca-file {ca}");
            }
            if let Some(crt) = &server.crt {
                let _ = write!(line, " crt {crt}");
            }
            if let Some(alpn) = &server.alpn {
                let _ = write!(line, " alpn {alpn}");
            }
        }
        if let Some(proto) = &server.proto {
            let _ = write!(line, " proto {proto}");
        }
        if let Some(init_addr) = &server.init_addr {
            let _ = write!(line, " init-addr {init_addr}");
        }
        directive(f, line)?;
    }
    write_snippet(f, &backend.config_snippets)?;
    for server in &backend.servers {
        directive(f, server_line(server))?;
    }
    writeln!(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Balance, Cookie, Errorfile, Mode, RuntimeApi};
    use assertables::assert_contains;

    fn sample() -> Configuration {
        let mut config = Configuration::default();
        config.global.daemon = true;
        config.global.master_worker = true;
        config.global.runtime_apis.push(RuntimeApi {
            address: "/var/run/haproxy-runtime-api.sock".to_string(),
            level: "admin".to_string(),
            expose_fd_listeners: true,
        });
        config.log_targets.push(LogTarget {
            address: "127.0.0.1".to_string(),
            port: Some(514),
            facility: Some("local0".to_string()),
            level: Some("notice".to_string()),
            ..LogTarget::default()
        });
        config.defaults.errorfiles.push(Errorfile {
            code: 503,
            file: "/etc/haproxy/errorfiles/503".to_string(),
        });

        let mut http = Frontend::new("http", Mode::Http);
        http.set_bind(Bind::new("v4", "0.0.0.0", Some(80)));
        http.default_backend = Some("default_local-service_http".to_string());
        config.frontends.insert(http.name.clone(), http);

        let mut https = Frontend::new("https", Mode::Http);
        let mut bind = Bind::new("v4", "0.0.0.0", Some(443));
        bind.ssl = true;
        bind.ssl_certificate = Some("/etc/haproxy/certs/frontend".to_string());
        bind.alpn = Some("h2,http/1.1".to_string());
        https.set_bind(bind);
        config.frontends.insert(https.name.clone(), https);

        let mut backend = Backend::new("default_app_http", Mode::Http);
        backend.balance = Some(Balance::new("roundrobin"));
        backend.cookie = Some(Cookie {
            name: "SRV".to_string(),
            kind: "insert".to_string(),
            indirect: true,
            nocache: true,
            dynamic: true,
        });
        backend.default_server.check = true;
        backend.set_server(Server::new("SRV_1", "10.0.0.1", Some(8080)));
        let mut disabled = Server::new("SRV_2", "127.0.0.1", Some(1));
        disabled.disabled = true;
        backend.set_server(disabled);
        config.backends.insert(backend.name.clone(), backend);
        config
    }

    #[test]
    fn test_section_order() {
        let text = render(&sample());
        let global = text.find("global\n");
        let defaults = text.find("defaults haproxytech\n");
        let http = text.find("frontend http\n");
        let https = text.find("frontend https\n");
        let backend = text.find("backend default_app_http\n");
        assert!(global < defaults);
        assert!(defaults < http);
        assert!(http < https);
        assert!(https < backend);
    }

    #[test]
    fn test_rendered_directives() {
        let text = render(&sample());
        assert_contains!(
            text,
            "  stats socket /var/run/haproxy-runtime-api.sock level admin expose-fd listeners\n"
        );
        assert_contains!(text, "  log 127.0.0.1:514 local0 notice\n");
        assert_contains!(text, "  errorfile 503 /etc/haproxy/errorfiles/503\n");
        assert_contains!(
            text,
            "  bind 0.0.0.0:443 name v4 ssl crt /etc/haproxy/certs/frontend alpn h2,http/1.1\n"
        );
        assert_contains!(text, "  default_backend default_local-service_http\n");
        assert_contains!(text, "  cookie SRV insert indirect nocache dynamic\n");
        assert_contains!(text, "  server SRV_1 10.0.0.1:8080 enabled\n");
        assert_contains!(text, "  server SRV_2 127.0.0.1:1 disabled\n");
        assert_contains!(text, "  default-server check\n");
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(&sample()), render(&sample()));
    }
}
