//! Processors of the `global` and `defaults` sections, fed from the main
//! config map.

use super::{AnnotationError, Context, Processor, Values, lines, parse_bool, parse_number};
use haproxy_ingress_api::v3::{
    DefaultsSpec, GlobalSpec, HttpConnectionMode as ApiConnectionMode, ProxyMode,
};
use haproxy_ingress_dataplane::models::{
    Defaults, Global, HttpConnectionMode, LogTarget, Mode, Timeouts,
};
use std::str::FromStr;
use tracing::warn;

/// Global section fragment controlled by annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSection {
    pub global: Global,
    pub log_targets: Vec<LogTarget>,
    pub snippet: Vec<String>,
}

pub static GLOBAL_PROCESSORS: [Processor<GlobalSection>; 5] = [
    Processor::new("syslog-server", syslog_server),
    Processor::new("nbthread", nbthread),
    Processor::new("maxconn", maxconn),
    Processor::new("hard-stop-after", hard_stop_after),
    Processor::new("global-config-snippet", global_snippet),
];

pub static DEFAULTS_PROCESSORS: [Processor<Defaults>; 15] = [
    Processor::new("dontlognull", dontlognull),
    Processor::new("logasap", logasap),
    Processor::new("log-format", log_format),
    Processor::new("http-connection-mode", http_connection_mode),
    Processor::new("http-server-close", legacy_connection_mode),
    Processor::new("http-keep-alive", legacy_connection_mode),
    Processor::new("timeout-http-request", timeout),
    Processor::new("timeout-connect", timeout),
    Processor::new("timeout-client", timeout),
    Processor::new("timeout-client-fin", timeout),
    Processor::new("timeout-queue", timeout),
    Processor::new("timeout-server", timeout),
    Processor::new("timeout-server-fin", timeout),
    Processor::new("timeout-tunnel", timeout),
    Processor::new("timeout-http-keep-alive", timeout),
];

fn syslog_server(
    section: &mut GlobalSection,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let targets = lines(value)
        .map(parse_log_target)
        .collect::<Result<Vec<_>, _>>()?;
    section.log_targets = targets;
    Ok(())
}

/// One `key:value, key:value` line of `syslog-server`.
fn parse_log_target(line: &str) -> Result<LogTarget, AnnotationError> {
    let mut target = LogTarget::default();
    for param in line.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((key, value)) = param.split_once(':') else {
            return Err(AnnotationError::invalid(format!(
                "incorrect syslog param '{param}' in '{line}'"
            )));
        };
        let value = value.trim();
        match key.trim() {
            "address" => target.address = value.to_string(),
            "port" => target.port = Some(parse_number(value)?),
            "length" => target.length = Some(parse_number(value)?),
            "format" => target.format = Some(value.to_string()),
            "facility" => target.facility = Some(value.to_string()),
            "level" => target.level = Some(value.to_string()),
            "minlevel" => target.minlevel = Some(value.to_string()),
            other => {
                return Err(AnnotationError::invalid(format!(
                    "unknown syslog param '{other}' in '{line}'"
                )));
            }
        }
    }
    if target.address.is_empty() {
        return Err(AnnotationError::invalid(format!(
            "syslog address missing in '{line}'"
        )));
    }
    Ok(target)
}

fn nbthread(
    section: &mut GlobalSection,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    section.global.nbthread = values.number(name)?;
    Ok(())
}

fn maxconn(
    section: &mut GlobalSection,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    section.global.maxconn = values.number(name)?;
    Ok(())
}

fn hard_stop_after(
    section: &mut GlobalSection,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    section.global.hard_stop_after = values.duration(name)?;
    Ok(())
}

fn global_snippet(
    section: &mut GlobalSection,
    name: &'static str,
    values: &Values<'_>,
    ctx: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    if ctx.disabled_snippets.global {
        return Err(AnnotationError::SnippetDisabled);
    }
    section.snippet = lines(value).map(str::to_string).collect();
    Ok(())
}

fn dontlognull(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        defaults.dontlognull = parse_bool(value)?;
    }
    Ok(())
}

fn logasap(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    if let Some(value) = values.explicit(name) {
        defaults.logasap = parse_bool(value)?;
    }
    Ok(())
}

fn log_format(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    defaults.log_format = Some(quote_log_format(value));
    Ok(())
}

/// Log formats hold spaces, so they are always written quoted.
pub fn quote_log_format(value: &str) -> String {
    let value = value.trim();
    let quoted = (value.starts_with('\'') && value.ends_with('\'') && value.len() > 1)
        || (value.starts_with('"') && value.ends_with('"') && value.len() > 1);
    if quoted {
        value.to_string()
    } else {
        format!("'{value}'")
    }
}

fn http_connection_mode(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    let mode = HttpConnectionMode::from_str(value).map_err(|_| {
        AnnotationError::invalid(format!(
            "'{value}' is not one of http-keep-alive, http-server-close, httpclose"
        ))
    })?;
    defaults.http_connection_mode = Some(mode);
    Ok(())
}

/// `http-server-close` and `http-keep-alive` booleans, only honoured when
/// `http-connection-mode` is not set.
fn legacy_connection_mode(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.explicit(name) else {
        return Ok(());
    };
    warn!("annotation '{name}' is deprecated, use 'http-connection-mode'");
    if values.explicit("http-connection-mode").is_some() {
        return Ok(());
    }
    if parse_bool(value)? {
        defaults.http_connection_mode = Some(if name == "http-server-close" {
            HttpConnectionMode::HttpServerClose
        } else {
            HttpConnectionMode::HttpKeepAlive
        });
    }
    Ok(())
}

fn timeout(
    defaults: &mut Defaults,
    name: &'static str,
    values: &Values<'_>,
    _: &Context<'_>,
) -> Result<(), AnnotationError> {
    let Some(value) = values.duration(name)? else {
        return Ok(());
    };
    let timeouts = &mut defaults.timeouts;
    let field = match name {
        "timeout-http-request" => &mut timeouts.http_request,
        "timeout-connect" => &mut timeouts.connect,
        "timeout-client" => &mut timeouts.client,
        "timeout-client-fin" => &mut timeouts.client_fin,
        "timeout-queue" => &mut timeouts.queue,
        "timeout-server" => &mut timeouts.server,
        "timeout-server-fin" => &mut timeouts.server_fin,
        "timeout-tunnel" => &mut timeouts.tunnel,
        "timeout-http-keep-alive" => &mut timeouts.http_keep_alive,
        _ => return Err(AnnotationError::invalid(format!("unknown timeout '{name}'"))),
    };
    *field = Some(value);
    Ok(())
}

/// Global section of a `Global` custom resource. It replaces the
/// annotations entirely, the controller-owned values are enforced later.
pub fn global_from_cr(cr: &GlobalSpec) -> GlobalSection {
    let config = &cr.config;
    let global = Global {
        maxconn: config.maxconn,
        nbthread: config.nbthread,
        hard_stop_after: config.hard_stop_after,
        stats_timeout: config.stats_timeout,
        ssl_default_bind_ciphers: config.ssl_default_bind_ciphers.clone(),
        ssl_default_bind_ciphersuites: config.ssl_default_bind_ciphersuites.clone(),
        ssl_default_bind_options: config.ssl_default_bind_options.clone(),
        ssl_default_server_ciphers: config.ssl_default_server_ciphers.clone(),
        tune_ssl_default_dh_param: config.tune_ssl_default_dh_param,
        ..Global::default()
    };
    let log_targets = cr
        .log_targets
        .iter()
        .filter_map(|target| {
            let address = if target.global {
                "global".to_string()
            } else {
                target.address.clone().filter(|address| !address.is_empty())?
            };
            Some(LogTarget {
                address,
                port: target.port,
                length: target.length,
                format: target.format.clone(),
                facility: target.facility.clone(),
                level: target.level.clone(),
                minlevel: target.minlevel.clone(),
            })
        })
        .collect();
    GlobalSection {
        global,
        log_targets,
        snippet: Vec::new(),
    }
}

/// Defaults section of a `Defaults` custom resource.
pub fn defaults_from_cr(cr: &DefaultsSpec) -> Defaults {
    let config = &cr.config;
    Defaults {
        mode: match config.mode {
            Some(ProxyMode::Tcp) => Mode::Tcp,
            _ => Mode::Http,
        },
        maxconn: config.maxconn,
        log_format: config.log_format.as_deref().map(quote_log_format),
        dontlognull: config.dontlognull.unwrap_or_default(),
        logasap: config.logasap.unwrap_or_default(),
        forwardfor: config.forwardfor.unwrap_or_default(),
        http_connection_mode: config.http_connection_mode.map(|mode| match mode {
            ApiConnectionMode::HttpKeepAlive => HttpConnectionMode::HttpKeepAlive,
            ApiConnectionMode::HttpServerClose => HttpConnectionMode::HttpServerClose,
            ApiConnectionMode::Httpclose => HttpConnectionMode::Httpclose,
        }),
        timeouts: Timeouts {
            client: config.client_timeout,
            client_fin: config.client_fin_timeout,
            connect: config.connect_timeout,
            http_keep_alive: config.http_keep_alive_timeout,
            http_request: config.http_request_timeout,
            queue: config.queue_timeout,
            server: config.server_timeout,
            server_fin: config.server_fin_timeout,
            tunnel: config.tunnel_timeout,
            check: None,
        },
        ..Defaults::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::process;
    use crate::annotations::tests::{annotations, context};
    use crate::store::{K8s, StoreParams};
    use assertables::assert_ok;
    use rstest::rstest;

    fn global(pairs: &[(&str, &str)]) -> GlobalSection {
        let store = K8s::new(StoreParams::default());
        let config_map = annotations(pairs);
        let mut section = GlobalSection::default();
        process(
            &GLOBAL_PROCESSORS,
            &mut section,
            &Values::new([&config_map]),
            &context(&store, None),
            "configmap",
        );
        section
    }

    fn defaults(pairs: &[(&str, &str)]) -> Defaults {
        let store = K8s::new(StoreParams::default());
        let config_map = annotations(pairs);
        let mut defaults = Defaults::default();
        process(
            &DEFAULTS_PROCESSORS,
            &mut defaults,
            &Values::new([&config_map]),
            &context(&store, None),
            "configmap",
        );
        defaults
    }

    #[test]
    fn test_global_values() {
        let section = global(&[
            ("maxconn", "1111"),
            ("nbthread", "4"),
            ("hard-stop-after", "30m"),
        ]);
        assert_eq!(section.global.maxconn, Some(1111));
        assert_eq!(section.global.nbthread, Some(4));
        assert_eq!(section.global.hard_stop_after, Some(1_800_000));
    }

    #[test]
    fn test_invalid_value_skips_only_that_annotation() {
        let section = global(&[("maxconn", "lots"), ("nbthread", "2")]);
        assert_eq!(section.global.maxconn, None);
        assert_eq!(section.global.nbthread, Some(2));
    }

    #[test]
    fn test_syslog_server_lines() {
        let section = global(&[(
            "syslog-server",
            "address:192.168.1.1, port:514, facility:local1, level:info\naddress:stdout, format:raw",
        )]);
        assert_eq!(
            section.log_targets,
            vec![
                LogTarget {
                    address: "192.168.1.1".to_string(),
                    port: Some(514),
                    facility: Some("local1".to_string()),
                    level: Some("info".to_string()),
                    ..LogTarget::default()
                },
                LogTarget {
                    address: "stdout".to_string(),
                    format: Some("raw".to_string()),
                    ..LogTarget::default()
                },
            ]
        );
    }

    #[rstest]
    #[case("port:514")]
    #[case("address:10.0.0.1, colour:blue")]
    #[case("address:10.0.0.1, port:high")]
    #[case("address")]
    fn test_syslog_server_rejects(#[case] line: &str) {
        assert!(parse_log_target(line).is_err());
    }

    #[test]
    fn test_ipv6_syslog_address() {
        let target = assert_ok!(parse_log_target("address:2001:db8::1, port:514"));
        assert_eq!(target.address, "2001:db8::1");
        assert_eq!(target.port, Some(514));
    }

    #[test]
    fn test_global_snippet_disabled() {
        let store = K8s::new(StoreParams::default());
        let config_map = annotations(&[("global-config-snippet", "tune.bufsize 32768")]);
        let mut ctx = context(&store, None);
        let mut section = GlobalSection::default();
        let values = Values::new([&config_map]);
        assert_ok!(global_snippet(&mut section, "global-config-snippet", &values, &ctx));
        assert_eq!(section.snippet, vec!["tune.bufsize 32768"]);

        ctx.disabled_snippets.global = true;
        let mut section = GlobalSection::default();
        assert_eq!(
            global_snippet(&mut section, "global-config-snippet", &values, &ctx),
            Err(AnnotationError::SnippetDisabled)
        );
        assert!(section.snippet.is_empty());
    }

    #[test]
    fn test_defaults_timeouts_and_logging() {
        let defaults = defaults(&[
            ("timeout-connect", "5s"),
            ("timeout-http-keep-alive", "1m"),
            ("timeout-queue", "bad"),
            ("dontlognull", "true"),
            ("log-format", "%ci:%cp %ST"),
        ]);
        assert_eq!(defaults.timeouts.connect, Some(5_000));
        assert_eq!(defaults.timeouts.http_keep_alive, Some(60_000));
        assert_eq!(defaults.timeouts.queue, None);
        assert!(defaults.dontlognull);
        assert_eq!(defaults.log_format.as_deref(), Some("'%ci:%cp %ST'"));
    }

    #[rstest]
    #[case(&[("http-connection-mode", "httpclose")], Some(HttpConnectionMode::Httpclose))]
    #[case(&[("http-connection-mode", "bogus")], None)]
    #[case(&[("http-server-close", "true")], Some(HttpConnectionMode::HttpServerClose))]
    #[case(&[("http-keep-alive", "true")], Some(HttpConnectionMode::HttpKeepAlive))]
    #[case(
        &[("http-server-close", "true"), ("http-connection-mode", "http-keep-alive")],
        Some(HttpConnectionMode::HttpKeepAlive)
    )]
    fn test_connection_mode(
        #[case] pairs: &[(&str, &str)],
        #[case] expected: Option<HttpConnectionMode>,
    ) {
        assert_eq!(defaults(pairs).http_connection_mode, expected);
    }

    #[test]
    fn test_global_custom_resource() {
        let cr = GlobalSpec {
            config: haproxy_ingress_api::v3::GlobalConfig {
                maxconn: Some(2000),
                hard_stop_after: Some(60_000),
                ..Default::default()
            },
            log_targets: vec![
                haproxy_ingress_api::v3::LogTarget {
                    address: Some("10.0.0.9".to_string()),
                    port: Some(514),
                    ..Default::default()
                },
                haproxy_ingress_api::v3::LogTarget {
                    global: true,
                    ..Default::default()
                },
                haproxy_ingress_api::v3::LogTarget::default(),
            ],
        };
        let section = global_from_cr(&cr);
        assert_eq!(section.global.maxconn, Some(2000));
        assert_eq!(section.global.hard_stop_after, Some(60_000));
        let addresses = section
            .log_targets
            .iter()
            .map(|target| target.address.as_str())
            .collect::<Vec<_>>();
        assert_eq!(addresses, ["10.0.0.9", "global"]);
    }

    #[test]
    fn test_defaults_custom_resource() {
        let cr = DefaultsSpec {
            config: haproxy_ingress_api::v3::DefaultsConfig {
                mode: Some(ProxyMode::Tcp),
                log_format: Some("%ci %b".to_string()),
                http_connection_mode: Some(ApiConnectionMode::HttpServerClose),
                server_timeout: Some(30_000),
                dontlognull: Some(true),
                ..Default::default()
            },
        };
        let defaults = defaults_from_cr(&cr);
        assert_eq!(defaults.mode, Mode::Tcp);
        assert_eq!(defaults.log_format.as_deref(), Some("'%ci %b'"));
        assert_eq!(
            defaults.http_connection_mode,
            Some(HttpConnectionMode::HttpServerClose)
        );
        assert_eq!(defaults.timeouts.server, Some(30_000));
        assert!(defaults.dontlognull);
        assert!(defaults.errorfiles.is_empty());
    }

    #[rstest]
    #[case("%ci %b", "'%ci %b'")]
    #[case("'%ci %b'", "'%ci %b'")]
    #[case("\"%ci\"", "\"%ci\"")]
    fn test_quote_log_format(#[case] value: &str, #[case] expected: &str) {
        assert_eq!(quote_log_format(value), expected);
    }
}
