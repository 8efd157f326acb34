//! Configuration HAProxy starts with and the parts of it every pass
//! rebuilds: the host and path lookup rules and the listener binds.

use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::configuration::{Configuration, TransactionError};
use haproxy_ingress_dataplane::env::{
    Env, FRONT_HEALTHZ, FRONT_HTTP, FRONT_HTTPS, FRONT_STATS, set_defaults, set_global,
};
use haproxy_ingress_dataplane::maps::{
    MAP_HOST, MAP_HOST_END, MAP_PATH_EXACT, MAP_PATH_PREFIX, MAP_PATH_REGEX,
};
use haproxy_ingress_dataplane::models::{
    Bind, Frontend, Mode, PeerEntry, Peers, Stats,
};
use haproxy_ingress_dataplane::rules::{ReqSetVar, Rule, SetHdr};
use tracing::debug;

const LOCAL_PEERS: &str = "localinstance";
const LOCAL_PEER_PORT: u16 = 10000;
const STATS_REFRESH_MS: u64 = 10_000;

/// `global`, `defaults`, local peers and the `http`, `https`, `healthz` and
/// `stats` frontends, without binds.
pub fn base_configuration(env: &Env) -> Configuration {
    let mut config = Configuration::default();
    set_global(&mut config.global, &mut config.log_targets, env);
    set_defaults(&mut config.defaults);
    config.peers.insert(
        LOCAL_PEERS.to_string(),
        Peers {
            name: LOCAL_PEERS.to_string(),
            entries: vec![PeerEntry {
                name: "local".to_string(),
                address: "127.0.0.1".to_string(),
                port: LOCAL_PEER_PORT,
            }],
        },
    );
    for name in [FRONT_HTTP, FRONT_HTTPS] {
        config
            .frontends
            .insert(name.to_string(), Frontend::new(name, Mode::Http));
    }
    config.frontends.insert(
        FRONT_HEALTHZ.to_string(),
        Frontend {
            monitor_uri: Some("/healthz".to_string()),
            dontlog_normal: true,
            ..Frontend::new(FRONT_HEALTHZ, Mode::Http)
        },
    );
    config.frontends.insert(
        FRONT_STATS.to_string(),
        Frontend {
            stats: Some(Stats {
                uri: "/".to_string(),
                refresh: Some(STATS_REFRESH_MS),
            }),
            ..Frontend::new(FRONT_STATS, Mode::Http)
        },
    );
    config
}

fn set_var(name: &str, expression: String, cond_test: Option<String>) -> Rule {
    Rule::from(ReqSetVar {
        name: name.to_string(),
        scope: "txn".to_string(),
        expression,
        cond_test,
    })
}

/// Host and path lookup feeding `txn.path_match`, registered again on each
/// pass since rules not registered are deleted.
pub fn add_base_rules(haproxy: &mut HAProxy) {
    let map = |name: &str| haproxy.maps().path(name).display().to_string();
    let (host, host_end) = (map(MAP_HOST), map(MAP_HOST_END));
    let (exact, prefix, regex) = (map(MAP_PATH_EXACT), map(MAP_PATH_PREFIX), map(MAP_PATH_REGEX));
    let not_found = |var: &str| format!("!{{ var(txn.{var}) -m found }}");
    let host_path = "var(txn.host_match),concat(,txn.path,)";

    let rules = [
        set_var("base", "base".to_string(), None),
        set_var("path", "path".to_string(), None),
        set_var("host", "req.hdr(Host),field(1,:),lower".to_string(), None),
        set_var("host_match", format!("var(txn.host),map({host})"), None),
        set_var(
            "host_match",
            format!("var(txn.host),regsub(^[^.]*,,),map({host_end},'')"),
            Some(not_found("host_match")),
        ),
        set_var("path_match", format!("{host_path},map({exact})"), None),
        set_var(
            "path_match",
            format!("{host_path},map_reg({regex})"),
            Some(not_found("path_match")),
        ),
        set_var(
            "path_match",
            format!("{host_path},map_beg({prefix})"),
            Some(not_found("path_match")),
        ),
    ];
    haproxy.add_rule(FRONT_HTTPS, SetHdr::forwarded_proto(), false);
    for frontend in [FRONT_HTTP, FRONT_HTTPS] {
        for rule in &rules {
            haproxy.add_rule(frontend, rule.clone(), false);
        }
    }
}

/// Replaces the binds of `frontend`. Returns true on change.
pub fn set_binds(
    config: &mut Configuration,
    frontend: &str,
    binds: Vec<Bind>,
) -> Result<bool, TransactionError> {
    let frontend = config.frontend_mut(frontend)?;
    if frontend.binds == binds {
        return Ok(false);
    }
    debug!(frontend = %frontend.name, "binds updated");
    frontend.binds = binds;
    Ok(true)
}

/// Binds of the `healthz` and `stats` frontends, exposed once the first
/// configuration is committed.
pub fn status_binds(healthz_port: u16, stats_port: u16, ipv6: bool) -> [(&'static str, Vec<Bind>); 2] {
    let mut healthz = vec![Bind::new("v4", "0.0.0.0", Some(healthz_port))];
    if ipv6 {
        healthz.push(Bind {
            v4v6: true,
            ..Bind::new("v6", ":::", Some(healthz_port))
        });
    }
    let stats = vec![Bind::new("stats", "*", Some(stats_port))];
    [(FRONT_HEALTHZ, healthz), (FRONT_STATS, stats)]
}
