//! Backend selection. Ingress hosts and paths become rows of the routing
//! maps looked up by the base rules; services carrying `route-acl` get a
//! `use_backend` rule of their own instead.

use crate::store::{IngressPath, PathType};
use haproxy_ingress_dataplane::configuration::{Configuration, TransactionError};
use haproxy_ingress_dataplane::env::{FRONT_HTTP, FRONT_HTTPS};
use haproxy_ingress_dataplane::instance::Instance;
use haproxy_ingress_dataplane::maps::{
    MAP_HOST, MAP_HOST_END, MAP_PATH_EXACT, MAP_PATH_PREFIX, MAP_PATH_REGEX, MAP_SNI, Maps, row,
};
use haproxy_ingress_dataplane::models::BackendSwitchingRule;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Backend chosen from the value of the matched route. Values are
/// `<backend>.<rule-id>...`, the first field is the backend.
pub const MAIN_SWITCHING_BACKEND: &str = "%[var(txn.path_match),field(1,.)]";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("backend name missing")]
    MissingBackend,
    #[error("empty SNI for backend '{0}'")]
    EmptySni(String),
    #[error("neither host nor path provided for backend '{0}'")]
    NoHostNorPath(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// One host and path of an ingress pointing at a backend.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub host: &'a str,
    pub path: &'a IngressPath,
    pub backend: &'a str,
    /// Ids of the ingress rules, appended to the map value so the rules can
    /// tell which routes they belong to.
    pub rule_ids: &'a [String],
    pub ssl_passthrough: bool,
    /// `ImplementationSpecific` paths are regular expressions.
    pub path_regex: bool,
}

impl Route<'_> {
    fn value(&self) -> String {
        std::iter::once(self.backend)
            .chain(self.rule_ids.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Adds the map rows of `route`. A wildcard host `*.example.com` matches on
/// its `.example.com` suffix.
pub fn add_host_path_route(route: &Route<'_>, maps: &mut Maps) -> Result<(), RouteError> {
    if route.backend.is_empty() {
        return Err(RouteError::MissingBackend);
    }
    let (host, wildcard) = match route.host.strip_prefix('*') {
        Some(suffix) => (suffix, true),
        None => (route.host, false),
    };
    let value = route.value();

    if route.ssl_passthrough {
        if host.is_empty() {
            return Err(RouteError::EmptySni(route.backend.to_string()));
        }
        maps.append(MAP_SNI, row(host, &value));
    }

    if wildcard {
        maps.append(MAP_HOST_END, row(host, host));
    } else if !host.is_empty() {
        maps.append(MAP_HOST, row(host, host));
    } else if route.path.path.is_empty() {
        return Err(RouteError::NoHostNorPath(route.backend.to_string()));
    }

    let path = route.path.path.as_str();
    match route.path.path_type {
        PathType::Exact => maps.append(MAP_PATH_EXACT, row(&format!("{host}{path}"), &value)),
        PathType::ImplementationSpecific if route.path_regex => {
            let pattern = format!(
                "^{}{}",
                regex::escape(host),
                path.strip_prefix('^').unwrap_or(path)
            );
            maps.append(MAP_PATH_REGEX, row(&pattern, &value));
        }
        _ if path.is_empty() || path == "/" => {
            maps.append(MAP_PATH_PREFIX, row(&format!("{host}/"), &value));
        }
        PathType::Prefix | PathType::ImplementationSpecific => {
            let path = path.trim_end_matches('/');
            maps.append(MAP_PATH_EXACT, row(&format!("{host}{path}"), &value));
            maps.append(MAP_PATH_PREFIX, row(&format!("{host}{path}/"), &value));
        }
    }
    Ok(())
}

/// `use_backend` rules of services carrying `route-acl`, tracked across
/// passes to detect changes.
#[derive(Debug, Default)]
pub struct CustomRoutes {
    previous: BTreeMap<String, String>,
    current: BTreeMap<String, String>,
}

impl CustomRoutes {
    /// Leaves only the main switching rule on the HTTP frontends.
    pub fn reset(&mut self, config: &mut Configuration) -> Result<(), TransactionError> {
        for name in [FRONT_HTTP, FRONT_HTTPS] {
            let frontend = config.frontend_mut(name)?;
            frontend.backend_switching_rules = vec![BackendSwitchingRule {
                backend: MAIN_SWITCHING_BACKEND.to_string(),
                cond: String::new(),
            }];
        }
        self.current.clear();
        Ok(())
    }

    /// Routes `route` with `acl` ahead of the map based selection.
    pub fn add(
        &mut self,
        route: &Route<'_>,
        acl: &str,
        config: &mut Configuration,
    ) -> Result<(), RouteError> {
        if route.backend.is_empty() {
            return Err(RouteError::MissingBackend);
        }
        let cond = custom_route_cond(route, acl);
        for name in [FRONT_HTTP, FRONT_HTTPS] {
            let frontend = config.frontend_mut(name)?;
            frontend.backend_switching_rules.insert(
                0,
                BackendSwitchingRule {
                    backend: route.backend.to_string(),
                    cond: cond.clone(),
                },
            );
        }
        debug!(backend = route.backend, "custom route added");
        self.current.insert(route.backend.to_string(), cond);
        Ok(())
    }

    /// Closes the pass. A changed set of custom routes needs a reload.
    pub fn finish(&mut self, instance: &mut Instance) {
        let current = std::mem::take(&mut self.current);
        instance.reload_if(current != self.previous, "custom routes changed");
        self.previous = current;
    }
}

fn custom_route_cond(route: &Route<'_>, acl: &str) -> String {
    let mut parts = Vec::new();
    if !route.host.is_empty() {
        parts.push(format!("{{ var(txn.host) -m str {} }}", route.host));
    }
    let path = &route.path.path;
    if !path.is_empty() {
        if route.path.path_type == PathType::Exact {
            parts.push(format!("{{ path {path} }}"));
        } else {
            parts.push(format!("{{ path -m beg {path} }}"));
        }
    }
    parts.push(format!("{{ {acl} }}"));
    parts.join(" ")
}
