//! Gateway API support limited to TCP.
//!
//! Every TCP listener of a Gateway whose class is managed by this controller
//! becomes a frontend named `<ns>-<gateway>-<listener>`. A TCPRoute attached
//! to listeners through its parent references becomes the backend
//! `<ns>_tcproute_<name>`, filled with the endpoints of its backend
//! references. When several routes attach to the same listener the oldest
//! one is its default backend.

use crate::annotations::Settings;
use crate::handlers::{BindAddresses, Handler, HandlerError};
use crate::store::{
    BackendRef, FromNamespaces, Gateway, K8s, Listener, ParentRef, Status, TcpRoute,
};
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::models::{Backend, DefaultServer, Frontend, Mode, Server};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

pub const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";
pub const TCP_ROUTE_KIND: &str = "TCPRoute";
pub const SERVICE_KIND: &str = "Service";
const TCP_PROTOCOL: &str = "TCP";

pub fn frontend_name(namespace: &str, gateway: &str, listener: &str) -> String {
    format!("{namespace}-{gateway}-{listener}")
}

pub fn backend_name(route: &TcpRoute) -> String {
    format!("{}_tcproute_{}", route.namespace, route.name)
}

fn is_tcp_route_kind(group: &str, kind: &str) -> bool {
    (group.is_empty() || group == GATEWAY_GROUP) && kind == TCP_ROUTE_KIND
}

/// A listener accepts TCPRoutes when it names no kinds or at least one
/// valid TCPRoute kind.
fn accepts_tcp_routes(listener: &Listener) -> bool {
    listener.allowed_kinds.is_empty()
        || listener
            .allowed_kinds
            .iter()
            .any(|kind| is_tcp_route_kind(&kind.group, &kind.kind))
}

/// Label selector match. An empty selector matches every namespace.
fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// A TCP listener of a managed gateway.
#[derive(Debug, Clone)]
struct ManagedListener {
    frontend: String,
    gateway_namespace: String,
    gateway: String,
    listener: Listener,
}

#[derive(Debug, Default)]
pub struct GatewayManager {
    addresses: BindAddresses,
    /// Frontends created for listeners.
    frontends: BTreeSet<String>,
}

impl GatewayManager {
    pub fn new(addresses: BindAddresses) -> Self {
        Self {
            addresses,
            frontends: BTreeSet::new(),
        }
    }

    fn is_managed(store: &K8s, gateway: &Gateway) -> bool {
        if gateway.status == Status::Deleted {
            return false;
        }
        match store.gateway_classes.get(&gateway.class_name) {
            Some(class) => {
                class.status != Status::Deleted
                    && class.controller_name == store.gateway_controller_name
            }
            None => {
                debug!(
                    "gwapi: gateway class '{}' of gateway '{}/{}' is not managed",
                    gateway.class_name, gateway.namespace, gateway.name
                );
                false
            }
        }
    }

    /// TCP listeners of managed gateways in relevant namespaces, keyed by
    /// frontend name.
    fn listeners(store: &K8s) -> BTreeMap<String, ManagedListener> {
        let mut listeners = BTreeMap::new();
        for ns in store.namespaces.values().filter(|ns| ns.relevant) {
            for gateway in ns.gateways.values() {
                if !Self::is_managed(store, gateway) {
                    continue;
                }
                for listener in &gateway.listeners {
                    if listener.protocol != TCP_PROTOCOL {
                        warn!(
                            "gwapi: listener '{}' of gateway '{}/{}': protocol '{}' is not supported",
                            listener.name, gateway.namespace, gateway.name, listener.protocol
                        );
                        continue;
                    }
                    if !accepts_tcp_routes(listener) {
                        warn!(
                            "gwapi: listener '{}' of gateway '{}/{}' allows no TCPRoute kind",
                            listener.name, gateway.namespace, gateway.name
                        );
                        continue;
                    }
                    let frontend = frontend_name(&gateway.namespace, &gateway.name, &listener.name);
                    listeners.insert(
                        frontend.clone(),
                        ManagedListener {
                            frontend,
                            gateway_namespace: gateway.namespace.clone(),
                            gateway: gateway.name.clone(),
                            listener: listener.clone(),
                        },
                    );
                }
            }
        }
        listeners
    }

    fn route_allowed(store: &K8s, listener: &ManagedListener, route: &TcpRoute) -> bool {
        match listener.listener.from_namespaces {
            FromNamespaces::All => true,
            FromNamespaces::Same => route.namespace == listener.gateway_namespace,
            FromNamespaces::Selector => store.namespaces.get(&route.namespace).is_some_and(|ns| {
                selector_matches(&listener.listener.namespace_selector, &ns.labels)
            }),
        }
    }

    /// Frontends of the listeners a route attaches to.
    fn attached(
        store: &K8s,
        listeners: &BTreeMap<String, ManagedListener>,
        route: &TcpRoute,
    ) -> BTreeSet<String> {
        let matches = |parent: &ParentRef, candidate: &ManagedListener| {
            let namespace = parent.namespace.as_deref().unwrap_or(&route.namespace);
            candidate.gateway_namespace == namespace
                && candidate.gateway == parent.name
                && parent
                    .section_name
                    .as_ref()
                    .is_none_or(|section| *section == candidate.listener.name)
                && parent.port.is_none_or(|port| port == candidate.listener.port)
        };
        let mut frontends = BTreeSet::new();
        for parent in &route.parent_refs {
            for candidate in listeners.values().filter(|candidate| matches(parent, candidate)) {
                if Self::route_allowed(store, candidate, route) {
                    frontends.insert(candidate.frontend.clone());
                } else {
                    debug!(
                        "gwapi: tcproute '{}/{}' not allowed by listener '{}'",
                        route.namespace, route.name, candidate.frontend
                    );
                }
            }
        }
        frontends
    }

    /// Whether a ReferenceGrant of the backend namespace lets routes of
    /// `route_namespace` reference the service.
    fn is_granted(store: &K8s, route_namespace: &str, namespace: &str, service: &str) -> bool {
        let Some(ns) = store.namespaces.get(namespace).filter(|ns| ns.relevant) else {
            return false;
        };
        ns.reference_grants
            .values()
            .filter(|grant| grant.status != Status::Deleted)
            .any(|grant| {
                grant.from.iter().any(|from| {
                    from.group == GATEWAY_GROUP
                        && from.kind == TCP_ROUTE_KIND
                        && from.namespace == route_namespace
                }) && grant.to.iter().any(|to| {
                    to.group.is_empty()
                        && to.kind == SERVICE_KIND
                        && to.name.as_deref().is_none_or(|name| name == service)
                })
            })
    }

    /// `address:port` pairs of a backend reference, or `None` when the
    /// reference cannot be used.
    fn endpoints(store: &K8s, route: &TcpRoute, reference: &BackendRef) -> Option<Vec<(String, u16)>> {
        let owner = format!("{}/{}", route.namespace, route.name);
        if reference
            .group
            .as_deref()
            .is_some_and(|group| !group.is_empty())
            || reference.kind.as_deref().is_some_and(|kind| kind != SERVICE_KIND)
        {
            error!(
                "gwapi: tcproute '{owner}': backend reference '{}' is not a service",
                reference.name
            );
            return None;
        }
        let Some(port) = reference.port else {
            error!(
                "gwapi: tcproute '{owner}': backend reference '{}' has no port",
                reference.name
            );
            return None;
        };
        let namespace = reference.namespace.as_deref().unwrap_or(&route.namespace);
        if namespace != route.namespace
            && !Self::is_granted(store, &route.namespace, namespace, &reference.name)
        {
            error!(
                "gwapi: tcproute '{owner}': backend '{namespace}/{}' not allowed by any referencegrant",
                reference.name
            );
            return None;
        }
        let service = match store.get_service(namespace, &reference.name) {
            Ok(service) => service,
            Err(err) => {
                error!("gwapi: tcproute '{owner}': {err}");
                return None;
            }
        };
        let Some(port_name) = service
            .ports
            .iter()
            .find(|svc_port| svc_port.port == port)
            .map(|svc_port| svc_port.name.as_str())
        else {
            error!(
                "gwapi: tcproute '{owner}': port {port} not found in service '{namespace}/{}'",
                reference.name
            );
            return None;
        };
        let slices = store
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.endpoints.get(&reference.name));
        let endpoints = slices
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|slice| slice.status != Status::Deleted)
            .filter_map(|slice| slice.ports.get(port_name))
            .flat_map(|port| port.addresses.iter().map(|address| (address.clone(), port.port)))
            .collect();
        Some(endpoints)
    }

    fn servers(store: &K8s, route: &TcpRoute) -> Vec<Server> {
        route
            .backend_refs
            .iter()
            .filter_map(|reference| Self::endpoints(store, route, reference))
            .flatten()
            .enumerate()
            .map(|(i, (address, port))| Server::new(format!("SRV_{}", i + 1), address, Some(port)))
            .collect()
    }

    fn configure_backend(
        store: &K8s,
        haproxy: &mut HAProxy,
        route: &TcpRoute,
    ) -> Result<String, HandlerError> {
        let name = backend_name(route);
        haproxy.backend_create_or_update(Backend {
            default_server: DefaultServer {
                check: true,
                ..DefaultServer::default()
            },
            ..Backend::new(&name, Mode::Tcp)
        })?;
        let servers = Self::servers(store, route);
        if servers.is_empty() {
            warn!(
                "gwapi: tcproute '{}/{}' has no usable endpoints",
                route.namespace, route.name
            );
        }
        let config = haproxy.config_mut()?;
        let Some(backend) = config.backends.get_mut(&name) else {
            return Ok(name);
        };
        if backend.servers != servers {
            backend.servers = servers;
            debug!("servers of backend '{name}' updated, reload required");
            haproxy
                .instance_mut()
                .reload(format!("backend '{name}' servers updated"));
        }
        Ok(name)
    }

    fn upsert_frontend(&self, haproxy: &mut HAProxy, listener: &ManagedListener, default_backend: Option<String>) -> Result<(), HandlerError> {
        let name = &listener.frontend;
        let binds = self.addresses.binds(listener.listener.port);
        let config = haproxy.config_mut()?;
        let reason = match config.frontends.get_mut(name) {
            Some(frontend) => {
                let before = frontend.clone();
                frontend.mode = Mode::Tcp;
                frontend.tcplog = true;
                frontend.binds = binds;
                frontend.default_backend = default_backend;
                (*frontend != before).then(|| format!("gateway frontend '{name}' updated"))
            }
            None => {
                config.frontends.insert(
                    name.clone(),
                    Frontend {
                        tcplog: true,
                        binds,
                        default_backend,
                        ..Frontend::new(name.as_str(), Mode::Tcp)
                    },
                );
                Some(format!("gateway frontend '{name}' created"))
            }
        };
        if let Some(reason) = reason {
            debug!("{reason}, reload required");
            haproxy.instance_mut().reload(reason);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for GatewayManager {
    fn name(&self) -> &'static str {
        "gateway api"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        let listeners = Self::listeners(store);

        let mut routes = Vec::new();
        for ns in store.namespaces.values().filter(|ns| ns.relevant) {
            for route in ns.tcp_routes.values() {
                if route.status == Status::Deleted {
                    continue;
                }
                if route.parent_refs.is_empty() || route.backend_refs.is_empty() {
                    warn!(
                        "gwapi: tcproute '{}/{}' needs parent and backend references",
                        route.namespace, route.name
                    );
                    continue;
                }
                routes.push(route);
            }
        }
        // Oldest first, so the first route seen by a listener owns it.
        routes.sort_by(|a, b| {
            (a.created, &a.namespace, &a.name).cmp(&(b.created, &b.namespace, &b.name))
        });

        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for route in routes {
            let frontends = Self::attached(store, &listeners, route);
            if frontends.is_empty() {
                debug!(
                    "gwapi: tcproute '{}/{}' is not attached to any listener",
                    route.namespace, route.name
                );
                continue;
            }
            let backend = match Self::configure_backend(store, haproxy, route) {
                Ok(backend) => backend,
                Err(err) => {
                    error!("gwapi: tcproute '{}/{}': {err}", route.namespace, route.name);
                    continue;
                }
            };
            for frontend in frontends {
                owners.entry(frontend).or_insert_with(|| backend.clone());
            }
        }

        for (name, listener) in &listeners {
            self.upsert_frontend(haproxy, listener, owners.get(name).cloned())?;
        }

        let required = listeners.into_keys().collect::<BTreeSet<_>>();
        for name in self.frontends.difference(&required) {
            if haproxy.config_mut()?.frontends.remove(name).is_some() {
                haproxy.rules_mut().delete_frontend(name);
                debug!("gateway frontend '{name}' deleted, reload required");
                haproxy
                    .instance_mut()
                    .reload(format!("gateway frontend '{name}' deleted"));
            }
        }
        self.frontends = required;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        GatewayClass, GrantFrom, GrantTo, NamespaceEvent, ReferenceGrant, RouteGroupKind, StoreParams,
    };
    use crate::testing::{endpoints, haproxy, service};
    use assertables::assert_ok;
    use chrono::DateTime;
    use rstest::rstest;
    use tempfile::tempdir;

    const CONTROLLER: &str = "haproxy.org/gateway-controller";

    fn listener(name: &str, port: u16, protocol: &str) -> Listener {
        Listener {
            name: name.to_string(),
            port,
            protocol: protocol.to_string(),
            ..Listener::default()
        }
    }

    fn gateway(namespace: &str, name: &str, listeners: Vec<Listener>) -> Gateway {
        Gateway {
            namespace: namespace.to_string(),
            name: name.to_string(),
            class_name: "haproxy".to_string(),
            listeners,
            status: Status::Added,
            ..Gateway::default()
        }
    }

    fn route(namespace: &str, name: &str, seconds: i64, service_ns: Option<&str>) -> TcpRoute {
        TcpRoute {
            namespace: namespace.to_string(),
            name: name.to_string(),
            parent_refs: vec![ParentRef {
                namespace: Some("gw".to_string()),
                name: "gateway".to_string(),
                ..ParentRef::default()
            }],
            backend_refs: vec![BackendRef {
                namespace: service_ns.map(str::to_string),
                name: "db".to_string(),
                port: Some(5432),
                ..BackendRef::default()
            }],
            created: DateTime::from_timestamp(seconds, 0).unwrap_or_default(),
            status: Status::Added,
            ..TcpRoute::default()
        }
    }

    fn store() -> K8s {
        let mut store = K8s::new(
            StoreParams::builder()
                .gateway_controller_name(CONTROLLER)
                .build(),
        );
        store.event_gateway_class(GatewayClass {
            name: "haproxy".to_string(),
            controller_name: CONTROLLER.to_string(),
            status: Status::Added,
            ..GatewayClass::default()
        });
        let mut all = listener("all", 5000, "TCP");
        all.from_namespaces = FromNamespaces::All;
        store.event_gateway(gateway(
            "gw",
            "gateway",
            vec![all, listener("same", 5001, "TCP"), listener("web", 80, "HTTP")],
        ));
        for ns in ["gw", "db"] {
            store.event_service(service(ns, "db", &[("postgres", 5432)]));
            store.event_endpoints(endpoints(ns, "db", &[("postgres", 5432)], &["10.1.0.1"]));
        }
        store
    }

    fn manager() -> GatewayManager {
        GatewayManager::new(BindAddresses::builder().ipv4("0.0.0.0").build())
    }

    #[test]
    fn test_names() {
        assert_eq!(frontend_name("gw", "gateway", "tcp"), "gw-gateway-tcp");
        assert_eq!(backend_name(&route("apps", "db", 0, None)), "apps_tcproute_db");
    }

    #[rstest]
    #[case(&[], true)]
    #[case(&[("", "TCPRoute")], true)]
    #[case(&[("gateway.networking.k8s.io", "TCPRoute"), ("", "HTTPRoute")], true)]
    #[case(&[("", "HTTPRoute")], false)]
    #[case(&[("example.com", "TCPRoute")], false)]
    fn test_allowed_kinds(#[case] kinds: &[(&str, &str)], #[case] accepted: bool) {
        let listener = Listener {
            allowed_kinds: kinds
                .iter()
                .map(|(group, kind)| RouteGroupKind {
                    group: (*group).to_string(),
                    kind: (*kind).to_string(),
                })
                .collect(),
            ..listener("tcp", 5000, "TCP")
        };
        assert_eq!(accepts_tcp_routes(&listener), accepted);
    }

    #[test]
    fn test_only_tcp_listeners_of_managed_gateways() {
        let mut store = store();
        let mut other = gateway("gw", "other", vec![listener("tcp", 6000, "TCP")]);
        other.class_name = "unknown".to_string();
        store.event_gateway(other);

        let listeners = GatewayManager::listeners(&store);
        assert_eq!(
            listeners.keys().map(String::as_str).collect::<Vec<_>>(),
            ["gw-gateway-all", "gw-gateway-same"]
        );
    }

    #[tokio::test]
    async fn test_route_attaches_to_listeners() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        store.event_tcp_route(route("gw", "db", 1, None));
        let mut manager = manager();

        assert_ok!(manager.update(&mut store, &mut haproxy, &Settings::default()).await);
        let config = assert_ok!(haproxy.config());
        for name in ["gw-gateway-all", "gw-gateway-same"] {
            let frontend = assert_ok!(config.frontend(name));
            assert_eq!(frontend.mode, Mode::Tcp);
            assert_eq!(frontend.default_backend.as_deref(), Some("gw_tcproute_db"));
        }
        assert_eq!(assert_ok!(config.frontend("gw-gateway-all")).binds[0].port, Some(5000));
        let backend = assert_ok!(config.backend("gw_tcproute_db"));
        assert_eq!(backend.mode, Mode::Tcp);
        assert_eq!(backend.servers.len(), 1);
        assert_eq!(backend.servers[0].name, "SRV_1");
        assert_eq!(backend.servers[0].address, "10.1.0.1");
        assert_eq!(backend.servers[0].port, Some(5432));
        assert!(!config.frontends.contains_key("gw-gateway-web"));
    }

    #[tokio::test]
    async fn test_listener_namespace_policy() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        store.event_tcp_route(route("apps", "db", 1, Some("gw")));

        assert_ok!(manager().update(&mut store, &mut haproxy, &Settings::default()).await);
        let config = assert_ok!(haproxy.config());
        assert_eq!(
            assert_ok!(config.frontend("gw-gateway-all")).default_backend.as_deref(),
            Some("apps_tcproute_db")
        );
        assert_eq!(assert_ok!(config.frontend("gw-gateway-same")).default_backend, None);
        // No grant from apps to gw.
        assert!(assert_ok!(config.backend("apps_tcproute_db")).servers.is_empty());
    }

    #[tokio::test]
    async fn test_reference_grant() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        store.event_tcp_route(route("gw", "db", 1, Some("db")));
        store.event_reference_grant(ReferenceGrant {
            namespace: "db".to_string(),
            name: "allow-gw".to_string(),
            from: vec![GrantFrom {
                group: GATEWAY_GROUP.to_string(),
                kind: TCP_ROUTE_KIND.to_string(),
                namespace: "gw".to_string(),
            }],
            to: vec![GrantTo {
                group: String::new(),
                kind: SERVICE_KIND.to_string(),
                name: Some("db".to_string()),
            }],
            status: Status::Added,
        });

        assert_ok!(manager().update(&mut store, &mut haproxy, &Settings::default()).await);
        let config = assert_ok!(haproxy.config());
        assert_eq!(assert_ok!(config.backend("gw_tcproute_db")).servers.len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_selector() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        let mut selected = listener("selected", 5002, "TCP");
        selected.from_namespaces = FromNamespaces::Selector;
        selected.namespace_selector = BTreeMap::from([("team".to_string(), "db".to_string())]);
        store.event_gateway(gateway("gw", "gateway", vec![selected]));
        store.event_namespace(NamespaceEvent {
            name: "apps".to_string(),
            labels: BTreeMap::from([("team".to_string(), "db".to_string())]),
            status: Status::Added,
        });
        store.event_tcp_route(route("apps", "db", 1, None));

        assert_ok!(manager().update(&mut store, &mut haproxy, &Settings::default()).await);
        let config = assert_ok!(haproxy.config());
        assert_eq!(
            assert_ok!(config.frontend("gw-gateway-selected")).default_backend.as_deref(),
            Some("apps_tcproute_db")
        );
    }

    #[tokio::test]
    async fn test_oldest_route_wins_and_stale_frontends_go() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        store.event_tcp_route(route("gw", "newer", 2, None));
        store.event_tcp_route(route("gw", "older", 1, None));
        let mut manager = manager();

        assert_ok!(manager.update(&mut store, &mut haproxy, &Settings::default()).await);
        assert_eq!(
            assert_ok!(assert_ok!(haproxy.config()).frontend("gw-gateway-same"))
                .default_backend
                .as_deref(),
            Some("gw_tcproute_older")
        );

        store.event_gateway(Gateway {
            status: Status::Deleted,
            ..gateway("gw", "gateway", Vec::new())
        });
        haproxy.instance_mut().reset();
        assert_ok!(manager.update(&mut store, &mut haproxy, &Settings::default()).await);
        let config = assert_ok!(haproxy.config());
        assert!(!config.frontends.contains_key("gw-gateway-same"));
        assert!(!config.frontends.contains_key("gw-gateway-all"));
        assert!(haproxy.instance().need_reload());
    }
}
