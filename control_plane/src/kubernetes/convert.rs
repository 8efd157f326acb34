//! Conversion of API objects into the store's view of them.

use crate::store::{
    BackendRef, ConfigMap, CrItem, Endpoints, FromNamespaces, Gateway, GatewayClass, GrantFrom,
    GrantTo, Ingress, IngressClass, IngressPath, IngressRule, IngressTls, Listener,
    NamespaceEvent, ParentRef, PathType, Pod, PortEndpoints, ReferenceGrant, RouteGroupKind,
    Secret, Service, ServicePort, Status, TcpCr, TcpItem, TcpRoute,
};
use chrono::{DateTime, Utc};
use gateway_api::apis::standard::gatewayclasses::GatewayClass as K8sGatewayClass;
use gateway_api::apis::standard::gateways::{
    Gateway as K8sGateway, GatewayListeners, GatewayListenersAllowedRoutesNamespacesFrom,
};
use gateway_api::apis::standard::referencegrants::ReferenceGrant as K8sReferenceGrant;
use haproxy_ingress_api::gateway::TCPRoute;
use haproxy_ingress_api::v3::TCP;
use k8s_openapi::api::core::v1::{
    ConfigMap as K8sConfigMap, Namespace as K8sNamespace, Pod as K8sPod, Secret as K8sSecret,
    Service as K8sService,
};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{
    Ingress as K8sIngress, IngressBackend, IngressClass as K8sIngressClass,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
const IGNORED_SYSTEM_SERVICES: [&str; 4] = [
    "kube-controller-manager",
    "kube-scheduler",
    "kubernetes-dashboard",
    "kube-dns",
];

/// `Time` is serialized as RFC 3339, which keeps this independent of the
/// date library behind it.
pub fn timestamp(time: Option<&Time>) -> DateTime<Utc> {
    time.and_then(|time| serde_json::to_value(time).ok())
        .and_then(|value| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or_default()
}

fn created(meta: &ObjectMeta) -> DateTime<Utc> {
    timestamp(meta.creation_timestamp.as_ref())
}

pub fn namespace(ns: &K8sNamespace, status: Status) -> NamespaceEvent {
    NamespaceEvent {
        name: ns.name_any(),
        labels: ns.labels().clone(),
        status,
    }
}

fn ingress_backend(namespace: &str, backend: &IngressBackend) -> IngressPath {
    let mut path = IngressPath {
        svc_namespace: namespace.to_string(),
        ..IngressPath::default()
    };
    if let Some(service) = &backend.service {
        path.svc_name.clone_from(&service.name);
        if let Some(port) = &service.port {
            path.svc_port_int = port.number.and_then(|n| u16::try_from(n).ok());
            path.svc_port_string = port.name.clone().unwrap_or_default();
        }
    }
    path
}

pub fn ingress(ingress: &K8sIngress, status: Status) -> Ingress {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let spec = ingress.spec.clone().unwrap_or_default();

    let mut rules: BTreeMap<String, IngressRule> = BTreeMap::new();
    for rule in spec.rules.unwrap_or_default() {
        let host = rule.host.unwrap_or_default();
        let Some(http) = rule.http else {
            warn!("ingress '{namespace}/{name}': no HTTP rules for host '{host}'");
            continue;
        };
        let entry = rules.entry(host.clone()).or_insert_with(|| IngressRule {
            host,
            paths: BTreeMap::new(),
        });
        for k8s_path in http.paths {
            let path = IngressPath {
                path: k8s_path.path.unwrap_or_default(),
                path_type: k8s_path.path_type.parse().unwrap_or(PathType::ImplementationSpecific),
                ..ingress_backend(&namespace, &k8s_path.backend)
            };
            entry.paths.insert(path.key(), path);
        }
    }

    let default_backend = spec.default_backend.as_ref().map(|backend| IngressPath {
        is_default_backend: true,
        ..ingress_backend(&namespace, backend)
    });

    let mut tls: BTreeMap<String, IngressTls> = BTreeMap::new();
    for entry in spec.tls.unwrap_or_default() {
        let secret_name = entry.secret_name.unwrap_or_default();
        tls.entry(secret_name.clone())
            .or_insert_with(|| IngressTls {
                hosts: Vec::new(),
                secret_name,
            })
            .hosts
            .extend(entry.hosts.unwrap_or_default());
    }

    let addresses = ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.ip.clone().or_else(|| entry.hostname.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ingress {
        api_version: "networking.k8s.io/v1".to_string(),
        namespace,
        name,
        class: spec.ingress_class_name.unwrap_or_default(),
        annotations: ingress.annotations().clone(),
        rules,
        default_backend,
        tls,
        addresses,
        status,
    }
}

pub fn ingress_class(class: &K8sIngressClass, status: Status) -> IngressClass {
    IngressClass {
        name: class.name_any(),
        controller: class
            .spec
            .as_ref()
            .and_then(|spec| spec.controller.clone())
            .unwrap_or_default(),
        annotations: class.annotations().clone(),
        status,
    }
}

/// Terminating services count as deleted.
pub fn service(service: &K8sService, status: Status) -> Service {
    let status = if service.metadata.deletion_timestamp.is_some() {
        Status::Deleted
    } else {
        status
    };
    let spec = service.spec.as_ref();
    let dns = spec
        .filter(|spec| spec.type_.as_deref() == Some("ExternalName"))
        .and_then(|spec| spec.external_name.clone())
        .unwrap_or_default();
    let ports = spec
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| ServicePort {
                    name: port.name.clone().unwrap_or_default(),
                    protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    port: u16::try_from(port.port).unwrap_or_default(),
                })
                .collect()
        })
        .unwrap_or_default();
    Service {
        namespace: service.namespace().unwrap_or_default(),
        name: service.name_any(),
        annotations: service.annotations().clone(),
        ports,
        addresses: Vec::new(),
        dns,
        status,
    }
}

/// Addresses a service is reachable at from outside, by service type.
pub fn service_addresses(service: &K8sService) -> Vec<String> {
    let Some(spec) = service.spec.as_ref() else {
        return Vec::new();
    };
    let external_ips = spec.external_ips.clone().unwrap_or_default();
    let mut addresses = Vec::new();
    match spec.type_.as_deref().unwrap_or("ClusterIP") {
        "ExternalName" => addresses.extend(spec.external_name.clone()),
        "ClusterIP" => {
            addresses.extend(spec.cluster_ip.clone());
            addresses.extend(external_ips);
        }
        "NodePort" => addresses.extend(external_ips),
        "LoadBalancer" => {
            let entries = service
                .status
                .as_ref()
                .and_then(|status| status.load_balancer.as_ref())
                .and_then(|lb| lb.ingress.as_ref());
            for entry in entries.into_iter().flatten() {
                match (&entry.ip, &entry.hostname) {
                    (Some(ip), _) if !ip.is_empty() => addresses.push(ip.clone()),
                    (_, Some(hostname)) => addresses.push(hostname.clone()),
                    _ => {}
                }
            }
            addresses.extend(external_ips);
        }
        other => warn!(
            "unable to extract addresses from service '{}/{}' of type '{other}'",
            service.namespace().unwrap_or_default(),
            service.name_any()
        ),
    }
    addresses
}

/// `None` for slices of system services HAProxy never routes to.
pub fn endpoints(slice: &EndpointSlice, status: Status) -> Option<Endpoints> {
    let namespace = slice.namespace().unwrap_or_default();
    let service = slice
        .labels()
        .get(SERVICE_NAME_LABEL)
        .cloned()
        .unwrap_or_default();
    if namespace == "kube-system" && IGNORED_SYSTEM_SERVICES.contains(&service.as_str()) {
        return None;
    }
    let addresses: BTreeSet<String> = slice
        .endpoints
        .iter()
        .filter(|endpoint| {
            endpoint
                .conditions
                .as_ref()
                .and_then(|conditions| conditions.ready)
                .unwrap_or(false)
        })
        .flat_map(|endpoint| endpoint.addresses.iter().cloned())
        .collect();
    let ports = slice
        .ports
        .iter()
        .flatten()
        .filter_map(|port| {
            let port_number = u16::try_from(port.port?).ok()?;
            Some((
                port.name.clone().unwrap_or_default(),
                PortEndpoints {
                    port: port_number,
                    addresses: addresses.clone(),
                },
            ))
        })
        .collect();
    Some(Endpoints {
        slice_name: slice.name_any(),
        namespace,
        service,
        ports,
        status,
    })
}

pub fn secret(secret: &K8sSecret, status: Status) -> Secret {
    Secret {
        namespace: secret.namespace().unwrap_or_default(),
        name: secret.name_any(),
        data: secret
            .data
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.0.clone()))
            .collect(),
        status,
    }
}

/// Config map entries play the role of annotations.
pub fn config_map(cm: &K8sConfigMap, status: Status) -> ConfigMap {
    ConfigMap {
        namespace: cm.namespace().unwrap_or_default(),
        name: cm.name_any(),
        annotations: cm.data.clone().unwrap_or_default(),
        loaded: false,
        status,
    }
}

pub fn pod(pod: &K8sPod, status: Status) -> Pod {
    Pod {
        name: pod.name_any(),
        status,
    }
}

pub fn cr_item<K: kube::Resource, T: Clone>(resource: &K, spec: &T, status: Status) -> CrItem<T> {
    CrItem {
        namespace: resource.meta().namespace.clone().unwrap_or_default(),
        name: resource.meta().name.clone().unwrap_or_default(),
        created: created(resource.meta()),
        spec: spec.clone(),
        status,
    }
}

pub fn tcp_cr(tcp: &TCP, status: Status) -> TcpCr {
    TcpCr {
        namespace: tcp.namespace().unwrap_or_default(),
        name: tcp.name_any(),
        created: created(&tcp.metadata),
        items: tcp
            .spec
            .0
            .iter()
            .map(|model| TcpItem {
                model: model.clone(),
                collision: None,
            })
            .collect(),
        status,
    }
}

pub fn gateway_class(class: &K8sGatewayClass, status: Status) -> GatewayClass {
    GatewayClass {
        name: class.name_any(),
        controller_name: class.spec.controller_name.clone(),
        description: class.spec.description.clone(),
        generation: class.metadata.generation.unwrap_or_default(),
        status,
    }
}

fn listener(listener: &GatewayListeners) -> Listener {
    let allowed = listener.allowed_routes.as_ref();
    let namespaces = allowed.and_then(|allowed| allowed.namespaces.as_ref());
    let from_namespaces = match namespaces.and_then(|ns| ns.from.as_ref()) {
        Some(GatewayListenersAllowedRoutesNamespacesFrom::All) => FromNamespaces::All,
        Some(GatewayListenersAllowedRoutesNamespacesFrom::Selector) => FromNamespaces::Selector,
        Some(GatewayListenersAllowedRoutesNamespacesFrom::Same) | None => FromNamespaces::Same,
    };
    Listener {
        name: listener.name.clone(),
        port: u16::try_from(listener.port).unwrap_or_default(),
        protocol: listener.protocol.clone(),
        hostname: listener.hostname.clone(),
        allowed_kinds: allowed
            .and_then(|allowed| allowed.kinds.as_ref())
            .map(|kinds| {
                kinds
                    .iter()
                    .map(|kind| RouteGroupKind {
                        group: kind.group.clone().unwrap_or_default(),
                        kind: kind.kind.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
        from_namespaces,
        namespace_selector: namespaces
            .and_then(|ns| ns.selector.as_ref())
            .and_then(|selector| selector.match_labels.clone())
            .unwrap_or_default(),
    }
}

pub fn gateway(gateway: &K8sGateway, status: Status) -> Gateway {
    Gateway {
        namespace: gateway.namespace().unwrap_or_default(),
        name: gateway.name_any(),
        class_name: gateway.spec.gateway_class_name.clone(),
        listeners: gateway.spec.listeners.iter().map(listener).collect(),
        generation: gateway.metadata.generation.unwrap_or_default(),
        status,
    }
}

pub fn tcp_route(route: &TCPRoute, status: Status) -> TcpRoute {
    TcpRoute {
        namespace: route.namespace().unwrap_or_default(),
        name: route.name_any(),
        parent_refs: route
            .spec
            .parent_refs
            .iter()
            .map(|parent| ParentRef {
                namespace: parent.namespace.clone(),
                name: parent.name.clone(),
                section_name: parent.section_name.clone(),
                port: parent.port,
            })
            .collect(),
        backend_refs: route
            .spec
            .rules
            .iter()
            .flat_map(|rule| &rule.backend_refs)
            .map(|backend| BackendRef {
                group: backend.group.clone(),
                kind: backend.kind.clone(),
                namespace: backend.namespace.clone(),
                name: backend.name.clone(),
                port: backend.port,
                weight: backend.weight,
            })
            .collect(),
        created: created(&route.metadata),
        generation: route.metadata.generation.unwrap_or_default(),
        status,
    }
}

pub fn reference_grant(grant: &K8sReferenceGrant, status: Status) -> ReferenceGrant {
    ReferenceGrant {
        namespace: grant.namespace().unwrap_or_default(),
        name: grant.name_any(),
        from: grant
            .spec
            .from
            .iter()
            .map(|from| GrantFrom {
                group: from.group.clone(),
                kind: from.kind.clone(),
                namespace: from.namespace.clone(),
            })
            .collect(),
        to: grant
            .spec
            .to
            .iter()
            .map(|to| GrantTo {
                group: to.group.clone(),
                kind: to.kind.clone(),
                name: to.name.clone(),
            })
            .collect(),
        status,
    }
}
