//! Store mutations, one per watched kind.
//!
//! The incoming object carries the event type in its status. Every method
//! returns whether the store changed, so that a batch of no-op re-list events
//! does not trigger a reconcile pass.

use super::types::{
    ConfigMap, CrItem, Endpoints, Gateway, GatewayClass, Ingress, IngressClass, NamespaceEvent,
    Pod, ReferenceGrant, RuntimeBackend, Secret, Service, Status, TcpCr, TcpRoute, Tracked,
};
use super::{K8s, merge_slices};
use haproxy_ingress_api::v3::{BackendSpec, DefaultsSpec, FrontendSpec, GlobalSpec};
use haproxy_ingress_core::utils::pod_prefix;
use haproxy_ingress_dataplane::runtime::RuntimeServerData;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Server slot changes of one backend, to be pushed through the runtime
/// socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeUpdate {
    pub backend: String,
    pub servers: Vec<RuntimeServerData>,
}

/// Applies an added, modified or deleted object to `items`.
fn apply_event<T: Tracked + PartialEq>(
    items: &mut BTreeMap<String, T>,
    key: &str,
    mut item: T,
    kind: &str,
) -> bool {
    if item.status() == Status::Deleted {
        return match items.get_mut(key) {
            Some(existing) if existing.status() == Status::Deleted => false,
            Some(existing) => {
                existing.set_status(Status::Deleted);
                true
            }
            None => {
                warn!("{kind} '{key}' not registered with controller, cannot delete");
                false
            }
        };
    }

    match items.get_mut(key) {
        Some(existing) => {
            let previous = existing.status();
            if previous != Status::Deleted && *existing == item {
                return false;
            }
            // Not committed yet, so HAProxy has never seen it.
            item.set_status(if previous == Status::Added {
                Status::Added
            } else {
                Status::Modified
            });
            *existing = item;
        }
        None => {
            if item.status() == Status::Modified {
                debug!("{kind} '{key}' modified before being registered, treated as added");
            }
            item.set_status(Status::Added);
            items.insert(key.to_string(), item);
        }
    }
    true
}

fn push_update(updates: &mut Vec<RuntimeUpdate>, backend: &mut RuntimeBackend, port_updated: bool) {
    let servers = backend.sync_servers(port_updated);
    if !servers.is_empty() {
        updates.push(RuntimeUpdate {
            backend: backend.name.clone(),
            servers,
        });
    }
}

impl K8s {
    pub fn event_namespace(&mut self, event: NamespaceEvent) -> bool {
        match event.status {
            Status::Deleted => {
                let removed = self.namespaces.remove(&event.name).is_some();
                if !removed {
                    warn!(
                        "namespace '{}' not registered with controller, cannot delete",
                        event.name
                    );
                }
                removed
            }
            Status::Added => {
                self.namespace_mut(&event.name).labels = event.labels;
                true
            }
            _ => {
                let ns = self.namespace_mut(&event.name);
                if ns.labels == event.labels {
                    return false;
                }
                ns.labels = event.labels;
                true
            }
        }
    }

    pub fn event_ingress(&mut self, ingress: Ingress) -> bool {
        let name = ingress.name.clone();
        let ns = self.namespace_mut(&ingress.namespace);
        apply_event(&mut ns.ingresses, &name, ingress, "ingress")
    }

    pub fn event_ingress_class(&mut self, class: IngressClass) -> bool {
        let name = class.name.clone();
        apply_event(&mut self.ingress_classes, &name, class, "ingress class")
    }

    pub fn event_service(&mut self, service: Service) -> bool {
        let name = service.name.clone();
        let ns = self.namespace_mut(&service.namespace);
        apply_event(&mut ns.services, &name, service, "service")
    }

    /// The published service only provides the addresses written into
    /// ingress statuses.
    pub fn event_publish_service(&mut self, service: Service) -> bool {
        let addresses = if service.status == Status::Deleted {
            Vec::new()
        } else {
            service.addresses
        };
        if addresses == self.publish_service_addresses {
            return false;
        }
        self.publish_service_addresses = addresses;
        self.update_all_ingresses = true;
        true
    }

    /// Stores an endpoint slice and aligns the server slots of every backend
    /// of the service. Returns `None` when the slice did not change, else the
    /// runtime updates of the slots that moved.
    pub fn event_endpoints(&mut self, endpoints: Endpoints) -> Option<Vec<RuntimeUpdate>> {
        let service = endpoints.service.clone();
        let slice = endpoints.slice_name.clone();
        let ns = self.namespace_mut(&endpoints.namespace);
        let slices = ns.endpoints.entry(service.clone()).or_default();
        if !apply_event(slices, &slice, endpoints, "endpoints") {
            return None;
        }
        let merged = merge_slices(slices);

        let mut updates = Vec::new();
        let runtime = ns.runtime.entry(service.clone()).or_default();
        for (port_name, port_endpoints) in &merged {
            match runtime.get_mut(port_name) {
                Some(backend) if backend.endpoints == *port_endpoints => {}
                Some(backend) => {
                    let port_updated = backend.endpoints.port != port_endpoints.port;
                    backend.endpoints = port_endpoints.clone();
                    push_update(&mut updates, backend, port_updated);
                }
                None => {
                    runtime.insert(
                        port_name.clone(),
                        RuntimeBackend {
                            endpoints: port_endpoints.clone(),
                            pending: port_endpoints.addresses.clone(),
                            ..RuntimeBackend::default()
                        },
                    );
                }
            }
        }
        for (port_name, backend) in runtime.iter_mut() {
            if !merged.contains_key(port_name) && !backend.endpoints.addresses.is_empty() {
                backend.endpoints.addresses.clear();
                push_update(&mut updates, backend, false);
            }
        }

        if let Some(standalone) = ns.runtime_standalone.get_mut(&service) {
            for (port_name, backends) in standalone.iter_mut() {
                let current = merged.get(port_name).cloned().unwrap_or_default();
                for backend in backends.values_mut() {
                    if backend.endpoints == current {
                        continue;
                    }
                    let port_updated = backend.endpoints.port != current.port;
                    backend.endpoints = current.clone();
                    push_update(&mut updates, backend, port_updated);
                }
            }
        }
        Some(updates)
    }

    pub fn event_secret(&mut self, secret: Secret) -> bool {
        let name = secret.name.clone();
        let ns = self.namespace_mut(&secret.namespace);
        apply_event(&mut ns.secrets, &name, secret, "secret")
    }

    /// Only the config maps configured on the command line are tracked.
    pub fn event_config_map(&mut self, data: ConfigMap) -> bool {
        let Some(cm) = self.config_maps.role_mut(&data.namespace, &data.name) else {
            return false;
        };
        match data.status {
            Status::Deleted => {
                if !cm.loaded {
                    return false;
                }
                cm.annotations.clear();
                cm.loaded = false;
                cm.status = Status::Deleted;
                true
            }
            _ => {
                if cm.loaded && cm.annotations == data.annotations {
                    return false;
                }
                cm.status = if cm.loaded {
                    Status::Modified
                } else {
                    Status::Added
                };
                cm.annotations = data.annotations;
                cm.loaded = true;
                true
            }
        }
    }

    /// Tracks controller replicas, which share the pod name prefix.
    pub fn event_pod(&mut self, pod: Pod) -> bool {
        if self.pod_prefix.is_none() || pod_prefix(&pod.name) != self.pod_prefix.as_deref() {
            return false;
        }
        if pod.status == Status::Deleted {
            self.replicas.remove(&pod.name)
        } else {
            self.replicas.insert(pod.name)
        }
    }

    pub fn event_global_cr(&mut self, item: CrItem<GlobalSpec>) -> bool {
        let name = item.name.clone();
        let ns = self.namespace_mut(&item.namespace);
        apply_event(&mut ns.crs.global, &name, item, "Global")
    }

    pub fn event_defaults_cr(&mut self, item: CrItem<DefaultsSpec>) -> bool {
        let name = item.name.clone();
        let ns = self.namespace_mut(&item.namespace);
        apply_event(&mut ns.crs.defaults, &name, item, "Defaults")
    }

    pub fn event_backend_cr(&mut self, item: CrItem<BackendSpec>) -> bool {
        let name = item.name.clone();
        let ns = self.namespace_mut(&item.namespace);
        apply_event(&mut ns.crs.backends, &name, item, "Backend")
    }

    pub fn event_frontend_cr(&mut self, item: CrItem<FrontendSpec>) -> bool {
        let name = item.name.clone();
        let ns = self.namespace_mut(&item.namespace);
        apply_event(&mut ns.crs.frontends, &name, item, "Frontend")
    }

    /// Collisions are resolved across namespaces, so every change of a TCP
    /// resource recomputes them all.
    pub fn event_tcp_cr(&mut self, cr: TcpCr) -> bool {
        let name = cr.name.clone();
        let ns = self.namespace_mut(&cr.namespace);
        if !apply_event(&mut ns.crs.tcps, &name, cr, "TCP") {
            return false;
        }
        self.update_tcp_collisions();
        true
    }

    /// Only classes naming this controller are kept. A class handed over to
    /// another controller counts as deleted.
    pub fn event_gateway_class(&mut self, mut class: GatewayClass) -> bool {
        if class.controller_name != self.gateway_controller_name {
            if !self.gateway_classes.contains_key(&class.name) {
                return false;
            }
            class.status = Status::Deleted;
        }
        let name = class.name.clone();
        apply_event(&mut self.gateway_classes, &name, class, "gateway class")
    }

    pub fn event_gateway(&mut self, gateway: Gateway) -> bool {
        let name = gateway.name.clone();
        let ns = self.namespace_mut(&gateway.namespace);
        apply_event(&mut ns.gateways, &name, gateway, "gateway")
    }

    pub fn event_tcp_route(&mut self, route: TcpRoute) -> bool {
        let name = route.name.clone();
        let ns = self.namespace_mut(&route.namespace);
        apply_event(&mut ns.tcp_routes, &name, route, "tcproute")
    }

    pub fn event_reference_grant(&mut self, grant: ReferenceGrant) -> bool {
        let name = grant.name.clone();
        let ns = self.namespace_mut(&grant.namespace);
        apply_event(&mut ns.reference_grants, &name, grant, "referencegrant")
    }
}
