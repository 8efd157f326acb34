//! Backends and server slots of the services referenced by ingresses.
//!
//! A backend is named `<namespace>_<service>_<port>` where the port is the
//! service port name, or its number when unnamed. Standalone backends carry
//! the ingress namespace and name in front so that every ingress gets its
//! own copy.

use crate::annotations::{BackendModel, Context, Settings, Values, backend_model, parse_k8s_path};
use crate::store::{
    DISABLED_ADDRESS, HAProxySrv, Ingress, IngressPath, K8s, RuntimeBackend, Service, ServicePort,
    Status, StoreError,
};
use getset::Getters;
use haproxy_ingress_api::v3::BackendSpec;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::certs::{CertificateError, SecretRef, SecretType};
use haproxy_ingress_dataplane::configuration::TransactionError;
use haproxy_ingress_dataplane::models::{Mode, Server};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_SERVER_SLOTS: usize = 42;
const DNS_INIT_ADDR: &str = "last,libc,none";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("service '{service}': no service port matching '{port}'")]
    PortNotFound { service: String, port: String },
    #[error("service '{0}' has no ports")]
    NoPorts(String),
    #[error("service '{0}' is not marked as default backend")]
    NotDefaultBackend(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error("backend '{backend}': {source}")]
    Certificate {
        backend: String,
        #[source]
        source: CertificateError,
    },
}

/// A service port resolved for one ingress path, with the backend built
/// from the merged annotations.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub")]
pub struct ServiceBackend {
    namespace: String,
    service: String,
    port: ServicePort,
    /// Backend name in the configuration.
    name: String,
    /// External name of an `ExternalName` service.
    dns: String,
    standalone: bool,
    model: BackendModel,
    slots: usize,
    /// `route-acl` of the service, if any.
    route_acl: Option<String>,
}

impl ServiceBackend {
    /// Resolves the service of `path` and builds its backend. `tcp` selects
    /// TCP mode, used by SSL pass-through and TCP services.
    pub fn new(
        store: &K8s,
        path: &IngressPath,
        ingress: Option<&Ingress>,
        settings: &Settings,
        tcp: bool,
    ) -> Result<Self, ServiceError> {
        let service = store.get_service(&path.svc_namespace, &path.svc_name)?;
        let port = resolve_port(service, path)?;
        let values = Values::new(
            ingress
                .map(|ingress| &ingress.annotations)
                .into_iter()
                .chain([&service.annotations, &store.config_maps.main.annotations]),
        );
        let standalone = ingress.is_some_and(|ingress| {
            matches!(
                Values::new([&ingress.annotations]).bool("standalone-backend"),
                Ok(Some(true))
            )
        });

        let port_id = if port.name.is_empty() {
            port.port.to_string()
        } else {
            port.name.clone()
        };
        let name = match ingress.filter(|_| standalone) {
            Some(ingress) => format!(
                "{}_{}_{}_{port_id}",
                ingress.namespace, ingress.name, service.name
            ),
            None => format!("{}_{}_{port_id}", service.namespace, service.name),
        };

        let mode = if tcp { Mode::Tcp } else { Mode::Http };
        let ctx = Context::new(store, &service.namespace, ingress, settings);
        let cr = backend_cr(store, &values, &service.namespace, &name);
        let mut model = backend_model(&name, mode, cr, &values, &ctx);
        if tcp {
            model.backend.mode = Mode::Tcp;
        }
        if !service.dns.is_empty() && model.backend.default_server.init_addr.is_none() {
            model.backend.default_server.init_addr = Some(DNS_INIT_ADDR.to_string());
        }

        let slots = match values.number::<usize>("scale-server-slots") {
            Ok(Some(slots)) if slots > 0 => slots,
            Ok(_) => DEFAULT_SERVER_SLOTS,
            Err(err) => {
                warn!("service '{}/{}': {err}", service.namespace, service.name);
                DEFAULT_SERVER_SLOTS
            }
        };
        let route_acl = Values::new([&service.annotations])
            .explicit("route-acl")
            .map(str::to_string);

        Ok(Self {
            namespace: service.namespace.clone(),
            service: service.name.clone(),
            port,
            name,
            dns: service.dns.clone(),
            standalone,
            model,
            slots,
            route_acl,
        })
    }

    /// Creates or updates the backend, writing the certificates it refers to
    /// first. Returns true when the backend was created or changed.
    pub async fn handle_backend(
        &self,
        store: &K8s,
        haproxy: &mut HAProxy,
    ) -> Result<bool, ServiceError> {
        let mut backend = self.model.backend.clone();
        for request in &self.model.certs {
            let secret =
                match store.get_secret(&request.secret.namespace, &request.secret.name) {
                    Ok(secret) => secret,
                    Err(err) => {
                        warn!("backend '{}': {err}", self.name);
                        continue;
                    }
                };
            let path = haproxy
                .add_secret(
                    SecretRef {
                        namespace: &secret.namespace,
                        name: &secret.name,
                        data: &secret.data,
                        changed: secret.status != Status::Empty,
                    },
                    request.kind,
                )
                .await
                .map_err(|source| ServiceError::Certificate {
                    backend: self.name.clone(),
                    source,
                })?;
            let path = path.display().to_string();
            match request.kind {
                SecretType::Ca => backend.default_server.ca_file = Some(path),
                _ => backend.default_server.crt = Some(path),
            }
        }
        let changed = haproxy.backend_create_or_update(backend)?;
        if changed {
            debug!(
                "service '{}/{}': backend '{}' created or updated",
                self.namespace, self.service, self.name
            );
        }
        Ok(changed)
    }

    /// Writes the server slots of the backend. Slots are only ever added,
    /// which requires a reload; address changes in existing slots were
    /// already pushed through the runtime when the endpoints changed.
    pub fn handle_servers(&self, store: &mut K8s, haproxy: &mut HAProxy) -> Result<(), ServiceError> {
        if !store.backends_processed.insert(self.name.clone()) {
            return Ok(());
        }

        let servers: Vec<Server> = match self.runtime_backend(store) {
            Some(runtime) => {
                runtime.name.clone_from(&self.name);
                runtime.sync_servers(false);
                let scaled = runtime.scale(self.slots);
                haproxy.instance_mut().reload_if(
                    scaled,
                    format!("backend '{}': server slots scaled", self.name),
                );
                runtime.servers.iter().map(config_server).collect()
            }
            None if !self.dns.is_empty() => {
                let mut server = Server::new("SRV_1", self.dns.clone(), Some(self.port.port));
                server.check = self.model.backend.default_server.check;
                vec![server]
            }
            None => {
                warn!(
                    "service '{}/{}': no available endpoints for port '{}'",
                    self.namespace,
                    self.service,
                    self.port_label()
                );
                let backend = haproxy.config_mut()?.backend_mut(&self.name)?;
                let removed = !backend.servers.is_empty();
                backend.servers.clear();
                haproxy.instance_mut().reload_if(
                    removed,
                    format!("backend '{}': servers removed", self.name),
                );
                return Ok(());
            }
        };

        let backend = haproxy.config_mut()?.backend_mut(&self.name)?;
        for server in servers {
            backend.set_server(server);
        }
        Ok(())
    }

    /// Runtime slots of the backend. Standalone backends get their own slots
    /// seeded from the current endpoints of the port.
    fn runtime_backend<'a>(&self, store: &'a mut K8s) -> Option<&'a mut RuntimeBackend> {
        if self.standalone {
            let endpoints = store
                .get_endpoints(&self.namespace, &self.service)
                .ok()
                .and_then(|mut ports| ports.remove(&self.port.name))?;
            let ns = store.namespace_mut(&self.namespace);
            let backends = ns
                .runtime_standalone
                .entry(self.service.clone())
                .or_default()
                .entry(self.port.name.clone())
                .or_default();
            return Some(
                backends
                    .entry(self.name.clone())
                    .or_insert_with(|| RuntimeBackend {
                        name: self.name.clone(),
                        pending: endpoints.addresses.clone(),
                        endpoints,
                        ..RuntimeBackend::default()
                    }),
            );
        }
        store
            .namespaces
            .get_mut(&self.namespace)?
            .runtime
            .get_mut(&self.service)?
            .get_mut(&self.port.name)
    }

    fn port_label(&self) -> String {
        if self.port.name.is_empty() {
            self.port.port.to_string()
        } else {
            self.port.name.clone()
        }
    }
}

/// Uses the service of a default backend path as default backend of
/// `frontends`. A path without port uses the first service port. Returns
/// the backend name.
pub async fn set_default_backend(
    store: &mut K8s,
    haproxy: &mut HAProxy,
    path: &IngressPath,
    ingress: Option<&Ingress>,
    settings: &Settings,
    frontends: &[&str],
) -> Result<String, ServiceError> {
    if !path.is_default_backend {
        return Err(ServiceError::NotDefaultBackend(format!(
            "{}/{}",
            path.svc_namespace, path.svc_name
        )));
    }
    let tcp = match frontends.first() {
        Some(name) => haproxy.config()?.frontend(name)?.mode == Mode::Tcp,
        None => false,
    };
    let mut path = path.clone();
    if path.svc_port_int.is_none() && path.svc_port_string.is_empty() {
        let service = store.get_service(&path.svc_namespace, &path.svc_name)?;
        let first = service
            .ports
            .first()
            .ok_or_else(|| ServiceError::NoPorts(format!("{}/{}", service.namespace, service.name)))?;
        path.svc_port_int = Some(first.port);
        path.svc_port_string.clone_from(&first.name);
    }

    let service = ServiceBackend::new(store, &path, ingress, settings, tcp)?;
    service.handle_backend(store, haproxy).await?;
    let name = service.name().clone();
    let config = haproxy.config_mut()?;
    let mut changed = false;
    for frontend in frontends {
        let frontend = config.frontend_mut(frontend)?;
        if frontend.default_backend.as_deref() != Some(name.as_str()) {
            frontend.default_backend = Some(name.clone());
            changed = true;
        }
    }
    haproxy
        .instance_mut()
        .reload_if(changed, format!("default backend set to '{name}'"));
    service.handle_servers(store, haproxy)?;
    Ok(name)
}

fn resolve_port(service: &Service, path: &IngressPath) -> Result<ServicePort, ServiceError> {
    service
        .ports
        .iter()
        .find(|port| {
            Some(port.port) == path.svc_port_int
                || (!port.name.is_empty() && port.name == path.svc_port_string)
        })
        .cloned()
        .ok_or_else(|| ServiceError::PortNotFound {
            service: format!("{}/{}", service.namespace, service.name),
            port: path
                .svc_port_int
                .map_or_else(|| path.svc_port_string.clone(), |port| port.to_string()),
        })
}

/// The `Backend` resource named by `cr-backend`, if it exists.
fn backend_cr<'a>(
    store: &'a K8s,
    values: &Values<'_>,
    namespace: &str,
    backend: &str,
) -> Option<&'a BackendSpec> {
    let reference = values.explicit("cr-backend")?;
    let reference = match parse_k8s_path(reference, namespace) {
        Ok(reference) => reference,
        Err(err) => {
            warn!("backend '{backend}': annotation 'cr-backend': {err}");
            return None;
        }
    };
    let item = store
        .namespace(&reference.namespace)
        .ok()
        .and_then(|ns| ns.crs.backends.get(&reference.name))
        .filter(|item| item.status != Status::Deleted);
    if item.is_none() {
        warn!("backend '{backend}': Backend resource '{reference}' not found");
    }
    item.map(|item| &item.spec)
}

/// Server line of a slot. Disabled slots point at a placeholder address so
/// they can be enabled later through the runtime.
fn config_server(slot: &HAProxySrv) -> Server {
    if slot.address.is_empty() {
        Server {
            disabled: true,
            ..Server::new(slot.name.clone(), DISABLED_ADDRESS, Some(1))
        }
    } else {
        Server::new(slot.name.clone(), slot.address.clone(), Some(slot.port))
    }
}
