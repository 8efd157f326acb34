//! In-memory projection of the cluster objects the controller acts on.
//!
//! The store is only mutated by the reconcile loop. Events flag objects as
//! added, modified or deleted; [`K8s::clean`] settles those flags once a
//! reconcile pass has been committed.

mod events;
mod runtime;
mod tcp;
mod types;

pub use events::RuntimeUpdate;
pub use runtime::DISABLED_ADDRESS;
pub use tcp::{address_port, frontend_name};
pub use types::*;

use haproxy_ingress_api::constants::{DEFAULT_INGRESS_CLASS_ANNOTATION, INGRESS_CLASS_CONTROLLER};
use haproxy_ingress_api::v3::{BackendSpec, DefaultsSpec, FrontendSpec, GlobalSpec};
use haproxy_ingress_core::utils::pod_prefix;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use typed_builder::TypedBuilder;

/// Name of the synthetic service backing the built-in default backend.
pub const DEFAULT_LOCAL_SERVICE: &str = "default-local-service";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),
    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("{kind} '{namespace}/{name}' deleted")]
    Deleted {
        kind: &'static str,
        namespace: String,
        name: String,
    },
}

impl StoreError {
    fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn deleted(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self::Deleted {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CustomResources {
    pub global: BTreeMap<String, CrItem<GlobalSpec>>,
    pub defaults: BTreeMap<String, CrItem<DefaultsSpec>>,
    pub backends: BTreeMap<String, CrItem<BackendSpec>>,
    pub frontends: BTreeMap<String, CrItem<FrontendSpec>>,
    pub tcps: BTreeMap<String, TcpCr>,
}

/// Runtime backends of a service, keyed by service port name.
pub type ServiceRuntime = BTreeMap<String, RuntimeBackend>;

#[derive(Debug, Default)]
pub struct Namespace {
    pub name: String,
    pub relevant: bool,
    pub labels: BTreeMap<String, String>,
    pub ingresses: BTreeMap<String, Ingress>,
    pub services: BTreeMap<String, Service>,
    /// Endpoint slices by service then slice name.
    pub endpoints: BTreeMap<String, BTreeMap<String, Endpoints>>,
    pub secrets: BTreeMap<String, Secret>,
    pub runtime: BTreeMap<String, ServiceRuntime>,
    /// Standalone backends by service, port name then backend name.
    pub runtime_standalone: BTreeMap<String, BTreeMap<String, BTreeMap<String, RuntimeBackend>>>,
    pub crs: CustomResources,
    pub gateways: BTreeMap<String, Gateway>,
    pub tcp_routes: BTreeMap<String, TcpRoute>,
    pub reference_grants: BTreeMap<String, ReferenceGrant>,
}

#[derive(Debug, Default)]
pub struct ConfigMaps {
    pub main: ConfigMap,
    pub tcp_services: ConfigMap,
    pub errorfiles: ConfigMap,
    pub pattern_files: ConfigMap,
}

impl ConfigMaps {
    fn all_mut(&mut self) -> [&mut ConfigMap; 4] {
        [
            &mut self.main,
            &mut self.tcp_services,
            &mut self.errorfiles,
            &mut self.pattern_files,
        ]
    }

    /// The configured config map named `namespace/name`, if any.
    pub fn role_mut(&mut self, namespace: &str, name: &str) -> Option<&mut ConfigMap> {
        self.all_mut()
            .into_iter()
            .find(|cm| !cm.name.is_empty() && cm.namespace == namespace && cm.name == name)
    }
}

fn config_map(reference: Option<&NamespacedName>) -> ConfigMap {
    reference.map_or_else(ConfigMap::default, |reference| ConfigMap {
        namespace: reference.namespace.clone(),
        name: reference.name.clone(),
        ..ConfigMap::default()
    })
}

#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct StoreParams {
    main_configmap: Option<NamespacedName>,
    tcp_services_configmap: Option<NamespacedName>,
    errorfiles_configmap: Option<NamespacedName>,
    patternfiles_configmap: Option<NamespacedName>,
    ingress_class: String,
    empty_ingress_class: bool,
    namespace_whitelist: Vec<String>,
    namespace_blacklist: Vec<String>,
    gateway_controller_name: String,
    pod_name: String,
}

#[derive(Debug, Default)]
pub struct K8s {
    pub namespaces: BTreeMap<String, Namespace>,
    pub ingress_classes: BTreeMap<String, IngressClass>,
    pub gateway_classes: BTreeMap<String, GatewayClass>,
    pub config_maps: ConfigMaps,
    pub ingress_class: String,
    pub empty_ingress_class: bool,
    pub gateway_controller_name: String,
    namespace_whitelist: BTreeSet<String>,
    namespace_blacklist: BTreeSet<String>,
    pod_prefix: Option<String>,
    /// Controller pods sharing this pod's deployment.
    pub replicas: BTreeSet<String>,
    pub publish_service_addresses: Vec<String>,
    /// Set when every ingress status must be written again.
    pub update_all_ingresses: bool,
    /// Backends whose servers were handled during the current pass.
    pub backends_processed: BTreeSet<String>,
    pub secrets_processed: BTreeSet<String>,
}

impl K8s {
    pub fn new(params: StoreParams) -> Self {
        Self {
            config_maps: ConfigMaps {
                main: config_map(params.main_configmap.as_ref()),
                tcp_services: config_map(params.tcp_services_configmap.as_ref()),
                errorfiles: config_map(params.errorfiles_configmap.as_ref()),
                pattern_files: config_map(params.patternfiles_configmap.as_ref()),
            },
            ingress_class: params.ingress_class,
            empty_ingress_class: params.empty_ingress_class,
            gateway_controller_name: params.gateway_controller_name,
            namespace_whitelist: params.namespace_whitelist.into_iter().collect(),
            namespace_blacklist: params.namespace_blacklist.into_iter().collect(),
            pod_prefix: pod_prefix(&params.pod_name).map(str::to_string),
            ..Self::default()
        }
    }

    /// Whitelisted namespaces, or an empty set when every namespace is watched.
    pub fn namespace_whitelist(&self) -> &BTreeSet<String> {
        &self.namespace_whitelist
    }

    pub fn is_relevant_namespace(&self, namespace: &str) -> bool {
        if namespace.is_empty() {
            return false;
        }
        if !self.namespace_whitelist.is_empty() {
            return self.namespace_whitelist.contains(namespace);
        }
        !self.namespace_blacklist.contains(namespace)
    }

    /// Returns the namespace, creating it on first use. Relevance is fixed at
    /// creation.
    pub fn namespace_mut(&mut self, name: &str) -> &mut Namespace {
        let relevant = self.is_relevant_namespace(name);
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                name: name.to_string(),
                relevant,
                ..Namespace::default()
            })
    }

    pub fn namespace(&self, name: &str) -> Result<&Namespace, StoreError> {
        self.namespaces
            .get(name)
            .ok_or_else(|| StoreError::NamespaceNotFound(name.to_string()))
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Result<&Secret, StoreError> {
        let secret = self
            .namespace(namespace)?
            .secrets
            .get(name)
            .ok_or_else(|| StoreError::not_found("secret", namespace, name))?;
        if secret.status == Status::Deleted {
            return Err(StoreError::deleted("secret", namespace, name));
        }
        Ok(secret)
    }

    pub fn get_service(&self, namespace: &str, name: &str) -> Result<&Service, StoreError> {
        let service = self
            .namespace(namespace)?
            .services
            .get(name)
            .ok_or_else(|| StoreError::not_found("service", namespace, name))?;
        if service.status == Status::Deleted {
            return Err(StoreError::deleted("service", namespace, name));
        }
        Ok(service)
    }

    /// Endpoints of a service by port name, merged over its live slices.
    pub fn get_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<BTreeMap<String, PortEndpoints>, StoreError> {
        let slices = self
            .namespace(namespace)?
            .endpoints
            .get(service)
            .ok_or_else(|| StoreError::not_found("endpoints", namespace, service))?;
        let merged = merge_slices(slices);
        if merged.is_empty() {
            return Err(StoreError::not_found("endpoints", namespace, service));
        }
        Ok(merged)
    }

    /// Number of controller replicas sharing the configuration load.
    pub fn replica_count(&self) -> usize {
        self.replicas.len().max(1)
    }

    /// True when an `ingressClassName` is handled by this controller.
    pub fn is_ingress_class_supported(&self, class: &str) -> bool {
        let mut controller = self
            .ingress_classes
            .get(class)
            .filter(|ig| ig.status != Status::Deleted)
            .map(|ig| ig.controller.as_str())
            .unwrap_or_default();
        if class.is_empty() {
            if let Some(default) = self.default_ingress_class() {
                controller = default.controller.as_str();
            }
        }
        if self.ingress_class.is_empty() {
            (class.is_empty() && controller.is_empty()) || controller == INGRESS_CLASS_CONTROLLER
        } else {
            (class.is_empty() && self.empty_ingress_class)
                || controller == format!("{INGRESS_CLASS_CONTROLLER}/{}", self.ingress_class)
        }
    }

    fn default_ingress_class(&self) -> Option<&IngressClass> {
        self.ingress_classes.values().find(|ig| {
            ig.status != Status::Deleted
                && ig
                    .annotations
                    .get(DEFAULT_INGRESS_CLASS_ANNOTATION)
                    .is_some_and(|value| value == "true")
        })
    }

    /// Settles the state after a committed pass: deleted objects are dropped
    /// and every other status goes back to [`Status::Empty`].
    pub fn clean(&mut self) {
        for namespace in self.namespaces.values_mut() {
            settle(&mut namespace.ingresses);
            settle(&mut namespace.services);
            settle(&mut namespace.secrets);
            settle(&mut namespace.gateways);
            settle(&mut namespace.tcp_routes);
            settle(&mut namespace.reference_grants);
            settle(&mut namespace.crs.global);
            settle(&mut namespace.crs.defaults);
            settle(&mut namespace.crs.backends);
            settle(&mut namespace.crs.frontends);
            settle(&mut namespace.crs.tcps);

            for slices in namespace.endpoints.values_mut() {
                settle(slices);
            }
            let emptied = namespace
                .endpoints
                .iter()
                .filter(|(_, slices)| slices.is_empty())
                .map(|(service, _)| service.clone())
                .collect::<Vec<_>>();
            for service in emptied {
                namespace.endpoints.remove(&service);
                namespace.runtime.remove(&service);
                namespace.runtime_standalone.remove(&service);
            }

            let standalone = namespace
                .runtime_standalone
                .values_mut()
                .flat_map(BTreeMap::values_mut)
                .flat_map(BTreeMap::values_mut);
            for backend in namespace
                .runtime
                .values_mut()
                .flat_map(BTreeMap::values_mut)
                .chain(standalone)
            {
                for server in &mut backend.servers {
                    server.modified = false;
                }
            }
        }
        settle(&mut self.ingress_classes);
        settle(&mut self.gateway_classes);
        for cm in self.config_maps.all_mut() {
            cm.status = Status::Empty;
        }
        self.secrets_processed.clear();
        self.backends_processed.clear();
        self.update_all_ingresses = false;
    }
}

fn settle<T: Tracked>(items: &mut BTreeMap<String, T>) {
    items.retain(|_, item| item.status() != Status::Deleted);
    for item in items.values_mut() {
        item.set_status(Status::Empty);
    }
}

fn merge_slices(slices: &BTreeMap<String, Endpoints>) -> BTreeMap<String, PortEndpoints> {
    let mut merged: BTreeMap<String, PortEndpoints> = BTreeMap::new();
    for slice in slices.values().filter(|s| s.status != Status::Deleted) {
        for (port_name, endpoints) in &slice.ports {
            let entry = merged
                .entry(port_name.clone())
                .or_insert_with(|| PortEndpoints {
                    port: endpoints.port,
                    addresses: BTreeSet::new(),
                });
            entry.addresses.extend(endpoints.addresses.iter().cloned());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_err, assert_ok};
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> K8s {
        K8s::new(
            StoreParams::builder()
                .main_configmap(NamespacedName::new("haproxy", "config"))
                .namespace_blacklist(vec!["kube-system".to_string()])
                .build(),
        )
    }

    fn class(name: &str, controller: &str, default: bool) -> IngressClass {
        let mut annotations = Annotations::new();
        if default {
            annotations.insert(
                DEFAULT_INGRESS_CLASS_ANNOTATION.to_string(),
                "true".to_string(),
            );
        }
        IngressClass {
            name: name.to_string(),
            controller: controller.to_string(),
            annotations,
            status: Status::Added,
        }
    }

    #[rstest]
    fn test_namespace_relevance(mut store: K8s) {
        assert!(store.namespace_mut("default").relevant);
        assert!(!store.namespace_mut("kube-system").relevant);
        assert!(!store.is_relevant_namespace(""));

        let whitelisted = K8s::new(
            StoreParams::builder()
                .namespace_whitelist(vec!["apps".to_string()])
                .build(),
        );
        assert!(whitelisted.is_relevant_namespace("apps"));
        assert!(!whitelisted.is_relevant_namespace("default"));
    }

    #[rstest]
    fn test_deleted_service_is_not_found(mut store: K8s) {
        store.namespace_mut("default").services.insert(
            "web".to_string(),
            Service {
                namespace: "default".to_string(),
                name: "web".to_string(),
                status: Status::Deleted,
                ..Service::default()
            },
        );
        assert!(matches!(
            assert_err!(store.get_service("default", "web")),
            StoreError::Deleted { .. }
        ));
        assert!(matches!(
            assert_err!(store.get_service("default", "api")),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            assert_err!(store.get_secret("other", "tls")),
            StoreError::NamespaceNotFound(_)
        ));
    }

    #[rstest]
    fn test_endpoints_are_merged_over_slices(mut store: K8s) {
        let ns = store.namespace_mut("default");
        let slice = |name: &str, addr: &str, status| Endpoints {
            slice_name: name.to_string(),
            namespace: "default".to_string(),
            service: "web".to_string(),
            ports: BTreeMap::from([(
                "http".to_string(),
                PortEndpoints {
                    port: 8080,
                    addresses: BTreeSet::from([addr.to_string()]),
                },
            )]),
            status,
        };
        let slices = ns.endpoints.entry("web".to_string()).or_default();
        slices.insert("a".to_string(), slice("a", "10.0.0.1", Status::Added));
        slices.insert("b".to_string(), slice("b", "10.0.0.2", Status::Added));
        slices.insert("c".to_string(), slice("c", "10.0.0.3", Status::Deleted));

        let merged = assert_ok!(store.get_endpoints("default", "web"));
        assert_eq!(
            merged["http"].addresses,
            BTreeSet::from(["10.0.0.1".to_string(), "10.0.0.2".to_string()])
        );
    }

    #[rstest]
    #[case("", false, "", None, true)]
    #[case("", false, "haproxy", Some(("haproxy", INGRESS_CLASS_CONTROLLER)), true)]
    #[case("", false, "nginx", Some(("nginx", "k8s.io/ingress-nginx")), false)]
    #[case("internal", false, "", None, false)]
    #[case("internal", true, "", None, true)]
    #[case(
        "internal",
        false,
        "internal",
        Some(("internal", "haproxy.org/ingress-controller/internal")),
        true
    )]
    fn test_ingress_class_support(
        mut store: K8s,
        #[case] controller_class: &str,
        #[case] empty_class: bool,
        #[case] ingress_class: &str,
        #[case] resource: Option<(&str, &str)>,
        #[case] expected: bool,
    ) {
        store.ingress_class = controller_class.to_string();
        store.empty_ingress_class = empty_class;
        if let Some((name, controller)) = resource {
            store
                .ingress_classes
                .insert(name.to_string(), class(name, controller, false));
        }
        assert_eq!(store.is_ingress_class_supported(ingress_class), expected);
    }

    #[rstest]
    fn test_default_ingress_class(mut store: K8s) {
        store.ingress_classes.insert(
            "nginx".to_string(),
            class("nginx", "k8s.io/ingress-nginx", true),
        );
        assert!(!store.is_ingress_class_supported(""));
        store.ingress_classes.insert(
            "nginx".to_string(),
            class("nginx", INGRESS_CLASS_CONTROLLER, true),
        );
        assert!(store.is_ingress_class_supported(""));
    }

    #[rstest]
    fn test_clean_drops_deleted(mut store: K8s) {
        let ns = store.namespace_mut("default");
        ns.secrets.insert(
            "old".to_string(),
            Secret {
                status: Status::Deleted,
                ..Secret::default()
            },
        );
        ns.secrets.insert(
            "new".to_string(),
            Secret {
                status: Status::Added,
                ..Secret::default()
            },
        );
        ns.runtime.entry("web".to_string()).or_default().insert(
            "http".to_string(),
            RuntimeBackend {
                servers: vec![HAProxySrv {
                    name: "SRV_1".to_string(),
                    modified: true,
                    ..HAProxySrv::default()
                }],
                ..RuntimeBackend::default()
            },
        );
        store.backends_processed.insert("default_web_http".to_string());

        store.clean();

        let ns = assert_ok!(store.namespace("default"));
        assert!(!ns.secrets.contains_key("old"));
        assert_eq!(ns.secrets["new"].status, Status::Empty);
        assert!(!ns.runtime["web"]["http"].servers[0].modified);
        assert!(store.backends_processed.is_empty());
    }

    #[rstest]
    fn test_config_map_roles(mut store: K8s) {
        assert!(store.config_maps.role_mut("haproxy", "config").is_some());
        assert!(store.config_maps.role_mut("haproxy", "other").is_none());
        assert!(store.config_maps.role_mut("", "").is_none());
    }
}
