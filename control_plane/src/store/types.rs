use chrono::{DateTime, Utc};
use haproxy_ingress_api::v3::TcpModel;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use strum::{Display as StrumDisplay, EnumString};
use thiserror::Error;

/// Reconciliation state of a stored object. `Empty` is the state after a
/// successful pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Added,
    Modified,
    Deleted,
    #[default]
    Empty,
}

pub type Annotations = BTreeMap<String, String>;

/// Implements `PartialEq` over the listed fields only, leaving out status
/// markers and timestamps.
macro_rules! eq_by_fields {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                true $(&& self.$field == other.$field)+
            }
        }
    };
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected 'namespace/name', got '{0}'")]
pub struct NamespacedNameError(String);

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for NamespacedName {
    type Err = NamespacedNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(NamespacedNameError(s.to_string())),
        }
    }
}

impl Display for NamespacedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, StrumDisplay, EnumString)]
pub enum PathType {
    Exact,
    #[default]
    Prefix,
    ImplementationSpecific,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressPath {
    pub svc_namespace: String,
    pub svc_name: String,
    pub svc_port_int: Option<u16>,
    pub svc_port_string: String,
    pub path: String,
    pub path_type: PathType,
    pub is_default_backend: bool,
}

impl IngressPath {
    /// Several backends may share a host, so paths are keyed by type, path
    /// and service.
    pub fn key(&self) -> String {
        let port = self
            .svc_port_int
            .map_or_else(|| self.svc_port_string.clone(), |port| port.to_string());
        format!("{}-{}-{}-{}", self.path_type, self.path, self.svc_name, port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressRule {
    pub host: String,
    pub paths: BTreeMap<String, IngressPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressTls {
    pub hosts: Vec<String>,
    pub secret_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Ingress {
    pub api_version: String,
    pub namespace: String,
    pub name: String,
    pub class: String,
    pub annotations: Annotations,
    pub rules: BTreeMap<String, IngressRule>,
    pub default_backend: Option<IngressPath>,
    pub tls: BTreeMap<String, IngressTls>,
    /// Load balancer addresses currently published in the object status.
    pub addresses: Vec<String>,
    pub status: Status,
}

eq_by_fields!(Ingress {
    api_version,
    namespace,
    name,
    class,
    annotations,
    rules,
    default_backend,
    tls,
});

#[derive(Debug, Clone, Default)]
pub struct IngressClass {
    pub name: String,
    pub controller: String,
    pub annotations: Annotations,
    pub status: Status,
}

eq_by_fields!(IngressClass {
    name,
    controller,
    annotations
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub annotations: Annotations,
    pub ports: Vec<ServicePort>,
    pub addresses: Vec<String>,
    /// External name of `ExternalName` services.
    pub dns: String,
    pub status: Status,
}

eq_by_fields!(Service {
    namespace,
    name,
    annotations,
    ports,
    dns
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortEndpoints {
    pub port: u16,
    pub addresses: BTreeSet<String>,
}

/// One endpoint slice of a service.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub slice_name: String,
    pub namespace: String,
    pub service: String,
    pub ports: BTreeMap<String, PortEndpoints>,
    pub status: Status,
}

eq_by_fields!(Endpoints {
    slice_name,
    namespace,
    service,
    ports
});

/// Server slot of a backend. An empty address is a disabled slot kept for
/// later scaling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HAProxySrv {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub modified: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeBackend {
    pub name: String,
    pub endpoints: PortEndpoints,
    pub servers: Vec<HAProxySrv>,
    /// Addresses without a slot after the last sync.
    pub pending: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub status: Status,
}

eq_by_fields!(Secret {
    namespace,
    name,
    data
});

#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    pub namespace: String,
    pub name: String,
    pub annotations: Annotations,
    pub loaded: bool,
    pub status: Status,
}

eq_by_fields!(ConfigMap {
    namespace,
    name,
    annotations
});

/// A namespaced custom resource of the vendor group.
#[derive(Debug, Clone, Default)]
pub struct CrItem<T> {
    pub namespace: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub spec: T,
    pub status: Status,
}

impl<T: PartialEq> PartialEq for CrItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name && self.spec == other.spec
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpItem {
    pub model: TcpModel,
    /// Reason of a collision with an older resource.
    pub collision: Option<String>,
}

/// A `TCP` resource and its per-model collision markers.
#[derive(Debug, Clone, Default)]
pub struct TcpCr {
    pub namespace: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub items: Vec<TcpItem>,
    pub status: Status,
}

impl PartialEq for TcpCr {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.model == b.model)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceEvent {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: Status,
}

#[derive(Debug, Clone, Default)]
pub struct Pod {
    pub name: String,
    pub status: Status,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayClass {
    pub name: String,
    pub controller_name: String,
    pub description: Option<String>,
    pub generation: i64,
    pub status: Status,
}

eq_by_fields!(GatewayClass {
    name,
    controller_name,
    description
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteGroupKind {
    pub group: String,
    pub kind: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, StrumDisplay, EnumString)]
pub enum FromNamespaces {
    All,
    #[default]
    Same,
    Selector,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub port: u16,
    pub protocol: String,
    pub hostname: Option<String>,
    pub allowed_kinds: Vec<RouteGroupKind>,
    pub from_namespaces: FromNamespaces,
    pub namespace_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct Gateway {
    pub namespace: String,
    pub name: String,
    pub class_name: String,
    pub listeners: Vec<Listener>,
    pub generation: i64,
    pub status: Status,
}

eq_by_fields!(Gateway {
    namespace,
    name,
    class_name,
    listeners
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentRef {
    pub namespace: Option<String>,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendRef {
    pub group: Option<String>,
    pub kind: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub port: Option<u16>,
    pub weight: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct TcpRoute {
    pub namespace: String,
    pub name: String,
    pub parent_refs: Vec<ParentRef>,
    pub backend_refs: Vec<BackendRef>,
    pub created: DateTime<Utc>,
    pub generation: i64,
    pub status: Status,
}

eq_by_fields!(TcpRoute {
    namespace,
    name,
    parent_refs,
    backend_refs
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantTo {
    pub group: String,
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReferenceGrant {
    pub namespace: String,
    pub name: String,
    pub from: Vec<GrantFrom>,
    pub to: Vec<GrantTo>,
    pub status: Status,
}

eq_by_fields!(ReferenceGrant {
    namespace,
    name,
    from,
    to
});

/// Objects carrying a reconciliation [`Status`].
pub trait Tracked {
    fn status(&self) -> Status;
    fn set_status(&mut self, status: Status);
}

macro_rules! tracked {
    ($($ty:ty),+ $(,)?) => {
        $(impl Tracked for $ty {
            fn status(&self) -> Status {
                self.status
            }

            fn set_status(&mut self, status: Status) {
                self.status = status;
            }
        })+
    };
}

tracked!(
    Ingress,
    IngressClass,
    Service,
    Endpoints,
    Secret,
    ConfigMap,
    TcpCr,
    GatewayClass,
    Gateway,
    TcpRoute,
    ReferenceGrant,
);

impl<T> Tracked for CrItem<T> {
    fn status(&self) -> Status {
        self.status
    }

    fn set_status(&mut self, status: Status) {
        self.status = status;
    }
}
