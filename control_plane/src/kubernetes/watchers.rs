//! Watches on the API server feeding the event channel.
//!
//! Each watched kind runs its own stream. The first listing and every
//! re-list after a lost watch are diffed against the objects seen before, so
//! objects deleted while disconnected still produce a delete event.

use super::{KubeClientCell, convert, crd_installed};
use crate::events::{EventData, EventSender, SyncDataEvent};
use crate::store::{NamespacedName, Status};
use futures::StreamExt;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::referencegrants::ReferenceGrant;
use haproxy_ingress_api::constants::{
    BACKEND_CRD_KIND, DEFAULTS_CRD_KIND, FRONTEND_CRD_KIND, GLOBAL_CRD_KIND, GROUP,
    TCP_CRD_KIND, VERSION,
};
use haproxy_ingress_api::gateway::TCPRoute;
use haproxy_ingress_api::v3::{Backend, Defaults, Frontend, Global, TCP};
use haproxy_ingress_core::task::Builder as TaskBuilder;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use tracing::{debug, info, trace, warn};
use typed_builder::TypedBuilder;

const GATEWAY_GROUP: &str = "gateway.networking.k8s.io";

#[derive(Debug, Clone, TypedBuilder)]
pub struct WatchParams {
    /// Namespaces to watch. Empty watches all of them.
    #[builder(default)]
    namespaces: Vec<String>,
    #[builder(setter(into))]
    pod_namespace: String,
    #[builder(default)]
    config_maps: Vec<NamespacedName>,
    #[builder(default)]
    publish_service: Option<NamespacedName>,
    #[builder(default = true)]
    gateway_api: bool,
}

/// Objects seen by one watch, keyed by `namespace/name`.
struct Tracker<K> {
    known: BTreeMap<String, K>,
    relist: Option<BTreeSet<String>>,
}

impl<K: Resource + Clone> Tracker<K> {
    fn new() -> Self {
        Self {
            known: BTreeMap::new(),
            relist: None,
        }
    }

    fn key(object: &K) -> String {
        format!(
            "{}/{}",
            object.meta().namespace.as_deref().unwrap_or_default(),
            object.meta().name.as_deref().unwrap_or_default()
        )
    }

    fn init(&mut self) {
        self.relist = Some(BTreeSet::new());
    }

    fn apply(&mut self, object: K) -> Status {
        let key = Self::key(&object);
        if let Some(relist) = &mut self.relist {
            relist.insert(key.clone());
        }
        match self.known.insert(key, object) {
            Some(_) => Status::Modified,
            None => Status::Added,
        }
    }

    fn delete(&mut self, object: &K) {
        self.known.remove(&Self::key(object));
    }

    /// Objects that vanished during a re-list.
    fn init_done(&mut self) -> Vec<K> {
        let Some(relist) = self.relist.take() else {
            return Vec::new();
        };
        let stale = self
            .known
            .keys()
            .filter(|key| !relist.contains(*key))
            .cloned()
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .filter_map(|key| self.known.remove(&key))
            .collect()
    }
}

async fn send_all<K: Resource>(
    tx: &EventSender,
    object: &K,
    events: Vec<EventData>,
) -> Result<(), crate::events::ChannelClosed> {
    let namespace = object.meta().namespace.clone().unwrap_or_default();
    let name = object.meta().name.clone().unwrap_or_default();
    for data in events {
        tx.send(SyncDataEvent::new(namespace.clone(), name.clone(), data))
            .await?;
    }
    Ok(())
}

/// Streams `api` into the event channel until the channel closes.
async fn run_watcher<K, F>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
    tx: EventSender,
    convert: F,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K, Status) -> Vec<EventData> + Send + Sync,
{
    info!("Watching {kind}");
    let mut tracker = Tracker::new();
    let mut stream = watcher(api, config).default_backoff().boxed();
    while let Some(event) = stream.next().await {
        let result = match event {
            Ok(watcher::Event::Init) => {
                trace!(kind, "Listing");
                tracker.init();
                Ok(())
            }
            Ok(watcher::Event::InitApply(object) | watcher::Event::Apply(object)) => {
                let status = tracker.apply(object.clone());
                send_all(&tx, &object, convert(&object, status)).await
            }
            Ok(watcher::Event::Delete(object)) => {
                tracker.delete(&object);
                send_all(&tx, &object, convert(&object, Status::Deleted)).await
            }
            Ok(watcher::Event::InitDone) => {
                debug!(kind, "Listing done");
                let mut result = Ok(());
                for object in tracker.init_done() {
                    result = send_all(&tx, &object, convert(&object, Status::Deleted)).await;
                    if result.is_err() {
                        break;
                    }
                }
                match result {
                    Ok(()) => tx.command().await,
                    err => err,
                }
            }
            Err(err) => {
                warn!(kind, "Watch failed: {err}");
                Ok(())
            }
        };
        if result.is_err() {
            debug!(kind, "Event channel closed, watch stopped");
            return;
        }
    }
}

fn namespaced_apis<K>(client: &Client, namespaces: &[String]) -> Vec<Api<K>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    if namespaces.is_empty() {
        vec![Api::all(client.clone())]
    } else {
        namespaces
            .iter()
            .map(|ns| Api::namespaced(client.clone(), ns))
            .collect()
    }
}

macro_rules! spawn_namespaced {
    ($builder:expr, $client:expr, $params:expr, $tx:expr, $kind:literal, $ty:ty, $convert:expr) => {
        for api in namespaced_apis::<$ty>($client, &$params.namespaces) {
            $builder.new_task($kind).spawn_until_shutdown(run_watcher(
                $kind,
                api,
                watcher::Config::default(),
                $tx.clone(),
                $convert,
            ));
        }
    };
}

/// Starts a watch for every kind the controller consumes. Custom resources
/// and Gateway API kinds are only watched when installed.
pub async fn spawn_watchers(
    task_builder: &TaskBuilder,
    client: KubeClientCell,
    params: WatchParams,
    tx: EventSender,
) {
    let client: Client = client.into();

    task_builder
        .new_task("watch_namespaces")
        .spawn_until_shutdown(run_watcher(
            "namespaces",
            Api::<Namespace>::all(client.clone()),
            watcher::Config::default(),
            tx.clone(),
            |ns: &Namespace, status| vec![EventData::Namespace(convert::namespace(ns, status))],
        ));
    task_builder
        .new_task("watch_ingressclasses")
        .spawn_until_shutdown(run_watcher(
            "ingressclasses",
            Api::<IngressClass>::all(client.clone()),
            watcher::Config::default(),
            tx.clone(),
            |class: &IngressClass, status| {
                vec![EventData::IngressClass(convert::ingress_class(class, status))]
            },
        ));

    spawn_namespaced!(task_builder, &client, params, tx, "watch_ingresses", Ingress,
        |ingress: &Ingress, status| vec![EventData::Ingress(convert::ingress(ingress, status))]);
    spawn_namespaced!(task_builder, &client, params, tx, "watch_services", Service,
        |service: &Service, status| vec![EventData::Service(convert::service(service, status))]);
    spawn_namespaced!(task_builder, &client, params, tx, "watch_endpointslices", EndpointSlice,
        |slice: &EndpointSlice, status| {
            convert::endpoints(slice, status)
                .map(EventData::Endpoints)
                .into_iter()
                .collect()
        });
    spawn_namespaced!(task_builder, &client, params, tx, "watch_secrets", Secret,
        |secret: &Secret, status| vec![EventData::Secret(convert::secret(secret, status))]);

    for cm in &params.config_maps {
        task_builder
            .new_task("watch_configmap")
            .spawn_until_shutdown(run_watcher(
                "configmaps",
                Api::<ConfigMap>::namespaced(client.clone(), &cm.namespace),
                watcher::Config::default().fields(&format!("metadata.name={}", cm.name)),
                tx.clone(),
                |cm: &ConfigMap, status| vec![EventData::ConfigMap(convert::config_map(cm, status))],
            ));
    }

    if let Some(publish) = &params.publish_service {
        task_builder
            .new_task("watch_publish_service")
            .spawn_until_shutdown(run_watcher(
                "publish service",
                Api::<Service>::namespaced(client.clone(), &publish.namespace),
                watcher::Config::default().fields(&format!("metadata.name={}", publish.name)),
                tx.clone(),
                |service: &Service, status| {
                    let mut converted = convert::service(service, status);
                    converted.addresses = convert::service_addresses(service);
                    vec![EventData::PublishService(converted)]
                },
            ));
    }

    task_builder
        .new_task("watch_pods")
        .spawn_until_shutdown(run_watcher(
            "pods",
            Api::<Pod>::namespaced(client.clone(), &params.pod_namespace),
            watcher::Config::default(),
            tx.clone(),
            |pod: &Pod, status| vec![EventData::Pod(convert::pod(pod, status))],
        ));

    if crd_installed(&client, GROUP, VERSION, GLOBAL_CRD_KIND).await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_globals", Global,
            |cr: &Global, status| vec![EventData::GlobalCr(convert::cr_item(cr, &cr.spec, status))]);
    }
    if crd_installed(&client, GROUP, VERSION, DEFAULTS_CRD_KIND).await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_defaults", Defaults,
            |cr: &Defaults, status| vec![EventData::DefaultsCr(convert::cr_item(cr, &cr.spec, status))]);
    }
    if crd_installed(&client, GROUP, VERSION, BACKEND_CRD_KIND).await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_backends", Backend,
            |cr: &Backend, status| vec![EventData::BackendCr(convert::cr_item(cr, &cr.spec, status))]);
    }
    if crd_installed(&client, GROUP, VERSION, FRONTEND_CRD_KIND).await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_frontends", Frontend,
            |cr: &Frontend, status| vec![EventData::FrontendCr(convert::cr_item(cr, &cr.spec, status))]);
    }
    if crd_installed(&client, GROUP, VERSION, TCP_CRD_KIND).await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_tcps", TCP,
            |cr: &TCP, status| vec![EventData::TcpCr(convert::tcp_cr(cr, status))]);
    }

    if !params.gateway_api {
        return;
    }
    if crd_installed(&client, GATEWAY_GROUP, "v1", "GatewayClass").await {
        task_builder
            .new_task("watch_gatewayclasses")
            .spawn_until_shutdown(run_watcher(
                "gatewayclasses",
                Api::<GatewayClass>::all(client.clone()),
                watcher::Config::default(),
                tx.clone(),
                |class: &GatewayClass, status| {
                    vec![EventData::GatewayClass(convert::gateway_class(class, status))]
                },
            ));
    }
    if crd_installed(&client, GATEWAY_GROUP, "v1", "Gateway").await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_gateways", Gateway,
            |gateway: &Gateway, status| vec![EventData::Gateway(convert::gateway(gateway, status))]);
    }
    if crd_installed(&client, GATEWAY_GROUP, "v1alpha2", "TCPRoute").await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_tcproutes", TCPRoute,
            |route: &TCPRoute, status| vec![EventData::TcpRoute(convert::tcp_route(route, status))]);
    }
    if crd_installed(&client, GATEWAY_GROUP, "v1beta1", "ReferenceGrant").await {
        spawn_namespaced!(task_builder, &client, params, tx, "watch_referencegrants", ReferenceGrant,
            |grant: &ReferenceGrant, status| {
                vec![EventData::ReferenceGrant(convert::reference_grant(grant, status))]
            });
    }
}
