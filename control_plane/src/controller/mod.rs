//! The instance controller: the single consumer of the event channel and
//! the only writer of the store and of the HAProxy configuration.
//!
//! Events update the store. A `COMMAND` event runs one reconcile pass when
//! something changed since the previous pass: a transaction is opened, the
//! global sections, the ingresses and the handlers program it, and on commit
//! HAProxy is reloaded or restarted if any step asked for it. A pass that
//! fails leaves the store untouched so the next one sees the same changes.

mod aux_cfg;
mod base;
mod global;

pub use aux_cfg::{AuxChange, AuxConfig};
pub use base::{add_base_rules, base_configuration, status_binds};

use crate::annotations::Settings;
use crate::default_service::local_service;
use crate::events::{EventData, SyncDataEvent};
use crate::gateway::GatewayManager;
use crate::handlers::{
    BindAddresses, ErrorFiles, Handler, Https, PatternFiles, ProxyProtocol, Refresh,
    TcpCustomResources, TcpServices,
};
use crate::ingress;
use crate::instrumentation::record_reconcile;
use crate::route::CustomRoutes;
use crate::status::{IngressStatusUpdate, pending_updates};
use crate::store::{Ingress, K8s, NamespacedName, Status};
use base::set_binds;
use getset::{CopyGetters, Getters};
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::configuration::TransactionError;
use haproxy_ingress_dataplane::env::FRONT_HTTP;
use haproxy_ingress_dataplane::process::{Action, ProcessError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct ControllerParams {
    #[builder(setter(into))]
    pub pod_namespace: String,
    #[builder(default, setter(strip_option))]
    pub default_backend_service: Option<NamespacedName>,
    #[builder(default, setter(strip_option))]
    pub default_ssl_certificate: Option<NamespacedName>,
    #[builder(default = 6061)]
    pub default_backend_port: u16,
    #[builder(default = 1042)]
    pub healthz_port: u16,
    #[builder(default = 1024)]
    pub stats_port: u16,
    #[builder(default = 8080)]
    pub http_port: u16,
    #[builder(default = 8443)]
    pub https_port: u16,
    #[builder(default)]
    pub addresses: BindAddresses,
    #[builder(default)]
    pub disable_http: bool,
    #[builder(default)]
    pub disable_https: bool,
    #[builder(default)]
    pub disable_ipv6: bool,
}

#[derive(Getters, CopyGetters)]
pub struct Controller {
    #[getset(get = "pub")]
    store: K8s,
    #[getset(get = "pub")]
    haproxy: HAProxy,
    settings: Settings,
    params: ControllerParams,
    handlers: Vec<Box<dyn Handler>>,
    routes: CustomRoutes,
    aux: AuxConfig,
    /// Set once a configuration was committed.
    #[getset(get_copy = "pub")]
    ready: bool,
    /// Store changes not yet applied.
    #[getset(get_copy = "pub")]
    pending: bool,
    status: Option<mpsc::UnboundedSender<Vec<IngressStatusUpdate>>>,
}

impl Controller {
    pub fn new(mut store: K8s, haproxy: HAProxy, settings: Settings, params: ControllerParams) -> Self {
        let (service, endpoints) = local_service(&params.pod_namespace, params.default_backend_port);
        store.event_service(service);
        store.event_endpoints(endpoints);

        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(GatewayManager::new(params.addresses.clone())),
            Box::new(
                Https::builder()
                    .enabled(!params.disable_https)
                    .port(params.https_port)
                    .addresses(params.addresses.clone())
                    .build(),
            ),
            Box::new(ProxyProtocol),
            Box::new(ErrorFiles::new(&haproxy)),
            Box::new(TcpServices::new(params.addresses.clone())),
            Box::new(PatternFiles::new(&haproxy)),
            Box::new(TcpCustomResources),
            Box::new(Refresh),
        ];
        let aux = AuxConfig::new(haproxy.env().aux_cfg_file.clone());
        Self {
            store,
            haproxy,
            settings,
            params,
            handlers,
            routes: CustomRoutes::default(),
            aux,
            ready: false,
            pending: true,
            status: None,
        }
    }

    /// Sends the ingress status changes of each committed pass to `tx`.
    #[must_use]
    pub fn with_status_updates(mut self, tx: mpsc::UnboundedSender<Vec<IngressStatusUpdate>>) -> Self {
        self.status = Some(tx);
        self
    }

    /// Starts HAProxy with the base configuration, the auxiliary file
    /// included when it already exists.
    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.aux.check() != AuxChange::None {
            self.haproxy.use_aux_file(self.aux.in_use());
        }
        self.haproxy.service(Action::Start).await
    }

    /// Consumes events until every producer is gone, then stops HAProxy.
    pub async fn run(&mut self, events: &mut mpsc::Receiver<SyncDataEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("Event channel closed, stopping HAProxy");
        if let Err(err) = self.haproxy.service(Action::Stop).await {
            error!("{err}");
        }
    }

    pub async fn handle_event(&mut self, event: SyncDataEvent) {
        let SyncDataEvent {
            kind,
            namespace,
            name,
            data,
            done,
        } = event;
        trace!(%kind, %namespace, %name, "Handling event");
        let store = &mut self.store;
        let changed = match data {
            EventData::Command => {
                self.on_command().await;
                false
            }
            EventData::Namespace(event) => store.event_namespace(event),
            EventData::Ingress(ingress) => store.event_ingress(ingress),
            EventData::IngressClass(class) => store.event_ingress_class(class),
            EventData::Endpoints(endpoints) => match store.event_endpoints(endpoints) {
                Some(updates) => {
                    for update in updates {
                        self.haproxy
                            .sync_backend_servers(&update.backend, &update.servers)
                            .await;
                    }
                    true
                }
                None => false,
            },
            EventData::Service(service) => store.event_service(service),
            EventData::PublishService(service) => store.event_publish_service(service),
            EventData::ConfigMap(cm) => store.event_config_map(cm),
            EventData::Secret(secret) => store.event_secret(secret),
            EventData::Pod(pod) => store.event_pod(pod),
            EventData::GatewayClass(class) => store.event_gateway_class(class),
            EventData::Gateway(gateway) => store.event_gateway(gateway),
            EventData::TcpRoute(route) => store.event_tcp_route(route),
            EventData::ReferenceGrant(grant) => store.event_reference_grant(grant),
            EventData::GlobalCr(item) => store.event_global_cr(item),
            EventData::DefaultsCr(item) => store.event_defaults_cr(item),
            EventData::BackendCr(item) => store.event_backend_cr(item),
            EventData::FrontendCr(item) => store.event_frontend_cr(item),
            EventData::TcpCr(cr) => store.event_tcp_cr(cr),
        };
        if changed {
            trace!(%kind, %namespace, %name, "Store changed");
            self.pending = true;
        }
        if let Some(done) = done {
            done.send(()).ok();
        }
    }

    async fn on_command(&mut self) {
        match self.aux.check() {
            AuxChange::None => {}
            AuxChange::Reload => self
                .haproxy
                .instance_mut()
                .reload("auxiliary configuration modified"),
            AuxChange::Restart => {
                let in_use = self.aux.in_use();
                self.haproxy.use_aux_file(in_use);
                self.haproxy.instance_mut().restart(if in_use {
                    "auxiliary configuration added"
                } else {
                    "auxiliary configuration removed"
                });
            }
        }
        let instance = self.haproxy.instance();
        if self.pending || instance.need_reload() || instance.need_restart() {
            self.reconcile().await;
        }
    }

    /// Runs one pass. Returns true when it was committed.
    pub async fn reconcile(&mut self) -> bool {
        let result = self.update_haproxy().await;
        record_reconcile(result.is_ok());
        match result {
            Ok(()) => {
                self.pending = false;
                true
            }
            Err(err) => {
                error!("HAProxy configuration not applied: {err}");
                self.haproxy.dispose_transaction();
                self.haproxy.clean();
                self.store.backends_processed.clear();
                self.store.secrets_processed.clear();
                false
            }
        }
    }

    fn supported_ingresses(&self) -> Vec<Ingress> {
        self.store
            .namespaces
            .values()
            .filter(|ns| ns.relevant)
            .flat_map(|ns| ns.ingresses.values())
            .filter(|ingress| ingress.status != Status::Deleted)
            .filter(|ingress| ingress::is_supported(&self.store, ingress))
            .cloned()
            .collect()
    }

    fn set_http_binds(&mut self) -> Result<(), TransactionError> {
        let binds = if self.params.disable_http {
            Vec::new()
        } else {
            self.params.addresses.binds(self.params.http_port)
        };
        let changed = set_binds(self.haproxy.config_mut()?, FRONT_HTTP, binds)?;
        self.haproxy
            .instance_mut()
            .reload_if(changed, "http binds updated");
        Ok(())
    }

    fn expose_status_binds(&mut self) -> Result<(), TransactionError> {
        let binds = status_binds(
            self.params.healthz_port,
            self.params.stats_port,
            !self.params.disable_ipv6,
        );
        let config = self.haproxy.config_mut()?;
        let mut changed = false;
        for (frontend, binds) in binds {
            changed |= set_binds(config, frontend, binds)?;
        }
        self.haproxy
            .instance_mut()
            .reload_if(changed, "healthz and stats binds added");
        Ok(())
    }

    async fn update_haproxy(&mut self) -> Result<(), ControllerError> {
        self.haproxy.start_transaction()?;

        let ingresses = self.supported_ingresses();
        let assign_default_backend = ingresses
            .iter()
            .all(|ingress| ingress.default_backend.is_none());
        global::handle_global_config(
            &mut self.store,
            &mut self.haproxy,
            &self.settings,
            &self.params,
            assign_default_backend,
        )
        .await?;
        add_base_rules(&mut self.haproxy);
        self.set_http_binds()?;

        self.routes.reset(self.haproxy.config_mut()?)?;
        for ingress in &ingresses {
            ingress::update(
                &mut self.store,
                &mut self.haproxy,
                &mut self.routes,
                &self.settings,
                ingress,
            )
            .await;
        }
        self.routes.finish(self.haproxy.instance_mut());

        for handler in &mut self.handlers {
            trace!(handler = handler.name(), "Running handler");
            if let Err(err) = handler
                .update(&mut self.store, &mut self.haproxy, &self.settings)
                .await
            {
                error!(handler = handler.name(), "{err}");
            }
        }

        if !self.ready {
            self.expose_status_binds()?;
        }
        let changed = self.haproxy.commit_transaction()?;
        debug!(changed, "Configuration committed");

        if !self.ready {
            self.ready = true;
            info!("HAProxy configuration committed, controller ready");
            let main = &self.store.config_maps.main;
            if !main.name.is_empty() && !main.loaded {
                warn!(
                    "Main configmap '{}/{}' not found, using defaults",
                    main.namespace, main.name
                );
            }
        }

        let instance = self.haproxy.instance();
        let action = if instance.need_restart() {
            Some(Action::Restart)
        } else if instance.need_reload() {
            Some(Action::Reload)
        } else {
            None
        };
        if let Some(action) = action {
            info!(reasons = %instance.reasons().join(", "), "HAProxy {action} required");
            self.haproxy.service(action).await?;
        }
        self.haproxy.instance_mut().reset();

        let updates = pending_updates(&mut self.store);
        if !updates.is_empty() {
            if let Some(tx) = &self.status {
                if tx.send(updates).is_err() {
                    warn!("Ingress status updater stopped");
                }
            }
        }

        self.store.clean();
        self.haproxy.clean();
        Ok(())
    }
}
