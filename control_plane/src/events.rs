//! Events flowing from the watchers to the controller.
//!
//! Every watcher converts Kubernetes objects into store types and pushes
//! them on one bounded channel. The controller consumes events in arrival
//! order. `COMMAND` events carry no data and ask the controller to apply the
//! changes gathered since the previous one.

use crate::store::{
    ConfigMap, CrItem, Endpoints, Gateway, GatewayClass, Ingress, IngressClass, NamespaceEvent,
    Pod, ReferenceGrant, Secret, Service, TcpCr, TcpRoute,
};
use haproxy_ingress_api::v3::{BackendSpec, DefaultsSpec, FrontendSpec, GlobalSpec};
use haproxy_ingress_core::sync::signal::Receiver;
use std::time::Duration;
use strum::{Display, IntoStaticStr};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    Namespace,
    Ingress,
    IngressClass,
    Endpoints,
    Service,
    PublishService,
    Configmap,
    Secret,
    Pod,
    Gatewayclass,
    Gateway,
    Tcproute,
    Referencegrant,
    CrGlobal,
    CrDefaults,
    CrBackend,
    CrFrontend,
    CrTcp,
    Command,
}

/// Payload of an event, already converted to store types. The status of the
/// object tells whether it was added, modified or deleted.
#[derive(Debug, Clone)]
pub enum EventData {
    Namespace(NamespaceEvent),
    Ingress(Ingress),
    IngressClass(IngressClass),
    Endpoints(Endpoints),
    Service(Service),
    PublishService(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Pod(Pod),
    GatewayClass(GatewayClass),
    Gateway(Gateway),
    TcpRoute(TcpRoute),
    ReferenceGrant(ReferenceGrant),
    GlobalCr(CrItem<GlobalSpec>),
    DefaultsCr(CrItem<DefaultsSpec>),
    BackendCr(CrItem<BackendSpec>),
    FrontendCr(CrItem<FrontendSpec>),
    TcpCr(TcpCr),
    Command,
}

impl EventData {
    pub fn kind(&self) -> SyncType {
        match self {
            Self::Namespace(_) => SyncType::Namespace,
            Self::Ingress(_) => SyncType::Ingress,
            Self::IngressClass(_) => SyncType::IngressClass,
            Self::Endpoints(_) => SyncType::Endpoints,
            Self::Service(_) => SyncType::Service,
            Self::PublishService(_) => SyncType::PublishService,
            Self::ConfigMap(_) => SyncType::Configmap,
            Self::Secret(_) => SyncType::Secret,
            Self::Pod(_) => SyncType::Pod,
            Self::GatewayClass(_) => SyncType::Gatewayclass,
            Self::Gateway(_) => SyncType::Gateway,
            Self::TcpRoute(_) => SyncType::Tcproute,
            Self::ReferenceGrant(_) => SyncType::Referencegrant,
            Self::GlobalCr(_) => SyncType::CrGlobal,
            Self::DefaultsCr(_) => SyncType::CrDefaults,
            Self::BackendCr(_) => SyncType::CrBackend,
            Self::FrontendCr(_) => SyncType::CrFrontend,
            Self::TcpCr(_) => SyncType::CrTcp,
            Self::Command => SyncType::Command,
        }
    }
}

#[derive(Debug)]
pub struct SyncDataEvent {
    pub kind: SyncType,
    pub namespace: String,
    pub name: String,
    pub data: EventData,
    /// Completed once the controller has handled the event.
    pub done: Option<oneshot::Sender<()>>,
}

impl SyncDataEvent {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, data: EventData) -> Self {
        Self {
            kind: data.kind(),
            namespace: namespace.into(),
            name: name.into(),
            data,
            done: None,
        }
    }

    pub fn command() -> Self {
        Self::new("", "", EventData::Command)
    }

    /// Returns the event and a receiver completed once it was handled.
    pub fn with_done(mut self) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        self.done = Some(tx);
        (self, rx)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("event channel closed")]
pub struct ChannelClosed;

/// Producer side of the event channel. Events are never dropped: a full
/// channel is reported and the producer waits.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::Sender<SyncDataEvent>);

impl EventSender {
    pub async fn send(&self, event: SyncDataEvent) -> Result<(), ChannelClosed> {
        match self.0.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!(
                    kind = %event.kind,
                    capacity = self.0.max_capacity(),
                    "Event channel full, consider raising --channel-size"
                );
                self.0.send(event).await.map_err(|_| ChannelClosed)
            }
            Err(TrySendError::Closed(_)) => Err(ChannelClosed),
        }
    }

    pub async fn command(&self) -> Result<(), ChannelClosed> {
        self.send(SyncDataEvent::command()).await
    }
}

pub fn event_channel(size: usize) -> (EventSender, mpsc::Receiver<SyncDataEvent>) {
    let (tx, rx) = mpsc::channel(size.max(1));
    (EventSender(tx), rx)
}

/// Emits `COMMAND` every `period` until the channel closes.
pub async fn run_ticker(tx: EventSender, period: Duration) {
    debug!("Executing sync period every {period:?}");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if tx.command().await.is_err() {
            break;
        }
    }
}

/// Emits `COMMAND` each time `changes` moves, so that file changes are
/// applied without waiting for the ticker.
pub async fn forward_changes(changes: Receiver<u64>, tx: EventSender) {
    while changes.changed().await.is_ok() {
        trace!("Watched file changed");
        if tx.command().await.is_err() {
            break;
        }
    }
}
