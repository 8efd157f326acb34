mod convert;
mod watchers;

pub use convert::*;
pub use watchers::{WatchParams, spawn_watchers};

use haproxy_ingress_core::sync::signal::{Receiver, signal};
use haproxy_ingress_core::task::Builder as TaskBuilder;
use kube::Client;
use kube::core::GroupVersionKind;
use kube::discovery::pinned_kind;
use std::ops::Deref;
use tracing::{debug, error, info};

#[derive(Clone)]
pub struct KubeClientCell(Client);

impl PartialEq for KubeClientCell {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Deref for KubeClientCell {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Client> for KubeClientCell {
    fn from(client: Client) -> Self {
        Self(client)
    }
}

impl From<KubeClientCell> for Client {
    fn from(client_cell: KubeClientCell) -> Self {
        client_cell.0
    }
}

/// Connects to the API server in the background. The sender is held until
/// shutdown so receivers keep seeing the client.
pub fn start_kubernetes_client(task_builder: &TaskBuilder) -> Receiver<KubeClientCell> {
    let (tx, rx) = signal("kube_client");

    task_builder
        .new_task("kube_client")
        .spawn_until_shutdown(async move {
            match Client::try_default().await {
                Ok(client) => {
                    info!("Connected to Kubernetes API");
                    tx.set(KubeClientCell(client));
                    std::future::pending::<()>().await;
                }
                Err(e) => error!("Failed to create Kubernetes client: {}", e),
            }
        });

    rx
}

/// Waits for the client. `None` when it could not be created.
pub async fn wait_for_client(rx: &Receiver<KubeClientCell>) -> Option<KubeClientCell> {
    loop {
        if let Some(client) = rx.get() {
            return Some(client);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// True when the API server serves `kind` in `group/version`.
pub async fn crd_installed(client: &Client, group: &str, version: &str, kind: &str) -> bool {
    let gvk = GroupVersionKind::gvk(group, version, kind);
    match pinned_kind(client, &gvk).await {
        Ok(_) => true,
        Err(err) => {
            debug!("{group}/{version} {kind} not available: {err}");
            false
        }
    }
}
