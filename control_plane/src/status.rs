//! Load balancer addresses published in ingress statuses.
//!
//! A supported ingress reports the addresses of the publish service. An
//! ingress that stopped being supported has ours removed, unless another
//! controller already overwrote them.

use crate::ingress::is_supported;
use crate::kubernetes::KubeClientCell;
use crate::store::{K8s, Status};
use itertools::Itertools;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::Api;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressStatusUpdate {
    pub namespace: String,
    pub name: String,
    pub addresses: Vec<String>,
}

fn same_addresses(a: &[String], b: &[String]) -> bool {
    a.iter().sorted().eq(b.iter().sorted())
}

/// Status changes due after a committed pass. The addresses are recorded in
/// the store right away so that a later pass does not resend them.
pub fn pending_updates(store: &mut K8s) -> Vec<IngressStatusUpdate> {
    let update_all = std::mem::take(&mut store.update_all_ingresses);
    let published = store.publish_service_addresses.clone();

    let mut candidates = Vec::new();
    for ns in store.namespaces.values().filter(|ns| ns.relevant) {
        for ingress in ns.ingresses.values() {
            let touched = matches!(ingress.status, Status::Added | Status::Modified);
            if ingress.status == Status::Deleted || !(update_all || touched) {
                continue;
            }
            let addresses = if is_supported(store, ingress) {
                published.clone()
            } else if !ingress.addresses.is_empty()
                && same_addresses(&ingress.addresses, &published)
            {
                Vec::new()
            } else {
                continue;
            };
            if !same_addresses(&ingress.addresses, &addresses) {
                candidates.push(IngressStatusUpdate {
                    namespace: ingress.namespace.clone(),
                    name: ingress.name.clone(),
                    addresses,
                });
            }
        }
    }

    for update in &candidates {
        if let Some(ingress) = store
            .namespaces
            .get_mut(&update.namespace)
            .and_then(|ns| ns.ingresses.get_mut(&update.name))
        {
            ingress.addresses.clone_from(&update.addresses);
        }
    }
    candidates
}

/// A value parsing as an IP address is reported as such, anything else as
/// a hostname.
pub fn load_balancer_ingress(addresses: &[String]) -> Vec<IngressLoadBalancerIngress> {
    addresses
        .iter()
        .map(|address| {
            if address.parse::<IpAddr>().is_ok() {
                IngressLoadBalancerIngress {
                    ip: Some(address.clone()),
                    ..IngressLoadBalancerIngress::default()
                }
            } else {
                IngressLoadBalancerIngress {
                    hostname: Some(address.clone()),
                    ..IngressLoadBalancerIngress::default()
                }
            }
        })
        .collect()
}

/// Writes the status updates of each pass to the API server.
pub async fn run_status_updater(
    client: KubeClientCell,
    mut updates: mpsc::UnboundedReceiver<Vec<IngressStatusUpdate>>,
) {
    while let Some(batch) = updates.recv().await {
        for update in batch {
            let api = Api::<Ingress>::namespaced(client.clone().into(), &update.namespace);
            let patch = json!({
                "status": {
                    "loadBalancer": {
                        "ingress": load_balancer_ingress(&update.addresses)
                    }
                }
            });
            match api
                .patch_status(&update.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => debug!(
                    "Status of ingress '{}/{}' set to {:?}",
                    update.namespace, update.name, update.addresses
                ),
                Err(err) => error!(
                    "Unable to update status of ingress '{}/{}': {err}",
                    update.namespace, update.name
                ),
            }
        }
    }
    info!("Status updater stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Ingress as StoredIngress, IngressClass, NamespaceEvent, StoreParams};

    fn store() -> K8s {
        let mut store = K8s::new(StoreParams::builder().ingress_class("haproxy").build());
        store.event_namespace(NamespaceEvent {
            name: "default".to_string(),
            status: Status::Added,
            ..NamespaceEvent::default()
        });
        store.event_ingress_class(IngressClass {
            name: "haproxy".to_string(),
            controller: "haproxy.org/ingress-controller/haproxy".to_string(),
            status: Status::Added,
            ..IngressClass::default()
        });
        store.publish_service_addresses = vec!["192.0.2.10".to_string(), "lb.example.com".to_string()];
        store
    }

    fn ingress(name: &str, class: &str) -> StoredIngress {
        StoredIngress {
            namespace: "default".to_string(),
            name: name.to_string(),
            class: class.to_string(),
            status: Status::Added,
            ..StoredIngress::default()
        }
    }

    #[test]
    fn test_supported_ingress_gets_addresses() {
        let mut store = store();
        store.event_ingress(ingress("web", "haproxy"));

        let updates = pending_updates(&mut store);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "web");
        assert_eq!(updates[0].addresses, store.publish_service_addresses);

        store.clean();
        assert!(pending_updates(&mut store).is_empty());
    }

    #[test]
    fn test_unsupported_ingress_cleared_only_when_ours() {
        let mut store = store();
        let mut ours = ingress("ours", "nginx");
        ours.addresses = vec!["lb.example.com".to_string(), "192.0.2.10".to_string()];
        store.event_ingress(ours);
        let mut theirs = ingress("theirs", "nginx");
        theirs.addresses = vec!["198.51.100.1".to_string()];
        store.event_ingress(theirs);

        let updates = pending_updates(&mut store);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "ours");
        assert!(updates[0].addresses.is_empty());
    }

    #[test]
    fn test_publish_change_updates_all() {
        let mut store = store();
        store.event_ingress(ingress("web", "haproxy"));
        pending_updates(&mut store);
        store.clean();

        let service = crate::store::Service {
            addresses: vec!["192.0.2.20".to_string()],
            status: Status::Modified,
            ..crate::store::Service::default()
        };
        assert!(store.event_publish_service(service));
        let updates = pending_updates(&mut store);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].addresses, vec!["192.0.2.20".to_string()]);
        assert!(!store.update_all_ingresses);
    }

    #[test]
    fn test_load_balancer_ingress() {
        let entries = load_balancer_ingress(&["192.0.2.1".to_string(), "2001:db8::1".to_string(), "lb.example.com".to_string()]);
        assert_eq!(entries[0].ip.as_deref(), Some("192.0.2.1"));
        assert_eq!(entries[1].ip.as_deref(), Some("2001:db8::1"));
        assert_eq!(entries[2].hostname.as_deref(), Some("lb.example.com"));
        assert!(entries[2].ip.is_none());
    }
}
