//! Collision resolution between TCP resources of every namespace.
//!
//! Two TCP models collide when they bind the same `address:port` or use the
//! same frontend name. Models are ranked by creation time, then namespace,
//! resource name and model name; a model is kept unless it collides with a
//! model ranked before it that was kept.

use super::K8s;
use super::types::Status;
use chrono::{DateTime, Utc};
use haproxy_ingress_api::v3::{Bind, TcpModel};
use std::collections::BTreeMap;
use tracing::warn;

/// `address:port` of a bind, with the defaults HAProxy would apply.
pub fn address_port(bind: &Bind) -> String {
    format!(
        "{}:{}",
        bind.address.as_deref().unwrap_or_default(),
        bind.port.unwrap_or_default()
    )
}

/// Frontend name of a TCP model, which defaults to the model name.
pub fn frontend_name(model: &TcpModel) -> &str {
    model
        .frontend
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or(&model.name)
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Rank {
    created: DateTime<Utc>,
    namespace: String,
    parent: String,
    name: String,
    index: usize,
}

impl Rank {
    fn owner(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.parent, self.name)
    }
}

impl K8s {
    /// Recomputes the collision marker of every live TCP model.
    pub(super) fn update_tcp_collisions(&mut self) {
        let mut ranked = Vec::new();
        for ns in self.namespaces.values() {
            for cr in ns.crs.tcps.values().filter(|cr| cr.status != Status::Deleted) {
                for (index, item) in cr.items.iter().enumerate() {
                    ranked.push((
                        Rank {
                            created: cr.created,
                            namespace: cr.namespace.clone(),
                            parent: cr.name.clone(),
                            name: item.model.name.clone(),
                            index,
                        },
                        item.model.clone(),
                    ));
                }
            }
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0));

        let mut binds: BTreeMap<String, String> = BTreeMap::new();
        let mut frontends: BTreeMap<String, String> = BTreeMap::new();
        let mut verdicts = Vec::with_capacity(ranked.len());
        for (rank, model) in ranked {
            let owner = rank.owner();
            let frontend = frontend_name(&model).to_string();
            let mut reasons = Vec::new();
            if let Some(winner) = frontends.get(&frontend) {
                reasons.push(format!("frontend name '{frontend}' already used by {winner}"));
            }
            let addresses = model
                .frontend
                .binds
                .iter()
                .map(address_port)
                .collect::<Vec<_>>();
            for address in &addresses {
                if let Some(winner) = binds.get(address) {
                    reasons.push(format!("bind '{address}' already used by {winner}"));
                }
            }

            if reasons.is_empty() {
                frontends.insert(frontend, owner.clone());
                for address in addresses {
                    binds.insert(address, owner.clone());
                }
                verdicts.push((rank, None));
            } else {
                let reason = reasons.join(", ");
                warn!("TCP resource {owner} ignored: {reason}");
                verdicts.push((rank, Some(reason)));
            }
        }

        for (rank, collision) in verdicts {
            let item = self
                .namespaces
                .get_mut(&rank.namespace)
                .and_then(|ns| ns.crs.tcps.get_mut(&rank.parent))
                .and_then(|cr| cr.items.get_mut(rank.index));
            if let Some(item) = item {
                item.collision = collision;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreParams, TcpCr, TcpItem};
    use haproxy_ingress_api::v3::{FrontendConfig, TcpService};
    use proptest::prelude::*;

    fn model(name: &str, frontend: &str, port: u16) -> TcpModel {
        TcpModel {
            name: name.to_string(),
            frontend: FrontendConfig {
                name: Some(frontend.to_string()),
                binds: vec![Bind {
                    name: "v4".to_string(),
                    port: Some(port),
                    ..Bind::default()
                }],
                ..FrontendConfig::default()
            },
            service: TcpService {
                name: "echo".to_string(),
                port: 443,
            },
            services: Vec::new(),
        }
    }

    fn insert(store: &mut K8s, ns: &str, name: &str, seconds: i64, models: Vec<TcpModel>) {
        let cr = TcpCr {
            namespace: ns.to_string(),
            name: name.to_string(),
            created: DateTime::from_timestamp(seconds, 0).unwrap_or_default(),
            items: models
                .into_iter()
                .map(|model| TcpItem {
                    model,
                    collision: None,
                })
                .collect(),
            status: Status::Added,
        };
        store
            .namespace_mut(ns)
            .crs
            .tcps
            .insert(name.to_string(), cr);
    }

    fn collision(store: &K8s, ns: &str, name: &str, index: usize) -> Option<String> {
        store.namespaces[ns].crs.tcps[name].items[index]
            .collision
            .clone()
    }

    #[test]
    fn test_address_port_defaults() {
        let bind = Bind {
            name: "v4".to_string(),
            ..Bind::default()
        };
        assert_eq!(address_port(&bind), ":0");
        let bind = Bind {
            address: Some("127.0.0.1".to_string()),
            port: Some(32766),
            ..bind
        };
        assert_eq!(address_port(&bind), "127.0.0.1:32766");
    }

    #[test]
    fn test_oldest_wins_on_bind() {
        let mut store = K8s::new(StoreParams::default());
        insert(&mut store, "b", "newer", 20, vec![model("fe", "fe-b", 32766)]);
        insert(&mut store, "a", "older", 10, vec![model("fe", "fe-a", 32766)]);
        store.update_tcp_collisions();
        assert_eq!(collision(&store, "a", "older", 0), None);
        let reason = collision(&store, "b", "newer", 0).unwrap_or_default();
        assert!(reason.contains(":32766"));
        assert!(reason.contains("a/older/fe"));
    }

    #[test]
    fn test_frontend_name_collision_inside_one_resource() {
        let mut store = K8s::new(StoreParams::default());
        insert(
            &mut store,
            "a",
            "tcp",
            10,
            vec![model("first", "fe", 1000), model("second", "fe", 2000)],
        );
        store.update_tcp_collisions();
        assert_eq!(collision(&store, "a", "tcp", 0), None);
        assert!(collision(&store, "a", "tcp", 1).is_some());
    }

    #[test]
    fn test_equal_timestamps_use_names() {
        let mut store = K8s::new(StoreParams::default());
        insert(&mut store, "b", "tcp", 10, vec![model("fe", "fe-b", 32766)]);
        insert(&mut store, "a", "tcp", 10, vec![model("fe", "fe-a", 32766)]);
        store.update_tcp_collisions();
        assert_eq!(collision(&store, "a", "tcp", 0), None);
        assert!(collision(&store, "b", "tcp", 0).is_some());
    }

    proptest! {
        #[test]
        fn test_single_winner_per_bind(times in proptest::collection::vec(0i64..5, 1..8)) {
            let mut store = K8s::new(StoreParams::default());
            for (index, seconds) in times.iter().enumerate() {
                insert(
                    &mut store,
                    &format!("ns{index}"),
                    "tcp",
                    *seconds,
                    vec![model("fe", &format!("fe-{index}"), 32766)],
                );
            }
            store.update_tcp_collisions();

            let winners = (0..times.len())
                .filter(|index| collision(&store, &format!("ns{index}"), "tcp", 0).is_none())
                .collect::<Vec<_>>();
            prop_assert_eq!(winners.len(), 1);
            let oldest = times.iter().copied().min().unwrap_or_default();
            prop_assert_eq!(times[winners[0]], oldest);
        }
    }
}
