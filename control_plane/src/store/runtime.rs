//! Server slot bookkeeping of runtime backends.
//!
//! Slots are named `SRV_<n>` and never removed, so a changed endpoint only
//! moves addresses between slots and can be applied through the runtime
//! socket.

use super::types::{HAProxySrv, RuntimeBackend};
use haproxy_ingress_dataplane::runtime::{RuntimeServerData, ServerState};
use tracing::trace;

/// Address of a disabled slot in the configuration file.
pub const DISABLED_ADDRESS: &str = "127.0.0.1";

impl RuntimeBackend {
    /// Aligns slots with the current endpoints. Addresses still present keep
    /// their slot, vanished ones free it, and new ones take free slots in
    /// order. Addresses left without a slot are kept in `pending` until the
    /// backend is scaled. Returns the runtime updates of modified slots.
    pub fn sync_servers(&mut self, port_updated: bool) -> Vec<RuntimeServerData> {
        let mut addresses = self.endpoints.addresses.clone();
        if self.name.is_empty() {
            self.pending = addresses;
            return Vec::new();
        }

        let mut free = Vec::new();
        for (index, server) in self.servers.iter_mut().enumerate() {
            server.modified |= port_updated;
            if addresses.remove(&server.address) {
                continue;
            }
            if !server.address.is_empty() {
                server.address.clear();
                server.modified = true;
            }
            free.push(index);
        }

        let mut free = free.into_iter();
        while let Some(address) = addresses.first().cloned() {
            let Some(index) = free.next() else {
                break;
            };
            addresses.remove(&address);
            let server = &mut self.servers[index];
            trace!(backend = %self.name, server = %server.name, %address, "slot assigned");
            server.address = address;
            server.modified = true;
        }
        self.pending = addresses;

        let port = self.endpoints.port;
        for server in &mut self.servers {
            server.port = port;
        }
        self.runtime_updates()
    }

    /// Grows the slot pool so every pending address gets a slot. The pool is
    /// a multiple of `slots`, with at least one more batch of free slots
    /// whenever it has to grow. Returns true when slots were added.
    pub fn scale(&mut self, slots: usize) -> bool {
        let slots = slots.max(1);
        let existing = self.servers.len();
        let pending = self.pending.len();
        let expected = existing + pending;
        let mut target = if expected == 0 || expected % slots != 0 {
            expected - expected % slots + slots
        } else {
            expected
        };
        let enabled = self
            .servers
            .iter()
            .filter(|server| !server.address.is_empty())
            .count();
        if enabled + pending > existing && target - (enabled + pending) < slots && target > slots
        {
            target += slots;
        }

        let port = self.endpoints.port;
        let mut pending = std::mem::take(&mut self.pending).into_iter();
        for index in existing..target {
            self.servers.push(HAProxySrv {
                name: format!("SRV_{}", index + 1),
                address: pending.next().unwrap_or_default(),
                port,
                modified: true,
            });
        }
        self.servers.len() > existing
    }

    /// Runtime commands matching the modified slots.
    pub fn runtime_updates(&self) -> Vec<RuntimeServerData> {
        self.servers
            .iter()
            .filter(|server| server.modified)
            .map(|server| server_data(&self.name, server))
            .collect()
    }
}

fn server_data(backend: &str, server: &HAProxySrv) -> RuntimeServerData {
    if server.address.is_empty() {
        RuntimeServerData {
            backend_name: backend.to_string(),
            server_name: server.name.clone(),
            address: DISABLED_ADDRESS.to_string(),
            port: None,
            state: ServerState::Maint,
        }
    } else {
        RuntimeServerData {
            backend_name: backend.to_string(),
            server_name: server.name.clone(),
            address: server.address.clone(),
            port: Some(server.port),
            state: ServerState::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::PortEndpoints;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn backend(addresses: &[&str]) -> RuntimeBackend {
        RuntimeBackend {
            name: "default_web_http".to_string(),
            endpoints: PortEndpoints {
                port: 8080,
                addresses: addresses.iter().map(ToString::to_string).collect(),
            },
            ..RuntimeBackend::default()
        }
    }

    fn set_addresses(backend: &mut RuntimeBackend, addresses: &[&str]) {
        backend.endpoints.addresses = addresses.iter().map(ToString::to_string).collect();
        for server in &mut backend.servers {
            server.modified = false;
        }
    }

    #[test]
    fn test_unnamed_backend_keeps_everything_pending() {
        let mut backend = RuntimeBackend {
            name: String::new(),
            ..backend(&["10.0.0.1", "10.0.0.2"])
        };
        assert!(backend.sync_servers(false).is_empty());
        assert_eq!(backend.pending.len(), 2);
    }

    #[test]
    fn test_first_scale_fills_one_batch() {
        let mut backend = backend(&["10.0.0.1"]);
        backend.pending = backend.endpoints.addresses.clone();
        assert!(backend.scale(42));
        assert_eq!(backend.servers.len(), 42);
        assert_eq!(backend.servers[0].address, "10.0.0.1");
        assert_eq!(backend.servers[41].name, "SRV_42");
        assert!(backend.servers[1].address.is_empty());
        assert!(backend.pending.is_empty());
    }

    #[test]
    fn test_endpoint_change_within_pool_needs_no_scale() {
        let mut backend = backend(&["10.0.0.1"]);
        backend.pending = backend.endpoints.addresses.clone();
        backend.scale(4);
        set_addresses(&mut backend, &["10.0.0.1", "10.0.0.2"]);

        let updates = backend.sync_servers(false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].server_name, "SRV_2");
        assert_eq!(updates[0].address, "10.0.0.2");
        assert_eq!(updates[0].port, Some(8080));
        assert_eq!(updates[0].state, ServerState::Ready);
        assert!(!backend.scale(4));
    }

    #[test]
    fn test_removed_address_disables_slot() {
        let mut backend = backend(&["10.0.0.1", "10.0.0.2"]);
        backend.pending = backend.endpoints.addresses.clone();
        backend.scale(4);
        set_addresses(&mut backend, &["10.0.0.2"]);

        let updates = backend.sync_servers(false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].server_name, "SRV_1");
        assert_eq!(updates[0].address, DISABLED_ADDRESS);
        assert_eq!(updates[0].state, ServerState::Maint);
        assert_eq!(backend.servers[1].address, "10.0.0.2");
    }

    #[test]
    fn test_port_change_updates_every_slot() {
        let mut backend = backend(&["10.0.0.1"]);
        backend.pending = backend.endpoints.addresses.clone();
        backend.scale(2);
        set_addresses(&mut backend, &["10.0.0.1"]);
        backend.endpoints.port = 9090;
        let updates = backend.sync_servers(true);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].port, Some(9090));
    }

    #[rstest]
    #[case(1, 2, 2)]
    #[case(2, 2, 2)]
    #[case(3, 2, 6)]
    #[case(5, 4, 12)]
    fn test_growth_keeps_free_batch(
        #[case] endpoints: usize,
        #[case] slots: usize,
        #[case] expected: usize,
    ) {
        let addresses = (1..=endpoints)
            .map(|i| format!("10.0.0.{i}"))
            .collect::<Vec<_>>();
        let refs = addresses.iter().map(String::as_str).collect::<Vec<_>>();
        let mut backend = backend(&refs);
        backend.pending = backend.endpoints.addresses.clone();
        assert!(backend.scale(slots));
        assert_eq!(backend.servers.len(), expected);
    }

    proptest! {
        #[test]
        fn test_slots_are_contiguous_and_hold_every_endpoint(
            first in proptest::collection::btree_set(1u8..=250, 0..20),
            second in proptest::collection::btree_set(1u8..=250, 0..60),
            slots in 1usize..10,
        ) {
            let mut backend = backend(&[]);
            for addresses in [first, second] {
                let addresses = addresses
                    .into_iter()
                    .map(|i| format!("10.0.1.{i}"))
                    .collect::<BTreeSet<_>>();
                backend.endpoints.addresses = addresses.clone();
                backend.sync_servers(false);
                backend.scale(slots);

                let assigned = backend
                    .servers
                    .iter()
                    .filter(|s| !s.address.is_empty())
                    .map(|s| s.address.clone())
                    .collect::<BTreeSet<_>>();
                prop_assert_eq!(assigned, addresses);
                for (index, server) in backend.servers.iter().enumerate() {
                    prop_assert_eq!(&server.name, &format!("SRV_{}", index + 1));
                }
                prop_assert_eq!(backend.servers.len() % slots, 0);
            }
        }
    }
}
