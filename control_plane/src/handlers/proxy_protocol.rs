use super::{Handler, HandlerError};
use crate::annotations::{Settings, Values, parse_addresses};
use crate::store::K8s;
use async_trait::async_trait;
use haproxy_ingress_core::utils::content_hash;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::env::{FRONT_HTTP, FRONT_HTTPS, FRONT_SSL};
use haproxy_ingress_dataplane::rules::ReqProxyProtocol;
use tracing::{error, trace};

/// Expects the PROXY protocol from the sources listed in the `proxy-protocol`
/// key of the main config map.
#[derive(Debug, Default)]
pub struct ProxyProtocol;

#[async_trait]
impl Handler for ProxyProtocol {
    fn name(&self) -> &'static str {
        "proxy protocol"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        let values = Values::new([&store.config_maps.main.annotations]);
        let Some(value) = values.explicit("proxy-protocol") else {
            return Ok(());
        };

        let map_name = format!("proxy-protocol-{}", content_hash(value));
        if !haproxy.maps().exists(&map_name) {
            for address in value.split(',') {
                match parse_addresses(address) {
                    Ok(addresses) => {
                        for address in addresses {
                            haproxy.maps_mut().append(&map_name, address);
                        }
                    }
                    Err(_) => error!(
                        "incorrect address '{}' in proxy-protocol annotation",
                        address.trim()
                    ),
                }
            }
        }

        trace!("Configuring proxy protocol");
        let src_ips_map = haproxy.maps().path(&map_name).display().to_string();
        let frontends = if haproxy.ssl_passthrough() {
            [FRONT_HTTP, FRONT_SSL]
        } else {
            [FRONT_HTTP, FRONT_HTTPS]
        };
        for frontend in frontends {
            haproxy.add_rule(
                frontend,
                ReqProxyProtocol {
                    src_ips_map: src_ips_map.clone(),
                },
                false,
            );
        }
        Ok(())
    }
}
