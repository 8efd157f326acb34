use super::{Handler, HandlerError};
use crate::annotations::{Settings, Values};
use crate::store::K8s;
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use tracing::{debug, error};

/// Runs last: writes maps, rewrites rules and drops unused backends and,
/// unless `clean-certs` is off, unused certificates.
#[derive(Debug, Default)]
pub struct Refresh;

#[async_trait]
impl Handler for Refresh {
    fn name(&self) -> &'static str {
        "refresh"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        let clean_certs = match Values::new([&store.config_maps.main.annotations]).bool("clean-certs") {
            Ok(clean) => clean.unwrap_or(true),
            Err(err) => {
                error!("clean-certs: {err}");
                true
            }
        };
        let deleted = haproxy.refresh(clean_certs).await?;
        if !deleted.is_empty() {
            debug!("deleted backends: {}", deleted.join(", "));
        }
        Ok(())
    }
}
