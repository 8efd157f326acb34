//! Frontends described by `TCP` custom resources.
//!
//! Each model of a resource becomes the frontend `tcpcr_<ns>_<name>` with
//! the model service as default backend. Models that collide with an older
//! one are skipped. Frontends with the prefix that no model claims anymore
//! are deleted.

use super::{Handler, HandlerError};
use crate::annotations::{Settings, frontend_from_cr};
use crate::service::{ServiceBackend, ServiceError, set_default_backend};
use crate::store::frontend_name;
use crate::store::{IngressPath, K8s, Status};
use async_trait::async_trait;
use haproxy_ingress_api::v3::{TcpModel, TcpService};
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::certs::{SecretRef, SecretType};
use haproxy_ingress_dataplane::models::{Frontend, Mode};
use std::collections::BTreeSet;
use std::sync::Once;
use tracing::{debug, error, warn};

pub const TCP_CR_PREFIX: &str = "tcpcr";

static INGRESS_CLASS_WARNING: Once = Once::new();

#[derive(Debug, Default)]
pub struct TcpCustomResources;

/// A model to configure, detached from the store.
struct Model {
    namespace: String,
    owner: String,
    model: TcpModel,
}

fn cfg_frontend_name(namespace: &str, model: &TcpModel) -> String {
    format!("{TCP_CR_PREFIX}_{namespace}_{}", frontend_name(model))
}

fn service_path(namespace: &str, service: &TcpService, default: bool) -> IngressPath {
    IngressPath {
        svc_namespace: namespace.to_string(),
        svc_name: service.name.clone(),
        svc_port_int: Some(service.port),
        is_default_backend: default,
        ..IngressPath::default()
    }
}

/// The part of a frontend a resource describes. Rules and the default
/// backend are set by other steps.
fn owned(frontend: &Frontend) -> Frontend {
    Frontend {
        default_backend: None,
        tcp_request_rules: Vec::new(),
        http_request_rules: Vec::new(),
        http_response_rules: Vec::new(),
        http_after_response_rules: Vec::new(),
        backend_switching_rules: Vec::new(),
        ..frontend.clone()
    }
}

/// Copies the resource-owned settings of `desired` into `frontend`.
/// Returns true on change.
fn merge_frontend(frontend: &mut Frontend, desired: Frontend) -> bool {
    if owned(frontend) == desired {
        return false;
    }
    *frontend = Frontend {
        default_backend: frontend.default_backend.take(),
        tcp_request_rules: std::mem::take(&mut frontend.tcp_request_rules),
        http_request_rules: std::mem::take(&mut frontend.http_request_rules),
        http_response_rules: std::mem::take(&mut frontend.http_response_rules),
        http_after_response_rules: std::mem::take(&mut frontend.http_after_response_rules),
        backend_switching_rules: std::mem::take(&mut frontend.backend_switching_rules),
        ..desired
    };
    true
}

impl TcpCustomResources {
    fn models(store: &K8s) -> Vec<Model> {
        let mut models = Vec::new();
        for ns in store.namespaces.values().filter(|ns| ns.relevant) {
            for cr in ns.crs.tcps.values() {
                if cr.status == Status::Deleted {
                    continue;
                }
                INGRESS_CLASS_WARNING.call_once(|| {
                    warn!("TCP resources are processed regardless of the ingress class");
                });
                for item in &cr.items {
                    let owner = format!("{}/{}/{}", cr.namespace, cr.name, item.model.name);
                    if let Some(reason) = &item.collision {
                        error!("tcp-cr: skipping tcp '{owner}' due to collision: {reason}");
                        continue;
                    }
                    models.push(Model {
                        namespace: cr.namespace.clone(),
                        owner,
                        model: item.model.clone(),
                    });
                }
            }
        }
        models
    }

    /// Resolves bind certificates naming a secret of the resource namespace
    /// to a TCP certificate file. Other values are kept as file paths.
    async fn bind_certificates(
        store: &K8s,
        haproxy: &mut HAProxy,
        namespace: &str,
        frontend: &mut Frontend,
    ) -> Result<(), HandlerError> {
        for bind in frontend.binds.iter_mut().filter(|bind| bind.ssl) {
            let Some(name) = bind.ssl_certificate.as_deref() else {
                continue;
            };
            let Ok(secret) = store.get_secret(namespace, name) else {
                continue;
            };
            let path = haproxy
                .add_secret(
                    SecretRef {
                        namespace: &secret.namespace,
                        name: &secret.name,
                        data: &secret.data,
                        changed: secret.status != Status::Empty,
                    },
                    SecretType::Tcp,
                )
                .await?;
            bind.ssl_certificate = Some(path.display().to_string());
        }
        Ok(())
    }

    async fn reconcile(
        store: &mut K8s,
        haproxy: &mut HAProxy,
        settings: &Settings,
        item: &Model,
    ) -> Result<(), HandlerError> {
        let Model {
            namespace, model, ..
        } = item;
        store
            .get_service(namespace, &model.service.name)
            .map_err(ServiceError::from)?;

        let name = cfg_frontend_name(namespace, model);
        let mut desired = frontend_from_cr(&name, Mode::Tcp, &model.frontend);
        Self::bind_certificates(store, haproxy, namespace, &mut desired).await?;

        let config = haproxy.config_mut()?;
        match config.frontends.get_mut(&name) {
            Some(frontend) => {
                if merge_frontend(frontend, desired) {
                    haproxy
                        .instance_mut()
                        .reload(format!("TCP frontend '{name}' updated"));
                }
            }
            None => {
                config.frontends.insert(name.clone(), desired);
                haproxy
                    .instance_mut()
                    .reload(format!("TCP frontend '{name}' created"));
            }
        }

        let path = service_path(namespace, &model.service, true);
        set_default_backend(store, haproxy, &path, None, settings, &[&name]).await?;

        for service in &model.services {
            let path = service_path(namespace, service, false);
            let backend = ServiceBackend::new(store, &path, None, settings, true)?;
            backend.handle_backend(store, haproxy).await?;
            backend.handle_servers(store, haproxy)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for TcpCustomResources {
    fn name(&self) -> &'static str {
        "tcp custom resources"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        settings: &Settings,
    ) -> Result<(), HandlerError> {
        let mut required = BTreeSet::new();
        for item in Self::models(store) {
            let name = cfg_frontend_name(&item.namespace, &item.model);
            // A failing model keeps its frontend as it was.
            required.insert(name);
            if let Err(err) = Self::reconcile(store, haproxy, settings, &item).await {
                error!("tcp-cr: {}: {err}", item.owner);
            }
        }

        let prefix = format!("{TCP_CR_PREFIX}_");
        let config = haproxy.config_mut()?;
        let stale = config
            .frontends
            .values()
            .filter(|frontend| frontend.mode == Mode::Tcp && frontend.name.starts_with(&prefix))
            .filter(|frontend| !required.contains(&frontend.name))
            .map(|frontend| frontend.name.clone())
            .collect::<Vec<_>>();
        for name in &stale {
            config.frontends.remove(name);
        }
        for name in stale {
            haproxy.rules_mut().delete_frontend(&name);
            debug!("TCP frontend '{name}' deleted, reload required");
            haproxy
                .instance_mut()
                .reload(format!("TCP frontend '{name}' deleted"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TcpCr, TcpItem};
    use crate::testing::{endpoints, haproxy, service, tls_secret, web_store};
    use assertables::{assert_contains, assert_ok};
    use chrono::DateTime;
    use haproxy_ingress_api::v3::{Bind, FrontendConfig};
    use tempfile::tempdir;

    fn model(name: &str, port: u16, ssl_certificate: Option<&str>) -> TcpModel {
        TcpModel {
            name: name.to_string(),
            frontend: FrontendConfig {
                name: Some(name.to_string()),
                log_format: Some("%ci:%cp".to_string()),
                binds: vec![Bind {
                    name: "v4".to_string(),
                    address: Some("0.0.0.0".to_string()),
                    port: Some(port),
                    ssl: ssl_certificate.is_some(),
                    ssl_certificate: ssl_certificate.map(str::to_string),
                    ..Bind::default()
                }],
                ..FrontendConfig::default()
            },
            service: TcpService {
                name: "web".to_string(),
                port: 80,
            },
            services: vec![TcpService {
                name: "metrics".to_string(),
                port: 9100,
            }],
        }
    }

    fn tcp_cr(name: &str, seconds: i64, models: Vec<TcpModel>) -> TcpCr {
        TcpCr {
            namespace: "default".to_string(),
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
        }
    }

    fn store() -> K8s {
        let mut store = web_store();
        store.event_service(service("default", "metrics", &[("metrics", 9100)]));
        store.event_endpoints(endpoints("default", "metrics", &[("metrics", 9100)], &["10.0.0.3"]));
        store.event_secret(tls_secret("default", "tcp-cert"));
        store
    }

    #[test]
    fn test_frontend_names() {
        let model = model("fe", 2000, None);
        assert_eq!(cfg_frontend_name("default", &model), "tcpcr_default_fe");
    }

    #[test]
    fn test_merge_keeps_rules_and_default_backend() {
        let mut frontend = frontend_from_cr("tcpcr_default_fe", Mode::Tcp, &model("fe", 2000, None).frontend);
        frontend.default_backend = Some("default_web_http".to_string());
        let desired = frontend_from_cr("tcpcr_default_fe", Mode::Tcp, &model("fe", 2000, None).frontend);
        assert!(!merge_frontend(&mut frontend, desired));

        let desired = frontend_from_cr("tcpcr_default_fe", Mode::Tcp, &model("fe", 3000, None).frontend);
        assert!(merge_frontend(&mut frontend, desired));
        assert_eq!(frontend.binds[0].port, Some(3000));
        assert_eq!(frontend.default_backend.as_deref(), Some("default_web_http"));
    }

    #[tokio::test]
    async fn test_tcp_resources_lifecycle() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store();
        let settings = Settings::default();
        store.event_tcp_cr(tcp_cr("first", 1, vec![model("fe", 2000, Some("tcp-cert"))]));
        store.event_tcp_cr(tcp_cr("second", 2, vec![model("fe", 2001, None)]));

        let mut handler = TcpCustomResources;
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        {
            let config = assert_ok!(haproxy.config());
            let frontend = assert_ok!(config.frontend("tcpcr_default_fe"));
            assert_eq!(frontend.mode, Mode::Tcp);
            assert_eq!(frontend.log_format.as_deref(), Some("'%ci:%cp'"));
            assert_eq!(frontend.binds.len(), 1);
            assert_eq!(frontend.binds[0].port, Some(2000));
            assert_contains!(
                frontend.binds[0].ssl_certificate.clone().unwrap_or_default(),
                "certs/tcp/default_tcp-cert.pem"
            );
            assert_eq!(frontend.default_backend.as_deref(), Some("default_web_http"));
            assert_eq!(assert_ok!(config.backend("default_web_http")).mode, Mode::Tcp);
            assert!(config.backends.contains_key("default_metrics_metrics"));
        }
        assert!(haproxy.instance().need_reload());

        store.event_tcp_cr(TcpCr {
            status: Status::Deleted,
            ..tcp_cr("first", 1, Vec::new())
        });
        store.event_tcp_cr(TcpCr {
            status: Status::Deleted,
            ..tcp_cr("second", 2, Vec::new())
        });
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        assert!(!assert_ok!(haproxy.config()).frontends.contains_key("tcpcr_default_fe"));
    }
}
