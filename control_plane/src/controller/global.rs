//! First step of a pass: sections and settings fed by the main config map
//! and the custom resources it references.

use super::ControllerParams;
use crate::annotations::{
    Context, DEFAULTS_PROCESSORS, GLOBAL_PROCESSORS, GlobalSection, Settings, Values,
    apply_frontend_cr, defaults_from_cr, global_from_cr, lines, parse_k8s_path, process,
};
use crate::ingress::handle_config_map_annotations;
use crate::service::set_default_backend;
use crate::store::{
    CrItem, DEFAULT_LOCAL_SERVICE, IngressPath, K8s, Namespace, NamespacedName, Status,
};
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::certs::{SecretRef, SecretType};
use haproxy_ingress_dataplane::configuration::TransactionError;
use haproxy_ingress_dataplane::env::{FRONT_HTTP, FRONT_HTTPS, set_defaults, set_global};
use haproxy_ingress_dataplane::models::{Defaults, Frontend};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

const OWNER: &str = "ConfigMap";

/// The custom resource referenced by annotation `name` of the main config
/// map, if it exists.
fn custom_resource<'a, T>(
    store: &'a K8s,
    name: &str,
    select: impl Fn(&'a Namespace) -> &'a BTreeMap<String, CrItem<T>>,
) -> Option<&'a T> {
    let cm = &store.config_maps.main;
    let value = Values::new([&cm.annotations]).explicit(name)?;
    let reference = match parse_k8s_path(value, &cm.namespace) {
        Ok(reference) => reference,
        Err(err) => {
            warn!("annotation '{name}': {err}");
            return None;
        }
    };
    let item = store
        .namespace(&reference.namespace)
        .ok()
        .and_then(|ns| select(ns).get(&reference.name))
        .filter(|item| item.status != Status::Deleted);
    if item.is_none() {
        warn!("annotation '{name}': custom resource '{reference}' not found");
    }
    item.map(|item| &item.spec)
}

fn global_section(store: &K8s, haproxy: &HAProxy, settings: &Settings) -> GlobalSection {
    let cm = &store.config_maps.main;
    let values = Values::new([&cm.annotations]);
    let ctx = Context::new(store, &cm.namespace, None, settings);
    let mut section = match custom_resource(store, "cr-global", |ns| &ns.crs.global) {
        Some(spec) => {
            let mut section = global_from_cr(spec);
            let snippet = GLOBAL_PROCESSORS
                .iter()
                .filter(|processor| processor.name() == "global-config-snippet");
            for processor in snippet {
                if let Err(err) = processor.apply(&mut section, &values, &ctx) {
                    warn!("{OWNER}: annotation '{}': {err}", processor.name());
                }
            }
            section
        }
        None => {
            let mut section = GlobalSection::default();
            process(&GLOBAL_PROCESSORS, &mut section, &values, &ctx, OWNER);
            section
        }
    };
    set_global(&mut section.global, &mut section.log_targets, haproxy.env());
    section
}

fn defaults_section(store: &K8s, settings: &Settings) -> Defaults {
    let cm = &store.config_maps.main;
    let mut defaults = match custom_resource(store, "cr-defaults", |ns| &ns.crs.defaults) {
        Some(spec) => defaults_from_cr(spec),
        None => {
            let values = Values::new([&cm.annotations]);
            let ctx = Context::new(store, &cm.namespace, None, settings);
            let mut defaults = Defaults::default();
            process(&DEFAULTS_PROCESSORS, &mut defaults, &values, &ctx, OWNER);
            defaults
        }
    };
    set_defaults(&mut defaults);
    defaults
}

/// Global and defaults sections. A global change restarts HAProxy, a
/// defaults change reloads it.
fn handle_sections(
    store: &K8s,
    haproxy: &mut HAProxy,
    settings: &Settings,
) -> Result<(), TransactionError> {
    let GlobalSection {
        global,
        log_targets,
        snippet,
    } = global_section(store, haproxy, settings);
    let defaults = defaults_section(store, settings);

    let config = haproxy.config_mut()?;
    let mut restarts = Vec::new();
    if config.global != global {
        config.global = global;
        restarts.push("global section updated");
    }
    if config.log_targets != log_targets {
        config.log_targets = log_targets;
        restarts.push("log targets updated");
    }
    if config.global_snippet != snippet {
        config.global_snippet = snippet;
        restarts.push("global config snippet updated");
    }
    let defaults_changed = config.defaults != defaults;
    if defaults_changed {
        config.defaults = defaults;
    }

    let instance = haproxy.instance_mut();
    for reason in restarts {
        instance.restart(reason);
    }
    instance.reload_if(defaults_changed, "defaults section updated");
    Ok(())
}

fn main_reference(store: &K8s, name: &str) -> Option<NamespacedName> {
    let cm = &store.config_maps.main;
    let value = Values::new([&cm.annotations]).explicit(name)?;
    parse_k8s_path(value, &cm.namespace)
        .inspect_err(|err| warn!("annotation '{name}': {err}"))
        .ok()
}

async fn handle_default_certificate(store: &K8s, haproxy: &mut HAProxy, params: &ControllerParams) {
    let Some(reference) = main_reference(store, "ssl-certificate")
        .or_else(|| params.default_ssl_certificate.clone())
    else {
        return;
    };
    let secret = match store.get_secret(&reference.namespace, &reference.name) {
        Ok(secret) => secret,
        Err(err) => {
            warn!("default certificate: {err}");
            return;
        }
    };
    let result = haproxy
        .add_secret(
            SecretRef {
                namespace: &secret.namespace,
                name: &secret.name,
                data: &secret.data,
                changed: secret.status != Status::Empty,
            },
            SecretType::FrontendDefault,
        )
        .await;
    if let Err(err) = result {
        error!("default certificate '{reference}': {err}");
    }
}

/// Default backend of the `http` and `https` frontends: the service named
/// by `default-backend-service`, else the controller's own 404 service.
/// With `assign` false the backend is kept but an ingress default backend
/// owns the frontends.
async fn handle_default_backend(
    store: &mut K8s,
    haproxy: &mut HAProxy,
    settings: &Settings,
    params: &ControllerParams,
    assign: bool,
) {
    let reference = main_reference(store, "default-backend-service")
        .or_else(|| params.default_backend_service.clone());
    let local = reference.is_none();
    let path = match reference {
        Some(NamespacedName { namespace, name }) => IngressPath {
            svc_namespace: namespace,
            svc_name: name,
            is_default_backend: true,
            ..IngressPath::default()
        },
        None => IngressPath {
            svc_namespace: params.pod_namespace.clone(),
            svc_name: DEFAULT_LOCAL_SERVICE.to_string(),
            svc_port_string: "http".to_string(),
            is_default_backend: true,
            ..IngressPath::default()
        },
    };
    let frontends: &[&str] = if assign { &[FRONT_HTTP, FRONT_HTTPS] } else { &[] };
    match set_default_backend(store, haproxy, &path, None, settings, frontends).await {
        Ok(backend) => {
            debug!("default backend: '{backend}'");
            if local {
                if let Err(err) = haproxy.set_permanent_backend(&backend) {
                    error!("default backend '{backend}': {err}");
                }
            }
        }
        Err(err) => error!("default backend: {err}"),
    }
}

/// Settings of the `http` and `https` frontends owned by `cr-frontend-*`
/// and `frontend-config-snippet`. Binds, rules and the default backend are
/// set by other steps.
fn handle_frontends(
    store: &K8s,
    haproxy: &mut HAProxy,
    settings: &Settings,
) -> Result<(), TransactionError> {
    let values = Values::new([&store.config_maps.main.annotations]);
    let snippet = match values.explicit("frontend-config-snippet") {
        Some(_) if settings.disabled_snippets.frontend => {
            warn!("{OWNER}: annotation 'frontend-config-snippet': config snippets are disabled");
            Vec::new()
        }
        Some(value) => lines(value).map(str::to_string).collect(),
        None => Vec::new(),
    };
    let frontend_crs = [
        (FRONT_HTTP, custom_resource(store, "cr-frontend-http", |ns| &ns.crs.frontends)),
        (FRONT_HTTPS, custom_resource(store, "cr-frontend-https", |ns| &ns.crs.frontends)),
    ];

    let config = haproxy.config_mut()?;
    let mut updated = Vec::new();
    for (name, cr) in frontend_crs {
        let frontend = config.frontend_mut(name)?;
        let mut desired = Frontend {
            maxconn: None,
            log_format: None,
            client_timeout: None,
            tcplog: false,
            dontlognull: false,
            config_snippets: snippet.clone(),
            ..frontend.clone()
        };
        if let Some(spec) = cr {
            apply_frontend_cr(&mut desired, &spec.config);
        }
        if *frontend != desired {
            *frontend = desired;
            updated.push(name);
        }
    }
    for name in updated {
        haproxy
            .instance_mut()
            .reload(format!("frontend '{name}' settings updated"));
    }
    Ok(())
}

/// Runs the global part of a pass. Only transaction errors abort it.
pub(super) async fn handle_global_config(
    store: &mut K8s,
    haproxy: &mut HAProxy,
    settings: &Settings,
    params: &ControllerParams,
    assign_default_backend: bool,
) -> Result<(), TransactionError> {
    handle_sections(store, haproxy, settings)?;
    handle_default_certificate(store, haproxy, params).await;
    handle_default_backend(store, haproxy, settings, params, assign_default_backend).await;
    handle_config_map_annotations(store, haproxy, settings);
    handle_frontends(store, haproxy, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::tests::annotations;
    use crate::default_service::local_service;
    use crate::testing::haproxy;
    use crate::store::StoreParams;
    use assertables::{assert_contains, assert_ok};
    use chrono::DateTime;
    use haproxy_ingress_api::v3::{FrontendConfig, FrontendSpec};
    use tempfile::tempdir;

    fn params() -> ControllerParams {
        ControllerParams::builder().pod_namespace("haproxy-controller").build()
    }

    fn store(pairs: &[(&str, &str)]) -> K8s {
        let mut store = K8s::new(StoreParams::default());
        store.config_maps.main.namespace = "haproxy-controller".to_string();
        store.config_maps.main.annotations = annotations(pairs);
        store.config_maps.main.loaded = true;
        let (service, endpoints) = local_service("haproxy-controller", 6061);
        store.event_service(service);
        store.event_endpoints(endpoints);
        store
    }

    #[tokio::test]
    async fn test_global_change_restarts() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let settings = Settings::default();
        let mut store = store(&[("maxconn", "1111")]);

        assert_ok!(handle_global_config(&mut store, &mut haproxy, &settings, &params(), true).await);
        assert!(haproxy.instance().need_restart());
        assert_eq!(assert_ok!(haproxy.config()).global.maxconn, Some(1111));
        assert!(assert_ok!(haproxy.config()).global.master_worker);

        haproxy.instance_mut().reset();
        assert_ok!(handle_global_config(&mut store, &mut haproxy, &settings, &params(), true).await);
        assert!(!haproxy.instance().need_restart());
        assert!(!haproxy.instance().need_reload());
    }

    #[tokio::test]
    async fn test_defaults_change_reloads() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store(&[("timeout-client", "10s")]);

        assert_ok!(
            handle_global_config(&mut store, &mut haproxy, &Settings::default(), &params(), true)
                .await
        );
        let config = assert_ok!(haproxy.config());
        assert_eq!(config.defaults.timeouts.client, Some(10_000));
        assert_eq!(config.defaults.timeouts.connect, Some(5000));
        assert!(haproxy.instance().need_reload());
    }

    #[tokio::test]
    async fn test_local_default_backend() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store(&[]);

        assert_ok!(
            handle_global_config(&mut store, &mut haproxy, &Settings::default(), &params(), true)
                .await
        );
        let config = assert_ok!(haproxy.config());
        let backend = "haproxy-controller_default-local-service_http";
        assert!(config.backends.contains_key(backend));
        assert!(config.permanent_backends.contains(backend));
        for name in [FRONT_HTTP, FRONT_HTTPS] {
            assert_eq!(
                assert_ok!(config.frontend(name)).default_backend.as_deref(),
                Some(backend)
            );
        }
    }

    #[tokio::test]
    async fn test_default_backend_left_to_ingress() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store(&[]);

        assert_ok!(
            handle_global_config(&mut store, &mut haproxy, &Settings::default(), &params(), false)
                .await
        );
        let config = assert_ok!(haproxy.config());
        assert!(config.backends.contains_key("haproxy-controller_default-local-service_http"));
        assert_eq!(assert_ok!(config.frontend(FRONT_HTTP)).default_backend, None);
    }

    #[tokio::test]
    async fn test_frontend_snippet_and_resource() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = store(&[
            ("frontend-config-snippet", "http-request set-header X-Edge 1"),
            ("cr-frontend-https", "tuned"),
        ]);
        store.event_frontend_cr(CrItem {
            namespace: "haproxy-controller".to_string(),
            name: "tuned".to_string(),
            created: DateTime::from_timestamp(1, 0).unwrap_or_default(),
            spec: FrontendSpec {
                config: FrontendConfig {
                    maxconn: Some(500),
                    ..FrontendConfig::default()
                },
            },
            status: Status::Added,
        });

        let settings = Settings::default();
        assert_ok!(handle_global_config(&mut store, &mut haproxy, &settings, &params(), true).await);
        {
            let config = assert_ok!(haproxy.config());
            let http = assert_ok!(config.frontend(FRONT_HTTP));
            assert_eq!(http.config_snippets, vec!["http-request set-header X-Edge 1"]);
            assert_eq!(http.maxconn, None);
            let https = assert_ok!(config.frontend(FRONT_HTTPS));
            assert_eq!(https.maxconn, Some(500));
            assert_contains!(config.render(), "http-request set-header X-Edge 1");
        }
        assert!(haproxy.instance().need_reload());

        let disabled = Settings {
            disabled_snippets: "frontend".parse().unwrap_or_default(),
            ..Settings::default()
        };
        assert_ok!(handle_global_config(&mut store, &mut haproxy, &disabled, &params(), true).await);
        let config = assert_ok!(haproxy.config());
        assert!(assert_ok!(config.frontend(FRONT_HTTP)).config_snippets.is_empty());
    }
}
