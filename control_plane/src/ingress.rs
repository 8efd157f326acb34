//! Translation of one ingress: default backend, TLS secrets, frontend
//! rules from its annotations, then a backend and a route per path.

use crate::annotations::{Context, FrontendRules, Settings, Values, frontend_rules};
use crate::route::{CustomRoutes, Route, add_host_path_route};
use crate::service::{ServiceBackend, set_default_backend};
use crate::store::{Ingress, IngressPath, K8s, Status};
use haproxy_ingress_api::constants::INGRESS_CLASS_ANNOTATION;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::certs::{SecretRef, SecretType};
use haproxy_ingress_dataplane::env::{FRONT_HTTP, FRONT_HTTPS, FRONT_SSL};
use haproxy_ingress_dataplane::rules::Rule;
use std::collections::BTreeSet;
use std::sync::Once;
use tracing::{debug, error, info, trace, warn};

const KUBERNETES_INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

static INGRESS_CLASS_DEPRECATION: Once = Once::new();

/// True when the ingress belongs to this controller. The legacy class
/// annotation takes precedence over `ingressClassName`.
pub fn is_supported(store: &K8s, ingress: &Ingress) -> bool {
    let annotation = Values::new([&ingress.annotations])
        .explicit(INGRESS_CLASS_ANNOTATION)
        .or_else(|| {
            ingress
                .annotations
                .get(KUBERNETES_INGRESS_CLASS_ANNOTATION)
                .map(String::as_str)
                .filter(|value| !value.is_empty())
        });
    let Some(annotation) = annotation else {
        return store.is_ingress_class_supported(&ingress.class);
    };
    INGRESS_CLASS_DEPRECATION.call_once(|| {
        warn!("the 'ingress.class' annotation is deprecated, use 'spec.ingressClassName' instead");
    });
    if annotation == store.ingress_class {
        return true;
    }
    if store.is_ingress_class_supported(&ingress.class) && !ingress.class.is_empty() {
        warn!(
            "ingress '{}/{}': conflicting ingress class mechanisms",
            ingress.namespace, ingress.name
        );
    }
    false
}

/// Registers compiled rules on the frontends their type calls for and
/// writes the map files and stick tables they use. `ingress` scopes the
/// rules to the routes of one ingress. Returns the ids of the rules.
pub fn add_rules(haproxy: &mut HAProxy, compiled: FrontendRules, ingress: bool) -> Vec<String> {
    let FrontendRules { rules, maps, tables } = compiled;
    for (name, addresses) in maps {
        for address in addresses {
            haproxy.maps_mut().append(&name, address);
        }
    }
    for table in tables {
        let name = table.name.clone();
        if let Err(err) = haproxy
            .backend_create_or_update(table)
            .and_then(|_| haproxy.set_permanent_backend(&name))
        {
            error!("stick table '{name}': {err}");
        }
    }

    let mut ids = Vec::with_capacity(rules.len());
    let mut seen = BTreeSet::new();
    for rule in rules {
        let frontends: &[&str] = match &rule {
            Rule::Redirect(redirect) if redirect.ssl_redirect => &[FRONT_HTTP],
            Rule::Deny(_) | Rule::Capture(_) if haproxy.ssl_passthrough() => &[FRONT_HTTP, FRONT_SSL],
            _ => &[FRONT_HTTP, FRONT_HTTPS],
        };
        let scoped = ingress || matches!(rule, Rule::Redirect(_));
        for frontend in frontends {
            let id = haproxy.add_rule(frontend, rule.clone(), scoped);
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Rules compiled from the main config map apply to all traffic.
pub fn handle_config_map_annotations(store: &K8s, haproxy: &mut HAProxy, settings: &Settings) {
    let cm = &store.config_maps.main;
    let values = Values::new([&cm.annotations]);
    let ctx = Context::new(store, &cm.namespace, None, settings);
    trace!("processing ingress annotations of the main config map");
    let compiled = frontend_rules(&values, &ctx, "ConfigMap");
    add_rules(haproxy, compiled, false);
}

/// Programs one supported ingress.
pub async fn update(
    store: &mut K8s,
    haproxy: &mut HAProxy,
    routes: &mut CustomRoutes,
    settings: &Settings,
    ingress: &Ingress,
) {
    let owner = format!("ingress '{}/{}'", ingress.namespace, ingress.name);

    if let Some(path) = &ingress.default_backend {
        match set_default_backend(
            store,
            haproxy,
            path,
            Some(ingress),
            settings,
            &[FRONT_HTTP, FRONT_HTTPS],
        )
        .await
        {
            Ok(backend) => info!("{owner}: default backend set to '{backend}'"),
            Err(err) => error!("{owner}: default backend: {err}"),
        }
    }

    trace!("{owner}: processing secrets");
    for tls in ingress.tls.values() {
        if tls.secret_name.is_empty() {
            continue;
        }
        let secret = match store.get_secret(&ingress.namespace, &tls.secret_name) {
            Ok(secret) => secret,
            Err(err) => {
                warn!("{owner}: {err}");
                continue;
            }
        };
        let key = format!("{}/{}", secret.namespace, secret.name);
        let result = haproxy
            .add_secret(
                SecretRef {
                    namespace: &secret.namespace,
                    name: &secret.name,
                    data: &secret.data,
                    changed: secret.status != Status::Empty,
                },
                SecretType::Frontend,
            )
            .await;
        match result {
            Ok(_) => {
                store.secrets_processed.insert(key);
            }
            Err(err) => error!("{owner}: {err}"),
        }
    }

    if ingress.rules.is_empty() {
        debug!("{owner}: no rules defined");
        return;
    }

    let values = Values::new([&ingress.annotations, &store.config_maps.main.annotations]);
    let ssl_passthrough = match values.bool("ssl-passthrough") {
        Ok(enabled) => enabled.unwrap_or_default(),
        Err(err) => {
            error!("{owner}: ssl-passthrough: {err}");
            false
        }
    };
    if ssl_passthrough {
        haproxy.set_ssl_passthrough(true);
    }
    let path_regex = matches!(values.bool("path-regex"), Ok(Some(true)));

    trace!("{owner}: processing annotations");
    let compiled = {
        let ctx = Context::new(store, &ingress.namespace, Some(ingress), settings);
        frontend_rules(&values, &ctx, &owner)
    };
    let rule_ids = add_rules(haproxy, compiled, true);

    trace!("{owner}: processing rules");
    for rule in ingress.rules.values() {
        for path in rule.paths.values() {
            let target = PathTarget {
                ingress,
                host: &rule.host,
                path,
                rule_ids: &rule_ids,
                ssl_passthrough,
                path_regex,
            };
            if let Err(err) = target.handle(store, haproxy, routes, settings).await {
                error!("{owner}: {err}");
            }
        }
    }
}

struct PathTarget<'a> {
    ingress: &'a Ingress,
    host: &'a str,
    path: &'a IngressPath,
    rule_ids: &'a [String],
    ssl_passthrough: bool,
    path_regex: bool,
}

impl PathTarget<'_> {
    async fn handle(
        &self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        routes: &mut CustomRoutes,
        settings: &Settings,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let service = ServiceBackend::new(
            store,
            self.path,
            Some(self.ingress),
            settings,
            self.ssl_passthrough,
        )?;
        service.handle_backend(store, haproxy).await?;

        let route = Route {
            host: self.host,
            path: self.path,
            backend: service.name(),
            rule_ids: self.rule_ids,
            ssl_passthrough: self.ssl_passthrough,
            path_regex: self.path_regex,
        };
        match service.route_acl() {
            Some(acl) => routes.add(&route, acl, haproxy.config_mut()?)?,
            None => add_host_path_route(&route, haproxy.maps_mut())?,
        }

        service.handle_servers(store, haproxy)?;
        Ok(())
    }
}
