//! The `https` frontend and the SSL pass-through chain in front of it.
//!
//! Without pass-through, `https` listens on the public addresses. With it,
//! the TCP frontend `ssl` takes over the public port, routes SNI matches to
//! pass-through backends and sends the rest to `https` over loopback with
//! the PROXY protocol.

use super::{BindAddresses, ClientAuth, Handler, HandlerError, client_auth};
use crate::annotations::{Settings, Values};
use crate::store::K8s;
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::env::{BACK_SSL, FRONT_HTTPS, FRONT_SSL};
use haproxy_ingress_dataplane::maps::MAP_SNI;
use haproxy_ingress_dataplane::models::{
    Backend, BackendSwitchingRule, Bind, Frontend, Mode, Server,
};
use haproxy_ingress_dataplane::rules::{ReqInspectDelay, ReqSetVar, Rule};
use tracing::{debug, error};
use typed_builder::TypedBuilder;

const SSL_LOG_FORMAT: &str = "'%ci:%cp [%t] %ft %b/%s %Tw/%Tc/%Tt %B %ts %ac/%fc/%bc/%sc/%rc %sq/%bq %hr %hs SNI: %[var(sess.sni)]'";
const DEFAULT_INSPECT_DELAY: u64 = 5000;

#[derive(Debug, Clone, TypedBuilder)]
pub struct Https {
    #[builder(default = true)]
    enabled: bool,
    #[builder(default = 8443)]
    port: u16,
    #[builder(default)]
    addresses: BindAddresses,
}

#[async_trait]
impl Handler for Https {
    fn name(&self) -> &'static str {
        "https"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        _settings: &Settings,
    ) -> Result<(), HandlerError> {
        if !self.enabled {
            debug!("Cannot proceed with SSL Passthrough update, HTTPS is disabled");
            return Ok(());
        }
        let values = Values::new([&store.config_maps.main.annotations]);
        let passthrough = haproxy.ssl_passthrough();

        let mut binds = if passthrough {
            self.addresses.loopback(self.port)
        } else {
            self.addresses.binds(self.port)
        };
        if haproxy.certs().front_certs_in_use() {
            let alpn = values
                .get("tls-alpn")
                .filter(|alpn| !alpn.is_empty())
                .map(str::to_string);
            let strict_sni = values.bool("client-strict-sni").unwrap_or_else(|err| {
                error!("client-strict-sni: {err}");
                None
            });
            let auth = client_auth(store, haproxy).await?;
            let cert_dir = haproxy.env().certs.frontend.display().to_string();
            for bind in &mut binds {
                bind.ssl = true;
                bind.ssl_certificate = Some(cert_dir.clone());
                bind.alpn.clone_from(&alpn);
                bind.strict_sni = strict_sni.unwrap_or(false);
                ClientAuth::apply(auth.as_ref(), bind);
            }
        }
        self.set_https_binds(haproxy, binds)?;

        if passthrough {
            self.enable_passthrough(haproxy)?;
            passthrough_rules(haproxy, &values);
        } else if haproxy.config_mut()?.frontends.remove(FRONT_SSL).is_some() {
            haproxy.rules_mut().delete_frontend(FRONT_SSL);
            debug!("SSLPassthrough disabled, reload required");
            haproxy.instance_mut().reload("SSL passthrough disabled");
        }

        if haproxy.certs().certs_created() {
            haproxy.instance_mut().reload("new certificates");
        }
        Ok(())
    }
}

impl Https {
    fn set_https_binds(&self, haproxy: &mut HAProxy, binds: Vec<Bind>) -> Result<(), HandlerError> {
        let https = haproxy.config_mut()?.frontend_mut(FRONT_HTTPS)?;
        if https.binds == binds {
            return Ok(());
        }
        let offload = binds.iter().any(|bind| bind.ssl);
        let reason = match (https.ssl_offload_enabled(), offload) {
            (false, true) => "SSL offload enabled",
            (true, false) => "SSL offload disabled",
            _ => "https binds updated",
        };
        https.binds = binds;
        debug!("{reason}, reload required");
        haproxy.instance_mut().reload(reason);
        Ok(())
    }

    fn enable_passthrough(&self, haproxy: &mut HAProxy) -> Result<(), HandlerError> {
        let config = haproxy.config_mut()?;
        let frontend = config
            .frontends
            .entry(FRONT_SSL.to_string())
            .or_insert_with(|| Frontend::new(FRONT_SSL, Mode::Tcp));
        let before = frontend.clone();
        frontend.mode = Mode::Tcp;
        frontend.log_format = Some(SSL_LOG_FORMAT.to_string());
        frontend.default_backend = Some(BACK_SSL.to_string());
        frontend.binds = self.addresses.binds(self.port);
        frontend.backend_switching_rules = vec![BackendSwitchingRule {
            backend: "%[var(txn.sni_match),field(1,.)]".to_string(),
            cond: String::new(),
        }];
        if *frontend != before {
            debug!("SSLPassthrough enabled, reload required");
            haproxy.instance_mut().reload("SSL passthrough enabled");
        }

        let mut backend = Backend::new(BACK_SSL, Mode::Tcp);
        backend.servers.push(Server {
            send_proxy_v2: true,
            ..Server::new(FRONT_HTTPS, "127.0.0.1", Some(self.port))
        });
        haproxy.backend_create_or_update(backend)?;
        Ok(())
    }
}

/// SNI inspection rules of the `ssl` frontend.
fn passthrough_rules(haproxy: &mut HAProxy, values: &Values<'_>) {
    let timeout = match values.duration("timeout-client") {
        Ok(Some(timeout)) => timeout,
        Ok(None) => DEFAULT_INSPECT_DELAY,
        Err(err) => {
            error!("SSL Passthrough: {err}");
            DEFAULT_INSPECT_DELAY
        }
    };
    let sni_map = haproxy.maps().path(MAP_SNI).display().to_string();
    let rules = [
        Rule::AcceptContent,
        Rule::from(ReqInspectDelay { timeout }),
        Rule::from(ReqSetVar {
            name: "sni".to_string(),
            scope: "sess".to_string(),
            expression: "req_ssl_sni".to_string(),
            cond_test: None,
        }),
        Rule::from(ReqSetVar {
            name: "sni_match".to_string(),
            scope: "txn".to_string(),
            expression: format!("req_ssl_sni,map({sni_map})"),
            cond_test: None,
        }),
        Rule::from(ReqSetVar {
            name: "sni_match".to_string(),
            scope: "txn".to_string(),
            expression: format!("req_ssl_sni,regsub(^[^.]*,,),map({sni_map})"),
            cond_test: Some("!{ var(txn.sni_match) -m found }".to_string()),
        }),
    ];
    for rule in rules {
        haproxy.add_rule(FRONT_SSL, rule, false);
    }
}
