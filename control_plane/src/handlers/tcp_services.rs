use super::{BindAddresses, ClientAuth, Handler, HandlerError, client_auth};
use crate::annotations::Settings;
use crate::service::set_default_backend;
use crate::store::{IngressPath, K8s};
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::models::{Frontend, Mode};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, PartialEq, Eq)]
enum EntryError {
    #[error("incorrect port '{0}'")]
    Port(String),
    #[error("incorrect format '{0}', 'ServiceNamespace/ServiceName:ServicePort' is required")]
    Format(String),
}

/// One entry of the TCP services config map: `<ns>/<svc>:<port>[:ssl]`
/// keyed by the listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TcpServiceEntry {
    listen: u16,
    namespace: String,
    service: String,
    port: String,
    ssl: bool,
}

impl TcpServiceEntry {
    fn parse(key: &str, value: &str) -> Result<Self, EntryError> {
        let listen = key
            .trim()
            .parse::<u16>()
            .map_err(|_| EntryError::Port(key.to_string()))?;
        let format = || EntryError::Format(value.to_string());
        let mut parts = value.trim().split(':');
        let (namespace, service) = parts
            .next()
            .and_then(|name| name.split_once('/'))
            .filter(|(ns, name)| !ns.is_empty() && !name.is_empty() && !name.contains('/'))
            .ok_or_else(format)?;
        let port = parts.next().filter(|port| !port.is_empty()).ok_or_else(format)?;
        let ssl = parts.next() == Some("ssl");
        Ok(Self {
            listen,
            namespace: namespace.to_string(),
            service: service.to_string(),
            port: port.to_string(),
            ssl,
        })
    }

    fn frontend_name(&self) -> String {
        format!("tcp-{}", self.listen)
    }

    fn path(&self) -> IngressPath {
        let (svc_port_int, svc_port_string) = match self.port.parse::<u16>() {
            Ok(port) => (Some(port), String::new()),
            Err(_) => (None, self.port.clone()),
        };
        IngressPath {
            svc_namespace: self.namespace.clone(),
            svc_name: self.service.clone(),
            svc_port_int,
            svc_port_string,
            is_default_backend: true,
            ..IngressPath::default()
        }
    }
}

/// Exposes services on dedicated TCP ports listed in the TCP services
/// config map. Frontends created here are tracked so entries that disappear
/// take their frontend with them.
#[derive(Debug, Default)]
pub struct TcpServices {
    addresses: BindAddresses,
    frontends: BTreeSet<String>,
}

impl TcpServices {
    pub fn new(addresses: BindAddresses) -> Self {
        Self {
            addresses,
            frontends: BTreeSet::new(),
        }
    }

    fn frontend(&self, entry: &TcpServiceEntry, cert_dir: &str, auth: Option<&ClientAuth>) -> Frontend {
        let mut binds = self.addresses.binds(entry.listen);
        if entry.ssl {
            for bind in &mut binds {
                bind.ssl = true;
                bind.ssl_certificate = Some(cert_dir.to_string());
                ClientAuth::apply(auth, bind);
            }
        }
        Frontend {
            tcplog: true,
            binds,
            ..Frontend::new(entry.frontend_name(), Mode::Tcp)
        }
    }
}

#[async_trait]
impl Handler for TcpServices {
    fn name(&self) -> &'static str {
        "tcp services"
    }

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        settings: &Settings,
    ) -> Result<(), HandlerError> {
        let cm = &store.config_maps.tcp_services;
        let entries = if cm.loaded {
            cm.annotations
                .iter()
                .filter_map(|(key, value)| match TcpServiceEntry::parse(key, value) {
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        error!("tcp-services: {err}");
                        None
                    }
                })
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        let auth = if entries.iter().any(|entry| entry.ssl) {
            client_auth(store, haproxy).await?
        } else {
            None
        };
        let cert_dir = haproxy.env().certs.frontend.display().to_string();

        let mut seen = BTreeSet::new();
        for entry in &entries {
            let name = entry.frontend_name();
            if let Err(err) = store.get_service(&entry.namespace, &entry.service) {
                error!("tcp-services: {err}");
                continue;
            }
            let desired = self.frontend(entry, &cert_dir, auth.as_ref());
            let config = haproxy.config_mut()?;
            let created = !config.frontends.contains_key(&name);
            let frontend = config
                .frontends
                .entry(name.clone())
                .or_insert_with(|| desired.clone());
            let before = frontend.clone();
            frontend.mode = Mode::Tcp;
            frontend.tcplog = true;
            frontend.binds = desired.binds;
            if created {
                debug!("TCP frontend '{name}' created, reload required");
                haproxy.instance_mut().reload(format!("TCP frontend '{name}' created"));
            } else if *frontend != before {
                debug!("TCP frontend '{name}' updated, reload required");
                haproxy.instance_mut().reload(format!("TCP frontend '{name}' updated"));
            }
            seen.insert(name.clone());

            if let Err(err) =
                set_default_backend(store, haproxy, &entry.path(), None, settings, &[&name]).await
            {
                error!("tcp-services: frontend '{name}': {err}");
            }
        }

        let stale = self.frontends.difference(&seen).cloned().collect::<Vec<_>>();
        for name in stale {
            if haproxy.config_mut()?.frontends.remove(&name).is_some() {
                haproxy.rules_mut().delete_frontend(&name);
                debug!("TCP frontend '{name}' deleted, reload required");
                haproxy.instance_mut().reload(format!("TCP frontend '{name}' deleted"));
            }
        }
        self.frontends = seen;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::tests::annotations;
    use crate::testing::{haproxy, web_store};
    use assertables::{assert_err, assert_ok};
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case("2222", "default/web:80", "default", "web", "80", false)]
    #[case("2222", "default/web:http:ssl", "default", "web", "http", true)]
    #[case(" 2222", " ns/db:5432:plain", "ns", "db", "5432", false)]
    fn test_parse_entry(
        #[case] key: &str,
        #[case] value: &str,
        #[case] namespace: &str,
        #[case] service: &str,
        #[case] port: &str,
        #[case] ssl: bool,
    ) {
        let entry = assert_ok!(TcpServiceEntry::parse(key, value));
        assert_eq!(entry.listen, 2222);
        assert_eq!(entry.namespace, namespace);
        assert_eq!(entry.service, service);
        assert_eq!(entry.port, port);
        assert_eq!(entry.ssl, ssl);
    }

    #[rstest]
    #[case("http", "default/web:80")]
    #[case("70000", "default/web:80")]
    #[case("2222", "web:80")]
    #[case("2222", "default/web")]
    #[case("2222", "/web:80")]
    fn test_parse_invalid_entry(#[case] key: &str, #[case] value: &str) {
        assert_err!(TcpServiceEntry::parse(key, value));
    }

    #[test]
    fn test_entry_path() {
        let entry = assert_ok!(TcpServiceEntry::parse("2222", "default/web:http"));
        let path = entry.path();
        assert!(path.is_default_backend);
        assert_eq!(path.svc_port_int, None);
        assert_eq!(path.svc_port_string, "http");
        assert_eq!(entry.frontend_name(), "tcp-2222");
    }

    #[tokio::test]
    async fn test_tcp_service_lifecycle() {
        let dir = assert_ok!(tempdir());
        let (mut haproxy, _) = haproxy(&dir);
        let mut store = web_store();
        let settings = Settings::default();
        let mut handler = TcpServices::new(BindAddresses::builder().ipv4("0.0.0.0").build());

        store.config_maps.tcp_services.loaded = true;
        store.config_maps.tcp_services.annotations =
            annotations(&[("2222", "default/web:80"), ("3333", "default/missing:80")]);
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        {
            let config = assert_ok!(haproxy.config());
            let frontend = assert_ok!(config.frontend("tcp-2222"));
            assert_eq!(frontend.mode, Mode::Tcp);
            assert!(frontend.tcplog);
            assert_eq!(frontend.binds[0].port, Some(2222));
            assert!(!frontend.ssl_offload_enabled());
            assert_eq!(frontend.default_backend.as_deref(), Some("default_web_http"));
            let backend = assert_ok!(config.backend("default_web_http"));
            assert_eq!(backend.mode, Mode::Tcp);
            assert!(!config.frontends.contains_key("tcp-3333"));
        }
        assert!(haproxy.instance().need_reload());

        store.config_maps.tcp_services.annotations =
            annotations(&[("2222", "default/web:80:ssl")]);
        haproxy.instance_mut().reset();
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        let frontend = assert_ok!(assert_ok!(haproxy.config()).frontend("tcp-2222")).clone();
        assert!(frontend.ssl_offload_enabled());
        assert!(haproxy.instance().need_reload());

        store.config_maps.tcp_services.loaded = false;
        assert_ok!(handler.update(&mut store, &mut haproxy, &settings).await);
        assert!(!assert_ok!(haproxy.config()).frontends.contains_key("tcp-2222"));
    }
}
