//! Steps of a reconcile pass that run after the ingresses, each owning one
//! area of the configuration.

mod errorfiles;
mod files;
mod https;
mod pattern_files;
mod proxy_protocol;
mod refresh;
mod tcp_cr;
mod tcp_services;

pub use errorfiles::{ERROR_CODES, ErrorFiles};
pub use https::Https;
pub use pattern_files::PatternFiles;
pub use proxy_protocol::ProxyProtocol;
pub use refresh::Refresh;
pub use tcp_cr::{TCP_CR_PREFIX, TcpCustomResources};
pub use tcp_services::TcpServices;

use crate::annotations::{Settings, Values, parse_k8s_path};
use crate::service::ServiceError;
use crate::store::{K8s, Status};
use async_trait::async_trait;
use haproxy_ingress_dataplane::HAProxy;
use haproxy_ingress_dataplane::certs::{CertificateError, SecretRef, SecretType};
use haproxy_ingress_dataplane::configuration::TransactionError;
use haproxy_ingress_dataplane::models::Bind;
use thiserror::Error;
use tracing::warn;
use typed_builder::TypedBuilder;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

#[async_trait]
pub trait Handler: Send {
    fn name(&self) -> &'static str;

    async fn update(
        &mut self,
        store: &mut K8s,
        haproxy: &mut HAProxy,
        settings: &Settings,
    ) -> Result<(), HandlerError>;
}

/// Listen addresses of the public binds. A `None` address disables the
/// family.
#[derive(Debug, Clone, Default, PartialEq, Eq, TypedBuilder)]
pub struct BindAddresses {
    #[builder(default, setter(strip_option, into))]
    ipv4: Option<String>,
    #[builder(default, setter(strip_option, into))]
    ipv6: Option<String>,
}

impl BindAddresses {
    pub fn new(ipv4: Option<String>, ipv6: Option<String>) -> Self {
        Self { ipv4, ipv6 }
    }

    /// `v4` and `v6` binds on `port`.
    pub fn binds(&self, port: u16) -> Vec<Bind> {
        let mut binds = Vec::with_capacity(2);
        if let Some(address) = &self.ipv4 {
            binds.push(Bind::new("v4", address.as_str(), Some(port)));
        }
        if let Some(address) = &self.ipv6 {
            binds.push(Bind {
                v4v6: true,
                ..Bind::new("v6", address.as_str(), Some(port))
            });
        }
        binds
    }

    /// Loopback binds accepting the PROXY protocol, used behind the SSL
    /// pass-through frontend.
    pub fn loopback(&self, port: u16) -> Vec<Bind> {
        let mut binds = Vec::with_capacity(2);
        if self.ipv4.is_some() {
            binds.push(Bind {
                accept_proxy: true,
                ..Bind::new("v4", "127.0.0.1", Some(port))
            });
        }
        if self.ipv6.is_some() {
            binds.push(Bind {
                accept_proxy: true,
                v4v6: true,
                ..Bind::new("v6", "::1", Some(port))
            });
        }
        binds
    }
}

/// Client certificate verification of an SSL frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientAuth {
    pub ca_file: String,
    pub verify: &'static str,
}

impl ClientAuth {
    pub fn apply(auth: Option<&Self>, bind: &mut Bind) {
        bind.ssl_cafile = auth.map(|auth| auth.ca_file.clone());
        bind.verify = auth.map(|auth| auth.verify.to_string());
    }
}

/// Reads `client-ca` and `client-crt-optional` from the main config map and
/// writes the CA secret. A missing secret disables the verification.
pub(crate) async fn client_auth(
    store: &K8s,
    haproxy: &mut HAProxy,
) -> Result<Option<ClientAuth>, HandlerError> {
    let cm = &store.config_maps.main;
    let values = Values::new([&cm.annotations]);
    let Some(reference) = values.explicit("client-ca") else {
        return Ok(None);
    };
    let reference = match parse_k8s_path(reference, &cm.namespace) {
        Ok(reference) => reference,
        Err(err) => {
            warn!("client TLS auth: {err}");
            return Ok(None);
        }
    };
    let secret = match store.get_secret(&reference.namespace, &reference.name) {
        Ok(secret) => secret,
        Err(err) => {
            warn!("client TLS auth: {err}");
            return Ok(None);
        }
    };
    let ca_file = haproxy
        .add_secret(
            SecretRef {
                namespace: &secret.namespace,
                name: &secret.name,
                data: &secret.data,
                changed: secret.status != Status::Empty,
            },
            SecretType::Ca,
        )
        .await?;
    let verify = match values.bool("client-crt-optional") {
        Ok(Some(true)) => "optional",
        Ok(_) => "required",
        Err(err) => {
            warn!("client TLS auth: client-crt-optional: {err}");
            "required"
        }
    };
    Ok(Some(ClientAuth {
        ca_file: ca_file.display().to_string(),
        verify,
    }))
}
