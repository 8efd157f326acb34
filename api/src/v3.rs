//! Custom resources of group `ingress.v3.haproxy.org`.
//!
//! Field names follow the HAProxy data plane JSON model (snake case), which is
//! what existing manifests for these resources are written against.

use derive_builder::Builder;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

#[derive(
    Default, Deserialize, Serialize, Copy, Clone, Debug, JsonSchema, PartialEq, Eq, IntoStaticStr,
    Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProxyMode {
    #[default]
    Http,
    Tcp,
}

#[derive(
    Deserialize, Serialize, Copy, Clone, Debug, JsonSchema, PartialEq, Eq, IntoStaticStr, Display,
    EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HttpConnectionMode {
    HttpKeepAlive,
    HttpServerClose,
    Httpclose,
}

#[derive(Default, Builder, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[builder(default, setter(into))]
pub struct LogTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minlevel: Option<String>,
    #[serde(default)]
    pub global: bool,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct GlobalConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbthread: Option<u32>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_stop_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_default_bind_ciphers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_default_bind_ciphersuites: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_default_bind_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_default_server_ciphers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tune_ssl_default_dh_param: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_timeout: Option<u64>,
}

#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "Global",
    group = "ingress.v3.haproxy.org",
    version = "v3",
    namespaced,
    singular = "global",
    plural = "globals"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct GlobalSpec {
    #[serde(default)]
    pub config: GlobalConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_targets: Vec<LogTarget>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct DefaultsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProxyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dontlognull: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logasap: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_connection_mode: Option<HttpConnectionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwardfor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_fin_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_keep_alive_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_fin_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_timeout: Option<u64>,
}

#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "Defaults",
    group = "ingress.v3.haproxy.org",
    version = "v3",
    namespaced,
    singular = "defaults",
    plural = "defaults"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct DefaultsSpec {
    #[serde(flatten)]
    pub config: DefaultsConfig,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct Balance {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_param: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct BackendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProxyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<Balance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abortonclose: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwardfor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_check_uri: Option<String>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct Acl {
    pub acl_name: String,
    pub criterion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "Backend",
    group = "ingress.v3.haproxy.org",
    version = "v3",
    namespaced,
    singular = "backend",
    plural = "backends"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct BackendSpec {
    #[serde(default)]
    pub config: BackendConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acls: Vec<Acl>,
    #[serde(default, rename = "http-requests", skip_serializing_if = "Vec::is_empty")]
    pub http_requests: Vec<String>,
}

#[derive(Default, Builder, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[builder(default, setter(into))]
pub struct Bind {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub v4v6: bool,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_certificate: Option<String>,
    #[serde(default)]
    pub accept_proxy: bool,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct FrontendConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ProxyMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxconn: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcplog: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dontlognull: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<Bind>,
}

#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "Frontend",
    group = "ingress.v3.haproxy.org",
    version = "v3",
    namespaced,
    singular = "frontend",
    plural = "frontends"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct FrontendSpec {
    #[serde(flatten)]
    pub config: FrontendConfig,
}

#[derive(Default, Builder, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[builder(setter(into))]
pub struct TcpService {
    pub name: String,
    #[schemars(range(min = 1, max = 65535))]
    pub port: u16,
}

#[derive(Default, Builder, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[builder(setter(into))]
pub struct TcpModel {
    pub name: String,
    pub frontend: FrontendConfig,
    /// Default service (`default_backend`).
    pub service: TcpService,
    /// Additional services that only get a backend.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[builder(default)]
    pub services: Vec<TcpService>,
}

/// The spec is a plain list of TCP models.
#[derive(CustomResource, Default, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    kind = "TCP",
    group = "ingress.v3.haproxy.org",
    version = "v3",
    namespaced,
    singular = "tcp",
    plural = "tcps"
)]
#[kube(derive = "Default")]
#[kube(derive = "PartialEq")]
pub struct TCPSpec(pub Vec<TcpModel>);

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::assert_ok;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn test_tcp_spec_from_yaml() {
        let yaml = r#"
- name: fe-http-echo-443
  frontend:
    name: fe-http-echo-443
    tcplog: true
    log_format: "%{+Q}o %t %s"
    binds:
      - name: v4
        port: 32766
        ssl: true
        ssl_certificate: tcp-test-cert
  service:
    name: http-echo
    port: 443
  services:
    - name: http-echo-2
      port: 8443
"#;
        let spec: TCPSpec = assert_ok!(serde_yaml::from_str(yaml));
        assert_eq!(spec.0.len(), 1);
        let model = &spec.0[0];
        assert_eq!(model.frontend.binds[0].port, Some(32766));
        assert_eq!(
            model.frontend.binds[0].ssl_certificate.as_deref(),
            Some("tcp-test-cert")
        );
        assert_eq!(model.service.port, 443);
        assert_eq!(model.services[0].name, "http-echo-2");
    }

    #[test]
    fn test_global_spec_from_yaml() {
        let yaml = r"
config:
  maxconn: 1111
  nbthread: 2
log_targets:
  - address: stdout
    format: raw
    facility: daemon
";
        let spec: GlobalSpec = assert_ok!(serde_yaml::from_str(yaml));
        assert_eq!(spec.config.maxconn, Some(1111));
        assert_eq!(spec.log_targets[0].address.as_deref(), Some("stdout"));
    }

    #[rstest]
    #[case("http-keep-alive", HttpConnectionMode::HttpKeepAlive)]
    #[case("http-server-close", HttpConnectionMode::HttpServerClose)]
    #[case("httpclose", HttpConnectionMode::Httpclose)]
    fn test_http_connection_mode(#[case] input: &str, #[case] expected: HttpConnectionMode) {
        assert_eq!(assert_ok!(HttpConnectionMode::from_str(input)), expected);
        assert_eq!(expected.to_string(), input);
    }
}
