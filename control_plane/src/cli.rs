use crate::annotations::{AnnotationError, DisabledSnippets, parse_duration};
use crate::handlers::BindAddresses;
use crate::store::NamespacedName;
use clap::Parser;
use getset::{CopyGetters, Getters};
use haproxy_ingress_api::constants::GATEWAY_CLASS_CONTROLLER_NAME;
use std::path::PathBuf;
use std::time::Duration;

fn duration(value: &str) -> Result<Duration, AnnotationError> {
    parse_duration(value).map(Duration::from_millis)
}

#[derive(Debug, Parser, Getters, CopyGetters)]
#[command(about = "HAProxy Kubernetes ingress controller", long_about = None)]
pub struct Cli {
    /// Main configmap, as namespace/name.
    #[getset(get = "pub")]
    #[arg(long = "configmap")]
    configmap: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "configmap-tcp-services")]
    configmap_tcp_services: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "configmap-errorfiles")]
    configmap_errorfiles: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "configmap-patternfiles")]
    configmap_patternfiles: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "ingress-class", default_value = "")]
    ingress_class: String,

    /// Also handle ingresses without a class.
    #[getset(get_copy = "pub")]
    #[arg(long = "empty-ingress-class")]
    empty_ingress_class: bool,

    /// Service whose addresses are published in ingress statuses.
    #[getset(get = "pub")]
    #[arg(long = "publish-service")]
    publish_service: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "default-backend-service")]
    default_backend_service: Option<NamespacedName>,

    #[getset(get_copy = "pub")]
    #[arg(long = "default-backend-port", default_value = "6061")]
    default_backend_port: u16,

    #[getset(get = "pub")]
    #[arg(long = "default-ssl-certificate")]
    default_ssl_certificate: Option<NamespacedName>,

    #[getset(get = "pub")]
    #[arg(long = "namespace-whitelist")]
    namespace_whitelist: Vec<String>,

    #[getset(get = "pub")]
    #[arg(long = "namespace-blacklist")]
    namespace_blacklist: Vec<String>,

    #[getset(get_copy = "pub")]
    #[arg(long = "http-bind-port", default_value = "8080")]
    http_bind_port: u16,

    #[getset(get_copy = "pub")]
    #[arg(long = "https-bind-port", default_value = "8443")]
    https_bind_port: u16,

    #[getset(get = "pub")]
    #[arg(long = "ipv4-bind-address", default_value = "0.0.0.0")]
    ipv4_bind_address: String,

    #[getset(get = "pub")]
    #[arg(long = "ipv6-bind-address", default_value = ":::")]
    ipv6_bind_address: String,

    #[getset(get_copy = "pub")]
    #[arg(long = "disable-http")]
    disable_http: bool,

    #[getset(get_copy = "pub")]
    #[arg(long = "disable-https")]
    disable_https: bool,

    #[getset(get_copy = "pub")]
    #[arg(long = "disable-ipv4")]
    disable_ipv4: bool,

    #[getset(get_copy = "pub")]
    #[arg(long = "disable-ipv6")]
    disable_ipv6: bool,

    #[getset(get_copy = "pub")]
    #[arg(long = "prometheus-port")]
    prometheus_port: Option<u16>,

    #[getset(get_copy = "pub")]
    #[arg(long = "pprof")]
    pprof: bool,

    /// `all`, `global`, `frontend`, `backend` or a comma separated mix.
    #[getset(get_copy = "pub")]
    #[arg(long = "disable-config-snippets", default_value = "")]
    disable_config_snippets: DisabledSnippets,

    #[getset(get = "pub")]
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    #[getset(get_copy = "pub")]
    #[arg(long = "channel-size", default_value = "600")]
    channel_size: usize,

    #[getset(get = "pub")]
    #[arg(long = "config-dir")]
    config_dir: Option<PathBuf>,

    #[getset(get = "pub")]
    #[arg(long = "runtime-dir")]
    runtime_dir: Option<PathBuf>,

    /// HAProxy binary.
    #[getset(get = "pub")]
    #[arg(long = "program")]
    program: Option<PathBuf>,

    /// Run outside of a cluster pod.
    #[getset(get_copy = "pub")]
    #[arg(long = "external")]
    external: bool,

    /// Do not run HAProxy.
    #[getset(get_copy = "pub")]
    #[arg(long = "test")]
    test: bool,

    #[getset(get_copy = "pub")]
    #[arg(long = "controller-port", default_value = "6060")]
    controller_port: u16,

    #[getset(get_copy = "pub")]
    #[arg(long = "healthz-bind-port", default_value = "1042")]
    healthz_bind_port: u16,

    #[getset(get_copy = "pub")]
    #[arg(long = "stats-bind-port", default_value = "1024")]
    stats_bind_port: u16,

    #[getset(get_copy = "pub")]
    #[arg(long = "sync-period", default_value = "5s", value_parser = duration)]
    sync_period: Duration,

    #[getset(get_copy = "pub")]
    #[arg(long = "transaction-timeout", default_value = "5s", value_parser = duration)]
    transaction_timeout: Duration,

    /// File name of the auxiliary configuration in the config directory.
    #[getset(get = "pub")]
    #[arg(long = "aux-config", default_value = "aux.cfg")]
    aux_config: String,

    #[getset(get = "pub")]
    #[arg(long = "gateway-controller-name", default_value = GATEWAY_CLASS_CONTROLLER_NAME)]
    gateway_controller_name: String,

    #[getset(get = "pub")]
    #[arg(long = "pod-namespace", env = "POD_NAMESPACE", default_value = "haproxy-controller")]
    pod_namespace: String,

    #[getset(get = "pub")]
    #[arg(long = "pod-name", env = "POD_NAME", default_value = "")]
    pod_name: String,
}

impl Cli {
    /// Public bind addresses, honoring the family switches.
    pub fn bind_addresses(&self) -> BindAddresses {
        BindAddresses::new(
            (!self.disable_ipv4).then(|| self.ipv4_bind_address.clone()),
            (!self.disable_ipv6).then(|| self.ipv6_bind_address.clone()),
        )
    }

    /// The configured configmaps, for watching.
    pub fn config_maps(&self) -> Vec<NamespacedName> {
        [
            &self.configmap,
            &self.configmap_tcp_services,
            &self.configmap_errorfiles,
            &self.configmap_patternfiles,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let cli = assert_ok!(Cli::try_parse_from(["haproxy-ingress-controller"]));
        assert_eq!(cli.http_bind_port(), 8080);
        assert_eq!(cli.https_bind_port(), 8443);
        assert_eq!(cli.channel_size(), 600);
        assert_eq!(cli.sync_period(), Duration::from_secs(5));
        assert_eq!(cli.aux_config(), "aux.cfg");
        assert_eq!(cli.gateway_controller_name(), GATEWAY_CLASS_CONTROLLER_NAME);
        assert_eq!(cli.disable_config_snippets(), DisabledSnippets::default());
        assert!(cli.config_maps().is_empty());
        assert_eq!(cli.bind_addresses().binds(80).len(), 2);
    }

    #[test]
    fn test_flags() {
        let cli = assert_ok!(Cli::try_parse_from([
            "haproxy-ingress-controller",
            "--configmap=haproxy-controller/haproxy-kubernetes-ingress",
            "--configmap-tcp-services",
            "haproxy-controller/tcp",
            "--namespace-whitelist=default",
            "--namespace-whitelist=apps",
            "--disable-ipv6",
            "--sync-period=500ms",
            "--disable-config-snippets=global,backend",
        ]));
        let main = assert_ok!(cli.configmap().clone().ok_or("missing"));
        assert_eq!(main.to_string(), "haproxy-controller/haproxy-kubernetes-ingress");
        assert_eq!(cli.config_maps().len(), 2);
        assert_eq!(cli.namespace_whitelist(), &vec!["default".to_string(), "apps".to_string()]);
        assert_eq!(cli.sync_period(), Duration::from_millis(500));
        let snippets = cli.disable_config_snippets();
        assert!(snippets.global && snippets.backend && !snippets.frontend);
        let binds = cli.bind_addresses().binds(80);
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].address, "0.0.0.0");
    }

    #[test]
    fn test_invalid_values() {
        assert_err!(Cli::try_parse_from(["haproxy-ingress-controller", "--configmap=missing-slash"]));
        assert_err!(Cli::try_parse_from(["haproxy-ingress-controller", "--sync-period=soon"]));
    }
}
