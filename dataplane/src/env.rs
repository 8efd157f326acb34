//! Files and directories HAProxy is driven through, and the values the
//! controller enforces in the global and defaults sections.

use crate::certs::CertDirs;
use crate::models::{Defaults, Global, HttpConnectionMode, LogTarget, RuntimeApi};
use std::path::{Path, PathBuf};

pub const FRONT_HTTP: &str = "http";
pub const FRONT_HTTPS: &str = "https";
pub const FRONT_SSL: &str = "ssl";
pub const BACK_SSL: &str = "ssl-backend";
pub const FRONT_HEALTHZ: &str = "healthz";
pub const FRONT_STATS: &str = "stats";

const EXTERNAL_ROOT: &str = "/tmp/haproxy-ingress";
const EXTERNAL_PROGRAM: &str = "/usr/local/sbin/haproxy";

#[derive(Debug, Clone)]
pub struct Env {
    pub program: PathBuf,
    pub cfg_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub state_dir: PathBuf,
    pub main_cfg_file: PathBuf,
    pub aux_cfg_file: PathBuf,
    pub runtime_socket: PathBuf,
    pub master_socket: PathBuf,
    pub pid_file: PathBuf,
    pub maps_dir: PathBuf,
    pub patterns_dir: PathBuf,
    pub errorfiles_dir: PathBuf,
    pub certs: CertDirs,
}

impl Env {
    pub fn new(
        program: impl Into<PathBuf>,
        cfg_dir: impl Into<PathBuf>,
        runtime_dir: impl Into<PathBuf>,
        aux_cfg_name: &str,
    ) -> Self {
        let cfg_dir = cfg_dir.into();
        let runtime_dir = runtime_dir.into();
        let certs_dir = cfg_dir.join("certs");
        Self {
            program: program.into(),
            state_dir: runtime_dir.join("state"),
            main_cfg_file: cfg_dir.join("haproxy.cfg"),
            aux_cfg_file: cfg_dir.join(aux_cfg_name),
            runtime_socket: runtime_dir.join("haproxy-runtime-api.sock"),
            master_socket: runtime_dir.join("haproxy-master.sock"),
            pid_file: runtime_dir.join("haproxy.pid"),
            maps_dir: cfg_dir.join("maps"),
            patterns_dir: cfg_dir.join("patterns"),
            errorfiles_dir: cfg_dir.join("errorfiles"),
            certs: CertDirs {
                frontend: certs_dir.join("frontend"),
                backend: certs_dir.join("backend"),
                ca: certs_dir.join("ca"),
                tcp: certs_dir.join("tcp"),
            },
            cfg_dir,
            runtime_dir,
        }
    }

    /// Layout used when the controller runs outside a container.
    pub fn external(
        program: Option<&Path>,
        cfg_dir: Option<&Path>,
        runtime_dir: Option<&Path>,
        aux_cfg_name: &str,
    ) -> Self {
        let root = Path::new(EXTERNAL_ROOT);
        Self::new(
            program.map_or_else(|| PathBuf::from(EXTERNAL_PROGRAM), Path::to_path_buf),
            cfg_dir.map_or_else(|| root.join("etc"), Path::to_path_buf),
            runtime_dir.map_or_else(|| root.join("run"), Path::to_path_buf),
            aux_cfg_name,
        )
    }

    /// Creates every directory the controller writes to.
    pub fn init(&self) -> std::io::Result<()> {
        for dir in [
            &self.cfg_dir,
            &self.runtime_dir,
            &self.state_dir,
            &self.maps_dir,
            &self.patterns_dir,
            &self.errorfiles_dir,
            &self.certs.frontend,
            &self.certs.backend,
            &self.certs.ca,
            &self.certs.tcp,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn pattern_path(&self, name: &str) -> PathBuf {
        self.patterns_dir.join(name)
    }
}

const DEFAULT_BIND_CIPHERS: &str = "ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES256-GCM-SHA384:DHE-RSA-AES128-GCM-SHA256:DHE-DSS-AES128-GCM-SHA256:kEDH+AESGCM:ECDHE-RSA-AES128-SHA256:ECDHE-ECDSA-AES128-SHA256:ECDHE-RSA-AES128-SHA:ECDHE-ECDSA-AES128-SHA:ECDHE-RSA-AES256-SHA384:ECDHE-ECDSA-AES256-SHA384:ECDHE-RSA-AES256-SHA:ECDHE-ECDSA-AES256-SHA:DHE-RSA-AES128-SHA256:DHE-RSA-AES128-SHA:DHE-DSS-AES128-SHA256:DHE-RSA-AES256-SHA256:DHE-DSS-AES256-SHA:DHE-RSA-AES256-SHA:!aNULL:!eNULL:!EXPORT:!DES:!RC4:!3DES:!MD5:!PSK";

pub const DEFAULT_LOG_FORMAT: &str = "'%ci:%cp [%tr] %ft %b/%s %TR/%Tw/%Tc/%Tr/%Ta %ST %B %CC %CS %tsc %ac/%fc/%bc/%sc/%rc %sq/%bq %hr %hs \"%HM %[var(txn.base)] %HV\"'";

/// Enforces controller-owned global values and fills unset ones.
pub fn set_global(global: &mut Global, log_targets: &mut Vec<LogTarget>, env: &Env) {
    global.master_worker = true;
    global.pidfile = Some(env.pid_file.display().to_string());
    global.localpeer = Some("local".to_string());
    global.server_state_base = Some(env.state_dir.display().to_string());
    let socket = env.runtime_socket.display().to_string();
    if global.runtime_apis.first().map(|api| &api.address) != Some(&socket) {
        global.runtime_apis.insert(
            0,
            RuntimeApi {
                address: socket,
                level: "admin".to_string(),
                expose_fd_listeners: true,
            },
        );
    }

    global.daemon = true;
    global.stats_timeout.get_or_insert(36000);
    global.tune_ssl_default_dh_param.get_or_insert(2048);
    global
        .ssl_default_bind_ciphers
        .get_or_insert_with(|| DEFAULT_BIND_CIPHERS.to_string());
    global
        .ssl_default_bind_options
        .get_or_insert_with(|| "no-sslv3 no-tls-tickets no-tlsv10".to_string());

    if log_targets.is_empty() {
        log_targets.push(LogTarget {
            address: "127.0.0.1".to_string(),
            facility: Some("local0".to_string()),
            level: Some("notice".to_string()),
            ..LogTarget::default()
        });
    } else if log_targets.iter().any(|target| target.address == "stdout") {
        global.daemon = false;
    }
}

/// Fills unset defaults values.
pub fn set_defaults(defaults: &mut Defaults) {
    defaults.redispatch = true;
    defaults
        .http_connection_mode
        .get_or_insert(HttpConnectionMode::HttpKeepAlive);
    let timeouts = &mut defaults.timeouts;
    timeouts.http_request.get_or_insert(5000);
    timeouts.connect.get_or_insert(5000);
    timeouts.queue.get_or_insert(5000);
    timeouts.client.get_or_insert(50000);
    timeouts.server.get_or_insert(50000);
    timeouts.tunnel.get_or_insert(3_600_000);
    timeouts.http_keep_alive.get_or_insert(60000);
    defaults
        .log_format
        .get_or_insert_with(|| DEFAULT_LOG_FORMAT.to_string());
}
