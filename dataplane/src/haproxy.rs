//! Entry point of the data plane: one HAProxy instance, its configuration,
//! runtime socket, map files, certificates and rule sets.

use crate::certs::{CertificateError, Certificates, SecretRef, SecretType};
use crate::configuration::{Configuration, Transaction, TransactionError};
use crate::env::Env;
use crate::instance::Instance;
use crate::maps::{Maps, PERSISTENT_MAPS};
use crate::models::Backend;
use crate::process::{Action, Process, ProcessError};
use crate::rules::{Rule, SectionRules};
use crate::runtime::{RuntimeClient, RuntimeError, RuntimeServerData};
use getset::{Getters, MutGetters};
use haproxy_ingress_core::io::atomic_write;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum HAProxyError {
    #[error("unable to prepare haproxy environment: {0}")]
    Environment(#[source] std::io::Error),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[derive(Getters, MutGetters)]
pub struct HAProxy {
    #[getset(get = "pub")]
    env: Env,
    #[getset(get = "pub")]
    live: Configuration,
    transaction: Option<Transaction>,
    transaction_timeout: Duration,
    #[getset(get = "pub")]
    runtime: RuntimeClient,
    process: Box<dyn Process>,
    #[getset(get = "pub", get_mut = "pub")]
    maps: Maps,
    #[getset(get = "pub", get_mut = "pub")]
    rules: SectionRules,
    #[getset(get = "pub", get_mut = "pub")]
    certs: Certificates,
    #[getset(get = "pub", get_mut = "pub")]
    instance: Instance,
    active_backends: BTreeSet<String>,
    ssl_passthrough: bool,
}

impl std::fmt::Debug for HAProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HAProxy").finish_non_exhaustive()
    }
}

impl HAProxy {
    /// Prepares directories, writes the base configuration and wires the
    /// collaborators. HAProxy itself is started with [`HAProxy::service`].
    pub fn new(
        env: Env,
        base: Configuration,
        runtime: RuntimeClient,
        process: Box<dyn Process>,
        transaction_timeout: Duration,
    ) -> Result<Self, HAProxyError> {
        env.init().map_err(HAProxyError::Environment)?;
        atomic_write(&env.main_cfg_file, base.render().as_bytes())
            .map_err(HAProxyError::Environment)?;
        let maps = Maps::new(&env.maps_dir, &PERSISTENT_MAPS);
        let certs = Certificates::new(env.certs.clone());
        Ok(Self {
            env,
            live: base,
            transaction: None,
            transaction_timeout,
            runtime,
            process,
            maps,
            rules: SectionRules::default(),
            certs,
            instance: Instance::default(),
            active_backends: BTreeSet::new(),
            ssl_passthrough: false,
        })
    }

    pub fn start_transaction(&mut self) -> Result<(), TransactionError> {
        if self.transaction.is_some() {
            return Err(TransactionError::AlreadyStarted);
        }
        self.transaction = Some(Transaction::begin(&self.live, self.transaction_timeout));
        Ok(())
    }

    /// Writes the working configuration and makes it live.
    pub fn commit_transaction(&mut self) -> Result<bool, TransactionError> {
        let transaction = self
            .transaction
            .take()
            .ok_or(TransactionError::NotStarted)?;
        let (committed, changed) = transaction.commit(&self.env.main_cfg_file)?;
        self.live = committed;
        Ok(changed)
    }

    pub fn dispose_transaction(&mut self) {
        if self.transaction.take().is_some() {
            debug!("Configuration transaction disposed");
        }
    }

    pub fn config(&self) -> Result<&Configuration, TransactionError> {
        self.transaction
            .as_ref()
            .map(Transaction::config)
            .ok_or(TransactionError::NotStarted)
    }

    pub fn config_mut(&mut self) -> Result<&mut Configuration, TransactionError> {
        working(&mut self.transaction)
    }

    pub fn ssl_passthrough(&self) -> bool {
        self.ssl_passthrough
    }

    pub fn set_ssl_passthrough(&mut self, enabled: bool) {
        self.ssl_passthrough = enabled;
    }

    /// Registers a rule; see [`SectionRules::add_rule`].
    pub fn add_rule(&mut self, frontend: &str, rule: impl Into<Rule>, ingress: bool) -> String {
        self.rules.add_rule(frontend, rule.into(), ingress)
    }

    /// Creates `backend` or updates its parameters. Servers already present
    /// are kept so runtime updates keep working. Returns true when the
    /// backend was created or its parameters changed.
    pub fn backend_create_or_update(&mut self, backend: Backend) -> Result<bool, TransactionError> {
        let name = backend.name.clone();
        self.active_backends.insert(name.clone());
        let config = working(&mut self.transaction)?;
        match config.backends.get_mut(&name) {
            Some(existing) => {
                if existing.without_servers() == backend.without_servers() {
                    return Ok(false);
                }
                let servers = std::mem::take(&mut existing.servers);
                *existing = Backend { servers, ..backend };
                self.instance.reload(format!("backend '{name}' updated"));
            }
            None => {
                config.backends.insert(name.clone(), backend);
                self.instance.reload(format!("backend '{name}' created"));
            }
        }
        Ok(true)
    }

    /// Marks a backend as referenced in this pass.
    pub fn backend_used(&mut self, name: &str) {
        self.active_backends.insert(name.to_string());
    }

    pub fn set_permanent_backend(&mut self, name: &str) -> Result<(), TransactionError> {
        self.config_mut()?
            .permanent_backends
            .insert(name.to_string());
        Ok(())
    }

    /// Deletes backends that were not referenced during the pass.
    pub fn refresh_backends(&mut self) -> Result<Vec<String>, TransactionError> {
        let active = std::mem::take(&mut self.active_backends);
        let config = working(&mut self.transaction)?;
        let deleted = config
            .backends
            .keys()
            .filter(|name| !active.contains(*name) && !config.permanent_backends.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        for name in &deleted {
            config.backends.remove(name);
        }
        for name in &deleted {
            debug!("Backend '{name}' deleted");
            self.instance.reload(format!("backend '{name}' deleted"));
        }
        Ok(deleted)
    }

    /// Writes the PEM file of a secret; see [`Certificates::add_secret`].
    pub async fn add_secret(
        &mut self,
        secret: SecretRef<'_>,
        secret_type: SecretType,
    ) -> Result<PathBuf, CertificateError> {
        self.certs
            .add_secret(secret, secret_type, &self.runtime, &mut self.instance)
            .await
    }

    /// Pushes server slot changes through the runtime socket. A rejected
    /// update falls back to a reload.
    pub async fn sync_backend_servers(&mut self, backend: &str, servers: &[RuntimeServerData]) {
        if servers.is_empty() {
            return;
        }
        match self.runtime.set_servers(servers).await {
            Ok(()) => debug!(backend, "Server slots updated through runtime"),
            Err(RuntimeError::ServerUpdate(_)) => {
                self.instance
                    .reload(format!("Runtime update of backend '{backend}' rejected"));
            }
            Err(err) => {
                error!(backend, "{err}");
                self.instance
                    .reload(format!("Runtime update of backend '{backend}' failed"));
            }
        }
    }

    /// Certificates, rules, maps and backends cleanup, run at pass end.
    pub async fn refresh(&mut self, clean_certs: bool) -> Result<Vec<String>, TransactionError> {
        if clean_certs {
            self.certs.refresh(&self.runtime, &mut self.instance).await;
        }
        let config = working(&mut self.transaction)?;
        self.rules.refresh(config, &mut self.instance);
        self.maps.refresh(&self.runtime, &mut self.instance).await;
        self.refresh_backends()
    }

    pub async fn service(&mut self, action: Action) -> Result<(), ProcessError> {
        info!("HAProxy {action}");
        self.process.service(action).await
    }

    pub fn use_aux_file(&mut self, enabled: bool) {
        self.process.use_aux_file(enabled);
    }

    /// Resets per-pass state. Existing rules are marked for deletion and
    /// survive only if registered again during the next pass.
    pub fn clean(&mut self) {
        self.ssl_passthrough = false;
        self.maps.clean();
        self.certs.clean();
        let frontends = self
            .live
            .frontends
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>();
        self.rules.clean(&frontends);
        self.active_backends.clear();
    }
}

fn working(transaction: &mut Option<Transaction>) -> Result<&mut Configuration, TransactionError> {
    transaction
        .as_mut()
        .map(Transaction::config_mut)
        .ok_or(TransactionError::NotStarted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Frontend, Mode, Server};
    use crate::process::MockProcess;
    use crate::rules::ReqDeny;
    use crate::runtime::{MockRuntime, Runtime, ServerState};
    use assertables::{assert_contains, assert_err, assert_ok};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn haproxy(dir: &TempDir, reply: &'static str) -> HAProxy {
        let env = Env::new(
            "haproxy",
            dir.path().join("etc"),
            dir.path().join("run"),
            "aux.cfg",
        );
        let mut runtime = MockRuntime::new();
        runtime
            .expect_execute()
            .returning(move |_| Ok(reply.to_string()));
        let mut base = Configuration::default();
        base.frontends
            .insert("http".to_string(), Frontend::new("http", Mode::Http));
        assert_ok!(HAProxy::new(
            env,
            base,
            RuntimeClient::new(Arc::new(runtime) as Arc<dyn Runtime>),
            Box::new(MockProcess::new()),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let dir = assert_ok!(tempdir());
        let mut haproxy = haproxy(&dir, "");
        assert!(matches!(
            assert_err!(haproxy.config_mut()),
            TransactionError::NotStarted
        ));

        assert_ok!(haproxy.start_transaction());
        assert!(matches!(
            assert_err!(haproxy.start_transaction()),
            TransactionError::AlreadyStarted
        ));
        assert_ok!(haproxy.backend_create_or_update(Backend::new("default_app_http", Mode::Http)));
        assert!(haproxy.instance().need_reload());
        assert_ok!(haproxy.commit_transaction());

        let written = assert_ok!(std::fs::read_to_string(&haproxy.env().main_cfg_file));
        assert_contains!(written, "backend default_app_http");
        assert!(haproxy.live().backends.contains_key("default_app_http"));
    }

    #[tokio::test]
    async fn test_unchanged_backend_keeps_servers() {
        let dir = assert_ok!(tempdir());
        let mut haproxy = haproxy(&dir, "");
        assert_ok!(haproxy.start_transaction());
        let mut backend = Backend::new("default_app_http", Mode::Http);
        assert_ok!(haproxy.backend_create_or_update(backend.clone()));
        let config = assert_ok!(haproxy.config_mut());
        let existing = assert_ok!(config.backend_mut("default_app_http"));
        existing.set_server(Server::new("SRV_1", "10.0.0.1", Some(80)));
        haproxy.instance_mut().reset();

        assert!(!assert_ok!(haproxy.backend_create_or_update(backend.clone())));
        assert!(!haproxy.instance().need_reload());

        backend.forwardfor = true;
        assert!(assert_ok!(haproxy.backend_create_or_update(backend)));
        let config = assert_ok!(haproxy.config());
        assert_eq!(assert_ok!(config.backend("default_app_http")).servers.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_deletes_unused_backends() {
        let dir = assert_ok!(tempdir());
        let mut haproxy = haproxy(&dir, "New version created: 1\n");
        assert_ok!(haproxy.start_transaction());
        assert_ok!(haproxy.backend_create_or_update(Backend::new("a", Mode::Http)));
        assert_ok!(haproxy.backend_create_or_update(Backend::new("ssl-backend", Mode::Tcp)));
        assert_ok!(haproxy.set_permanent_backend("ssl-backend"));
        haproxy.add_rule(
            "http",
            ReqDeny {
                src_ips_map: "/maps/deny.map".to_string(),
                whitelist: false,
            },
            false,
        );
        assert_ok!(haproxy.refresh(true).await);
        assert_ok!(haproxy.commit_transaction());
        haproxy.clean();

        assert_ok!(haproxy.start_transaction());
        let deleted = assert_ok!(haproxy.refresh(true).await);
        assert_eq!(deleted, vec!["a".to_string()]);
        let config = assert_ok!(haproxy.config());
        assert!(config.backends.contains_key("ssl-backend"));
        assert!(config.frontends["http"].http_request_rules.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_server_update_reloads() {
        let dir = assert_ok!(tempdir());
        let mut haproxy = haproxy(&dir, "[3]: No such server.\n");
        haproxy
            .sync_backend_servers(
                "a",
                &[RuntimeServerData {
                    backend_name: "a".to_string(),
                    server_name: "SRV_1".to_string(),
                    address: "10.0.0.2".to_string(),
                    port: Some(80),
                    state: ServerState::Ready,
                }],
            )
            .await;
        assert!(haproxy.instance().need_reload());
    }

    #[tokio::test]
    async fn test_service_delegates_to_process() {
        let dir = assert_ok!(tempdir());
        let env = Env::new("haproxy", dir.path().join("etc"), dir.path().join("run"), "aux.cfg");
        let mut process = MockProcess::new();
        process
            .expect_service()
            .withf(|action| *action == Action::Reload)
            .times(1)
            .returning(|_| Ok(()));
        let runtime = MockRuntime::new();
        let mut haproxy = assert_ok!(HAProxy::new(
            env,
            Configuration::default(),
            RuntimeClient::new(Arc::new(runtime) as Arc<dyn Runtime>),
            Box::new(process),
            Duration::from_secs(5),
        ));
        assert_ok!(haproxy.service(Action::Reload).await);
    }
}
