use crate::models::{Backend, Defaults, Frontend, Global, LogTarget, Peers, Userlist};
use crate::render::render;
use haproxy_ingress_core::io::atomic_write;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("no transaction in progress")]
    NotStarted,
    #[error("a transaction is already in progress")]
    AlreadyStarted,
    #[error("transaction expired after {0:?}")]
    Expired(Duration),
    #[error("frontend {0} not found")]
    FrontendNotFound(String),
    #[error("backend {0} not found")]
    BackendNotFound(String),
    #[error("unable to write configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The full HAProxy configuration as the controller wants it.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Configuration {
    pub global: Global,
    pub log_targets: Vec<LogTarget>,
    pub global_snippet: Vec<String>,
    pub defaults: Defaults,
    pub userlists: BTreeMap<String, Userlist>,
    pub peers: BTreeMap<String, Peers>,
    pub frontends: BTreeMap<String, Frontend>,
    pub backends: BTreeMap<String, Backend>,
    pub permanent_backends: BTreeSet<String>,
}

impl Configuration {
    pub fn frontend(&self, name: &str) -> Result<&Frontend, TransactionError> {
        self.frontends
            .get(name)
            .ok_or_else(|| TransactionError::FrontendNotFound(name.to_string()))
    }

    pub fn frontend_mut(&mut self, name: &str) -> Result<&mut Frontend, TransactionError> {
        self.frontends
            .get_mut(name)
            .ok_or_else(|| TransactionError::FrontendNotFound(name.to_string()))
    }

    pub fn backend(&self, name: &str) -> Result<&Backend, TransactionError> {
        self.backends
            .get(name)
            .ok_or_else(|| TransactionError::BackendNotFound(name.to_string()))
    }

    pub fn backend_mut(&mut self, name: &str) -> Result<&mut Backend, TransactionError> {
        self.backends
            .get_mut(name)
            .ok_or_else(|| TransactionError::BackendNotFound(name.to_string()))
    }

    pub fn render(&self) -> String {
        render(self)
    }
}

/// A working copy of the live configuration.
///
/// Every edit of a reconcile pass goes to the copy. `commit` writes the
/// rendered copy to disk and hands it back as the new live configuration;
/// dropping the transaction discards the edits.
#[derive(Debug)]
pub struct Transaction {
    working: Configuration,
    started: Instant,
    timeout: Duration,
}

impl Transaction {
    pub(crate) fn begin(live: &Configuration, timeout: Duration) -> Self {
        debug!("Starting configuration transaction");
        Self {
            working: live.clone(),
            started: Instant::now(),
            timeout,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.working
    }

    pub fn config_mut(&mut self) -> &mut Configuration {
        &mut self.working
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() > self.timeout
    }

    /// Renders and atomically writes the working copy. Returns the committed
    /// configuration and whether the file content changed.
    pub(crate) fn commit(self, path: &Path) -> Result<(Configuration, bool), TransactionError> {
        if self.is_expired() {
            return Err(TransactionError::Expired(self.timeout));
        }
        let rendered = self.working.render();
        let changed = match std::fs::read(path) {
            Ok(existing) => existing != rendered.as_bytes(),
            Err(_) => true,
        };
        if changed {
            atomic_write(path, rendered.as_bytes()).map_err(|source| TransactionError::Write {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "Configuration committed");
        } else {
            debug!("Configuration unchanged, nothing written");
        }
        Ok((self.working, changed))
    }
}
