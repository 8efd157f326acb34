//! Client for the HAProxy runtime (admin) socket.

use crate::instrumentation::record_runtime_command;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, error, trace};

/// Upper bound of a single runtime write, matching HAProxy's default buffer.
pub const BUFFER_SIZE: usize = 16000;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unable to reach runtime socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("runtime socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime command timed out after {0:?}")]
    Timeout(Duration),
    #[error("runtime command `{command}` failed: {output}")]
    Command { command: String, output: String },
    #[error("map {0} not found")]
    MapNotFound(String),
    #[error("certificate {0} already exists")]
    CertificateExists(String),
    #[error("runtime update failed for backend {0}")]
    ServerUpdate(String),
}

/// Raw command execution. One call is one connection to the socket.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Runtime: Send + Sync {
    async fn execute(&self, command: String) -> Result<String, RuntimeError>;
}

pub struct SocketRuntime {
    path: PathBuf,
    timeout: Duration,
}

impl SocketRuntime {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    async fn exchange(&self, command: &str) -> Result<String, RuntimeError> {
        let mut stream =
            UnixStream::connect(&self.path)
                .await
                .map_err(|source| RuntimeError::Connect {
                    path: self.path.clone(),
                    source,
                })?;
        stream.write_all(command.as_bytes()).await?;
        if !command.ends_with('\n') {
            stream.write_all(b"\n").await?;
        }
        stream.flush().await?;

        let mut output = String::new();
        stream.read_to_string(&mut output).await?;
        Ok(output)
    }
}

#[async_trait]
impl Runtime for SocketRuntime {
    async fn execute(&self, command: String) -> Result<String, RuntimeError> {
        trace!(command = %first_line(&command), "Runtime command");
        tokio::time::timeout(self.timeout, self.exchange(&command))
            .await
            .map_err(|_| RuntimeError::Timeout(self.timeout))?
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or_default()
}

const ERROR_MARKERS: [&str; 8] = [
    "Unknown",
    "No such",
    "Can't",
    "can't",
    "not found",
    "error",
    "Error",
    "failed",
];

fn failed(output: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| output.contains(marker))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeServerData {
    pub backend_name: String,
    pub server_name: String,
    pub address: String,
    pub port: Option<u16>,
    pub state: ServerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ServerState {
    Ready,
    Maint,
}

/// Typed operations on top of a [`Runtime`].
#[derive(Clone)]
pub struct RuntimeClient {
    runtime: Arc<dyn Runtime>,
}

impl RuntimeClient {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self { runtime }
    }

    async fn run(&self, object: &'static str, command: String) -> Result<String, RuntimeError> {
        let result = self.runtime.execute(command.clone()).await;
        match result {
            Ok(output) if failed(&output) => {
                record_runtime_command(object, false);
                Err(RuntimeError::Command {
                    command: first_line(&command).to_string(),
                    output: output.trim().to_string(),
                })
            }
            Ok(output) => {
                record_runtime_command(object, true);
                Ok(output)
            }
            Err(err) => {
                record_runtime_command(object, false);
                Err(err)
            }
        }
    }

    /// Points server slots at new addresses and sets their state, batching
    /// commands so a single write stays under [`BUFFER_SIZE`].
    pub async fn set_servers(&self, servers: &[RuntimeServerData]) -> Result<(), RuntimeError> {
        let mut batch = String::new();
        let mut batch_backend = String::new();
        for server in servers {
            let mut command = format!(
                "set server {}/{} addr {}",
                server.backend_name, server.server_name, server.address
            );
            if let Some(port) = server.port.filter(|port| *port > 0) {
                let _ = write!(command, " port {port}");
            }
            let _ = write!(
                command,
                ";set server {}/{} state {};",
                server.backend_name, server.server_name, server.state
            );

            if !batch.is_empty() && batch.len() + command.len() >= BUFFER_SIZE {
                self.run_server_batch(&batch, &batch_backend).await?;
                batch.clear();
            }
            if batch.is_empty() {
                batch_backend.clone_from(&server.backend_name);
            }
            batch.push_str(&command);
        }
        if !batch.is_empty() {
            self.run_server_batch(&batch, &batch_backend).await?;
        }
        Ok(())
    }

    async fn run_server_batch(&self, batch: &str, backend: &str) -> Result<(), RuntimeError> {
        let output = self
            .runtime
            .execute(batch.to_string())
            .await
            .inspect_err(|_| record_runtime_command("server", false))?;
        let rejected = output.len() > 5
            && matches!(output.get(0..4), Some("[3]:" | "[2]:" | "[1]:" | "[0]:"));
        if rejected || failed(&output) {
            error!(backend, "Runtime update rejected, server slots adjustment needed");
            trace!(backend, output = %output.trim(), "Runtime update output");
            record_runtime_command("server", false);
            return Err(RuntimeError::ServerUpdate(backend.to_string()));
        }
        record_runtime_command("server", true);
        Ok(())
    }

    /// Replaces the content of a loaded map through a map transaction.
    pub async fn set_map_content(&self, path: &str, chunks: &[String]) -> Result<(), RuntimeError> {
        let output = self
            .runtime
            .execute(format!("prepare map {path}"))
            .await?;
        if output.contains("Unknown map") || output.contains("doesn't exist") {
            record_runtime_command("map", false);
            return Err(RuntimeError::MapNotFound(path.to_string()));
        }
        let version = output
            .split(':')
            .nth(1)
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
            .ok_or_else(|| RuntimeError::Command {
                command: format!("prepare map {path}"),
                output: output.trim().to_string(),
            })?
            .to_string();

        for chunk in chunks {
            self.run("map", format!("add map @{version} {path} <<\n{chunk}\n"))
                .await?;
        }
        self.run("map", format!("commit map @{version} {path}"))
            .await?;
        debug!(path, version, "Map content committed through runtime");
        Ok(())
    }

    pub async fn new_cert(&self, file: &str, ca: bool) -> Result<(), RuntimeError> {
        let kind = if ca { "ca-file" } else { "cert" };
        let output = self.runtime.execute(format!("new ssl {kind} {file}")).await?;
        if output.contains("already exists") {
            return Err(RuntimeError::CertificateExists(file.to_string()));
        }
        if failed(&output) {
            record_runtime_command("cert", false);
            return Err(RuntimeError::Command {
                command: format!("new ssl {kind} {file}"),
                output: output.trim().to_string(),
            });
        }
        record_runtime_command("cert", true);
        Ok(())
    }

    pub async fn set_cert(&self, file: &str, payload: &str, ca: bool) -> Result<(), RuntimeError> {
        let kind = if ca { "ca-file" } else { "cert" };
        self.run("cert", format!("set ssl {kind} {file} <<\n{payload}\n"))
            .await
            .map(|_| ())
    }

    pub async fn commit_cert(&self, file: &str, ca: bool) -> Result<(), RuntimeError> {
        let kind = if ca { "ca-file" } else { "cert" };
        self.run("cert", format!("commit ssl {kind} {file}"))
            .await
            .map(|_| ())
    }

    pub async fn abort_cert(&self, file: &str, ca: bool) -> Result<(), RuntimeError> {
        let kind = if ca { "ca-file" } else { "cert" };
        self.run("cert", format!("abort ssl {kind} {file}"))
            .await
            .map(|_| ())
    }

    pub async fn add_crt_list_entry(&self, crt_list: &str, file: &str) -> Result<(), RuntimeError> {
        self.run("cert", format!("add ssl crt-list {crt_list} {file}"))
            .await
            .map(|_| ())
    }

    pub async fn delete_crt_list_entry(
        &self,
        crt_list: &str,
        file: &str,
    ) -> Result<(), RuntimeError> {
        self.run("cert", format!("del ssl crt-list {crt_list} {file}"))
            .await
            .map(|_| ())
    }

    pub async fn delete_cert(&self, file: &str) -> Result<(), RuntimeError> {
        self.run("cert", format!("del ssl cert {file}"))
            .await
            .map(|_| ())
    }

    /// `show info` as key/value pairs.
    pub async fn show_info(&self) -> Result<BTreeMap<String, String>, RuntimeError> {
        let output = self.run("info", "show info".to_string()).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect())
    }
}
