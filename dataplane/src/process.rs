//! Lifecycle of the HAProxy master process.

use crate::env::Env;
use crate::instrumentation::{record_reload, record_restart};
use crate::runtime::{Runtime, SocketRuntime};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("unable to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("haproxy is not running")]
    NotRunning,
    #[error("unable to signal haproxy: {0}")]
    Signal(#[source] std::io::Error),
    #[error("master socket command failed: {0}")]
    Master(#[from] crate::runtime::RuntimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Reload,
    Restart,
}

/// Control over the HAProxy instance the controller programs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Process: Send + Sync {
    async fn service(&mut self, action: Action) -> Result<(), ProcessError>;
    fn use_aux_file(&mut self, enabled: bool);
}

/// Runs HAProxy as a child in master-worker mode.
pub struct DirectProcess {
    program: PathBuf,
    main_cfg_file: PathBuf,
    aux_cfg_file: PathBuf,
    master_socket: PathBuf,
    use_aux_file: bool,
    child: Option<Child>,
}

impl DirectProcess {
    pub fn new(env: &Env) -> Self {
        Self {
            program: env.program.clone(),
            main_cfg_file: env.main_cfg_file.clone(),
            aux_cfg_file: env.aux_cfg_file.clone(),
            master_socket: env.master_socket.clone(),
            use_aux_file: env.aux_cfg_file.exists(),
            child: None,
        }
    }

    fn running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!(%status, "haproxy exited");
                self.child = None;
                false
            }
            Some(Err(err)) => {
                error!("unable to query haproxy status: {err}");
                false
            }
            None => false,
        }
    }

    pub(crate) fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-W".to_string(),
            "-S".to_string(),
            format!("{},level,admin", self.master_socket.display()),
            "-f".to_string(),
            self.main_cfg_file.display().to_string(),
        ];
        if self.use_aux_file {
            args.push("-f".to_string());
            args.push(self.aux_cfg_file.display().to_string());
        }
        args
    }

    async fn start(&mut self) -> Result<(), ProcessError> {
        if self.running() {
            error!("haproxy is already running");
            return Ok(());
        }
        let child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        info!(pid = child.id(), "haproxy started");
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ProcessError> {
        if !self.running() {
            error!("haproxy already stopped");
            return Err(ProcessError::NotRunning);
        }
        let Some(mut child) = self.child.take() else {
            return Err(ProcessError::NotRunning);
        };
        if let Some(pid) = child.id() {
            let status = Command::new("kill")
                .args(["-USR1", &pid.to_string()])
                .status()
                .await
                .map_err(ProcessError::Signal)?;
            if !status.success() {
                warn!(%status, "soft stop refused, killing haproxy");
                child.start_kill().map_err(ProcessError::Signal)?;
            }
        }
        child.wait().await.map_err(ProcessError::Signal)?;
        info!("haproxy stopped");
        Ok(())
    }

    async fn reload(&mut self) -> Result<(), ProcessError> {
        if !self.running() {
            error!("haproxy is not running, trying to start it");
            return self.start().await;
        }
        let master = SocketRuntime::new(&self.master_socket, Duration::from_secs(10));
        master.execute("reload".to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl Process for DirectProcess {
    async fn service(&mut self, action: Action) -> Result<(), ProcessError> {
        match action {
            Action::Start => self.start().await,
            Action::Stop => self.stop().await,
            Action::Reload => {
                record_reload();
                self.reload().await
            }
            Action::Restart => {
                record_restart();
                if let Err(err) = self.stop().await {
                    warn!("{err}");
                }
                self.start().await
            }
        }
    }

    fn use_aux_file(&mut self, enabled: bool) {
        self.use_aux_file = enabled;
    }
}

/// Logs actions instead of running HAProxy.
#[derive(Default)]
pub struct TestProcess {
    use_aux_file: bool,
}

#[async_trait]
impl Process for TestProcess {
    async fn service(&mut self, action: Action) -> Result<(), ProcessError> {
        info!("HAProxy would be {action}ed now");
        if matches!(action, Action::Start | Action::Restart) && self.use_aux_file {
            info!("auxiliary configuration would be loaded");
        }
        Ok(())
    }

    fn use_aux_file(&mut self, enabled: bool) {
        self.use_aux_file = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assertables::{assert_err, assert_ok};

    #[test]
    fn test_args_with_aux_file() {
        let env = Env::new("/usr/sbin/haproxy", "/etc/haproxy", "/run", "aux.cfg");
        let mut process = DirectProcess::new(&env);
        process.use_aux_file(true);
        assert_eq!(
            process.args(),
            vec![
                "-W",
                "-S",
                "/run/haproxy-master.sock,level,admin",
                "-f",
                "/etc/haproxy/haproxy.cfg",
                "-f",
                "/etc/haproxy/aux.cfg",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_without_process() {
        let env = Env::new("/nonexistent/haproxy", "/tmp/cfg", "/tmp/run", "aux.cfg");
        let mut process = DirectProcess::new(&env);
        let err = assert_err!(process.service(Action::Stop).await);
        assert!(matches!(err, ProcessError::NotRunning));
    }

    #[tokio::test]
    async fn test_start_missing_program() {
        let env = Env::new("/nonexistent/haproxy", "/tmp/cfg", "/tmp/run", "aux.cfg");
        let mut process = DirectProcess::new(&env);
        let err = assert_err!(process.service(Action::Start).await);
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_test_process_is_noop() {
        let mut process = TestProcess::default();
        process.use_aux_file(true);
        assert_ok!(process.service(Action::Restart).await);
    }
}
