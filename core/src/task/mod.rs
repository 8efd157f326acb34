//! Named background tasks tied to a process-wide shutdown handle.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_shutdown::Shutdown;
use tracing::{Instrument, debug, error, info_span};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unable to install shutdown handler: {0}")]
    Shutdown(String),
}

type SharedJoinSet = Arc<Mutex<JoinSet<()>>>;

pub struct Builder {
    join_set: SharedJoinSet,
    shutdown: Shutdown,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder").finish_non_exhaustive()
    }
}

impl Builder {
    pub fn new() -> Result<Self, TaskError> {
        let shutdown = Shutdown::new().map_err(|err| TaskError::Shutdown(err.to_string()))?;
        Ok(Self {
            join_set: SharedJoinSet::default(),
            shutdown,
        })
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn new_task(&self, name: &'static str) -> Spawner {
        Spawner {
            name,
            join_set: self.join_set.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Waits for every spawned task to finish.
    pub async fn join_all(self) {
        let join_set = match self.join_set.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for result in join_set.join_all().await {
            let () = result;
        }
    }
}

pub struct Spawner {
    name: &'static str,
    join_set: SharedJoinSet,
    shutdown: Shutdown,
}

impl Spawner {
    pub fn spawn<F>(self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let span = info_span!("task", name);
        match self.join_set.lock() {
            Ok(mut join_set) => {
                debug!(task = name, "Spawning task");
                join_set.spawn(task.instrument(span));
            }
            Err(_) => error!(task = name, "Failed to spawn task, join set poisoned"),
        }
    }

    /// Runs `task` once the process receives a shutdown signal.
    pub fn spawn_on_shutdown<F>(self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            let () = shutdown.handle().await;
            task.await;
        });
    }

    /// Runs `task` until it completes or the process receives a shutdown signal.
    pub fn spawn_until_shutdown<F>(self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.spawn(async move {
            tokio::select! {
                () = task => {},
                () = shutdown.handle() => {},
            }
        });
    }
}
