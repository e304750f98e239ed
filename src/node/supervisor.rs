//! Task supervision under one cancellation scope
//!
//! Tasks are spawned into a [`JoinSet`]. The first one to fail cancels the
//! shared token; tasks registered with [`Supervisor::spawn_on_cancel`] only
//! start once the token is cancelled, which is where cleanup goes.
//! [`Supervisor::wait`] returns after every task has finished.

use crate::common::{Error, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
}

impl Supervisor {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            if let Err(e) = &result {
                tracing::error!(task = name, error = %e, "task failed, cancelling all tasks");
                shutdown.cancel();
            }
            (name, result)
        });
    }

    /// Run `task` once the scope has been cancelled.
    pub fn spawn_on_cancel<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.spawn(name, async move {
            shutdown.cancelled().await;
            task.await
        });
    }

    /// Wait for every task; returns the first error observed.
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.shutdown.cancel();
                    ("unknown", Err(Error::Internal(format!("task panicked: {}", e))))
                }
            };
            match result {
                Ok(()) => tracing::debug!(task = name, "task finished"),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
