//! Background task coordination.
//!
//! A [`Lifecycle`] owns one cancellation signal shared by every background
//! task and a join barrier over those tasks. [`Lifecycle::shutdown`] raises
//! the signal and returns only once every registered task has finished.

use std::future::Future;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error};

pub struct Lifecycle {
    cancel: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

/// Receiving end of the cancellation signal.
#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolves once shutdown has been requested, or the coordinator is gone.
    pub async fn cancelled(&mut self) {
        let _ = self.0.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel,
            tasks: JoinSet::new(),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.cancel.subscribe())
    }

    /// Registers `task` with the barrier and starts it.
    pub fn spawn<F>(&mut self, name: &'static str, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "background task registered");
        self.tasks.spawn(async move {
            task.await;
            debug!(task = name, "background task finished");
        })
    }

    /// Tasks registered and not yet finished.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Raises the cancellation signal and waits for every task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.send_replace(true);
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("background task aborted"),
                Err(e) => error!(error = %e, "background task panicked"),
            }
        }
    }
}
