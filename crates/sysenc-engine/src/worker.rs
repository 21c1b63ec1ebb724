//! Dedicated worker thread with cooperative cancellation.

use std::thread::JoinHandle;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use sysenc_core::{SysencError, SysencResult};

pub struct Worker<T> {
    name: String,
    handle: JoinHandle<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Worker<T> {
    /// Run `job` on a new thread. The job receives the token that
    /// [`Worker::cancel`] trips.
    pub fn spawn<F>(name: &str, job: F) -> SysencResult<Self>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || job(token))
            .map_err(|e| SysencError::ResourceExhausted(format!("spawning {name} thread: {e}")))?;
        tracing::debug!(worker = name, "worker started");
        Ok(Self {
            name: name.to_string(),
            handle,
            cancel,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the job to return.
    pub fn join(self) -> SysencResult<T> {
        self.handle
            .join()
            .map_err(|_| SysencError::Other(anyhow!("{} worker panicked", self.name)))
    }
}
