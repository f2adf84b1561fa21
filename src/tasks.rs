//! Background tasks owned by one component, cancelled and awaited together.

use crate::Result;
use std::future::Future;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct TaskGroup {
    handle: Handle,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TaskGroup {
    /// Bind to the runtime of the calling context.
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            handle: Handle::try_current()?,
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn_on(task, &self.handle);
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and block until all of them have returned.
    ///
    /// Safe outside a runtime, on blocking threads and on multi-thread
    /// workers. A current-thread runtime cannot be blocked, so there the
    /// tasks are only cancelled.
    pub(crate) fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();

        if self.tracker.is_empty() {
            return;
        }

        let blockable = Handle::try_current()
            .map(|current| current.runtime_flavor() != RuntimeFlavor::CurrentThread)
            .unwrap_or(true);

        if blockable {
            tokio::task::block_in_place(|| self.handle.block_on(self.tracker.wait()));
        } else {
            debug!("current-thread runtime, not waiting for {} tasks", self.tracker.len());
        }
    }
}
