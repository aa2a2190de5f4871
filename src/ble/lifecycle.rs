//! Tracking of open links and their handler tasks for graceful teardown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;

use super::peripheral::{Link, LinkHandle};
use crate::shutdown::{Shutdown, ShutdownSignal};

type LinkMap = Arc<Mutex<HashMap<LinkHandle, Arc<dyn Link>>>>;

/// The set of currently open links and the tasks serving them.
#[derive(Default)]
pub struct ConnectionSet {
    links: LinkMap,
    tasks: JoinSet<LinkHandle>,
    cancel: Shutdown,
}

impl ConnectionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of handler tasks that have not been reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no handler tasks are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Returns the handles of links still registered as open.
    #[must_use]
    pub fn open_links(&self) -> Vec<LinkHandle> {
        let mut handles: Vec<_> = lock(&self.links).keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Returns the signal handlers should watch for cancellation.
    ///
    /// It fires during [`Self::shutdown`], after every link has been
    /// disconnected.
    #[must_use]
    pub fn cancel_signal(&self) -> ShutdownSignal {
        self.cancel.signal()
    }

    /// Registers `link` and spawns `handler` to serve it.
    ///
    /// The link is forgotten once the handler returns.
    pub fn spawn<F>(&mut self, handle: LinkHandle, link: Arc<dyn Link>, handler: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.links).insert(handle, link);
        let links = Arc::clone(&self.links);
        self.tasks.spawn(async move {
            handler.await;
            lock(&links).remove(&handle);
            handle
        });
    }

    /// Collects handler tasks that have already finished.
    ///
    /// Returns the number of tasks collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.tasks.try_join_next() {
            log_join(result);
            reaped += 1;
        }
        reaped
    }

    /// Waits for the next handler task to finish.
    ///
    /// Returns `None` immediately if there are no tasks.
    pub async fn join_next(&mut self) -> Option<LinkHandle> {
        let result = self.tasks.join_next().await?;
        log_join(result)
    }

    /// Tears down every open link.
    ///
    /// Each link is actively disconnected, waiting at most
    /// `disconnect_timeout` per link. Handlers are then cancelled through
    /// [`Self::cancel_signal`] and get `shutdown_timeout` to finish before
    /// being aborted. Links whose handler already exited are skipped.
    /// Calling this again is a no-op.
    pub async fn shutdown(&mut self, disconnect_timeout: Duration, shutdown_timeout: Duration) {
        let links: Vec<_> = lock(&self.links).drain().collect();

        for (handle, link) in links {
            match timeout(disconnect_timeout, link.disconnect()).await {
                Ok(Ok(())) => tracing::debug!(link = %handle, "Link disconnected"),
                Ok(Err(e)) => {
                    tracing::debug!(link = %handle, error = %e, "Link already gone");
                }
                Err(_) => tracing::warn!(link = %handle, "Timed out disconnecting link"),
            }
        }

        self.cancel.trigger();

        let drained = timeout(shutdown_timeout, async {
            while let Some(result) = self.tasks.join_next().await {
                log_join(result);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Connection handlers did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
        }
    }
}

fn lock(links: &LinkMap) -> std::sync::MutexGuard<'_, HashMap<LinkHandle, Arc<dyn Link>>> {
    links.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_join(result: Result<LinkHandle, tokio::task::JoinError>) -> Option<LinkHandle> {
    match result {
        Ok(handle) => {
            tracing::debug!(link = %handle, "Connection handler finished");
            Some(handle)
        }
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            tracing::error!(error = %e, "Connection handler panicked");
            None
        }
    }
}
