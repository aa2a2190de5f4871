//! Cooperative cancellation shared by every transport.
//!
//! A [`Shutdown`] is the trigger side, held by whoever decides the process
//! should stop (the OS signal watcher, a [`crate::ble::BleHandle`]). Each
//! long-running loop holds a [`ShutdownSignal`] and awaits
//! [`ShutdownSignal::cancelled`] at its suspension points.

use std::io;
use std::sync::Arc;

use tokio::sync::watch;

/// The trigger side of a shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates an untriggered shutdown signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests shutdown. Calling this more than once has no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns a new listener for this signal.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// The listening side of a shutdown signal.
///
/// Dropping every [`Shutdown`] counts as cancellation.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Returns `true` if shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Completes once shutdown has been requested. Cancel-safe.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|&stop| stop).await;
    }
}

/// Waits for an OS termination request (SIGINT or SIGTERM).
///
/// Returns the name of the signal received.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
#[cfg(unix)]
pub async fn os_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

/// Waits for an OS termination request (Ctrl+C).
///
/// Returns the name of the signal received.
///
/// # Errors
///
/// Returns an error if the Ctrl+C handler cannot be installed.
#[cfg(windows)]
pub async fn os_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

/// Triggers `shutdown` when the process receives a termination request.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be installed.
pub async fn trigger_on_os_signal(shutdown: Shutdown) -> io::Result<()> {
    let name = os_signal().await?;
    tracing::info!(signal = name, "Received termination signal, initiating graceful shutdown");
    shutdown.trigger();
    Ok(())
}
