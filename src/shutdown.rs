// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state across the application
#[derive(Clone)]
pub struct ShutdownState {
    /// Flag indicating shutdown has been requested
    shutdown_requested: Arc<AtomicBool>,
    /// Wakes async waiters when shutdown is requested
    notify: Arc<Notify>,
}

impl ShutdownState {
    /// Create a new shutdown state
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a shutdown
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            log::info!("Shutdown requested");
        }
        self.notify.notify_waiters();
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Clear the flag so the state can be reused by a restarted server
    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a server teardown
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Number of socket clients that were disconnected
    pub connections_closed: usize,
    /// Whether a file watcher was stopped
    pub watcher_stopped: bool,
    /// Whether a spawned HMR dev server was terminated
    pub hmr_stopped: bool,
    /// Any errors encountered during teardown
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if teardown was clean (no errors)
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log the outcome of the teardown
    pub fn log(&self) {
        log::info!(
            "Shutdown complete: {} connections closed, watcher stopped: {}, HMR stopped: {}",
            self.connections_closed,
            self.watcher_stopped,
            self.hmr_stopped
        );
        for error in &self.errors {
            log::warn!("Cleanup error: {}", error);
        }
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("Received SIGTERM"),
                SIGHUP => log::info!("Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::debug!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::debug!("Signal handler registered (Ctrl+C)");
    Ok(())
}
