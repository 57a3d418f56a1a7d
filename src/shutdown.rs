//! Graceful Shutdown Handling
//!
//! Turns SIGTERM, SIGINT and Ctrl+C into a stop flag for the readiness loop.
//! Signals are awaited on a helper thread running a small tokio runtime; when
//! one arrives the flag is set and the loop's poll is woken up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::Waker;
use tokio::signal;
use tracing::{debug, info, warn};

use crate::Result;

/// Shares the stop request between the signal thread and the loop
#[derive(Clone)]
pub struct ShutdownCoordinator {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownCoordinator {
    /// Create a coordinator that wakes the poll owning `waker`
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Flag the loop checks between iterations
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request a stop and interrupt the current poll
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake the connection loop: {}", e);
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then request a stop
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Listen for signals on a dedicated thread
    pub fn spawn_signal_listener(&self) -> Result<JoinHandle<()>> {
        let coordinator = self.clone();
        let handle = std::thread::Builder::new()
            .name("sockmux-signals".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        warn!("Unable to start signal runtime: {}", e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(coordinator.listen_for_signals()) {
                    warn!("Error setting up signal handlers: {}", e);
                }
                debug!("Signal listener finished");
            })?;
        Ok(handle)
    }
}
