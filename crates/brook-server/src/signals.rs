//! Process signals.
//!
//! SIGINT and SIGTERM ask the reactor to shut down, so `run` returns and the
//! binary saves the session store before exiting. The wait runs on its own
//! thread with a current-thread tokio runtime.

use std::future::Future;
use std::io;
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::server::ServerHandle;

/// Shut the server down once `signal` resolves.
pub fn shutdown_on<F>(handle: ServerHandle, signal: F) -> io::Result<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;
    thread::Builder::new()
        .name("brook-signals".into())
        .spawn(move || {
            runtime.block_on(signal);
            info!("Shutdown requested");
            if let Err(e) = handle.shutdown() {
                warn!("Could not wake the server for shutdown: {}", e);
            }
        })
}

/// Shut the server down on SIGINT or SIGTERM.
pub fn shutdown_on_signal(handle: ServerHandle) -> io::Result<JoinHandle<()>> {
    shutdown_on(handle, termination())
}

/// Resolves on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not wait for SIGINT: {}", e);
            }
            return;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Could not wait for SIGINT: {}", e);
            }
        }
        _ = terminate.recv() => {}
    }
}

/// Resolves on Ctrl-C.
#[cfg(not(unix))]
pub async fn termination() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not wait for Ctrl-C: {}", e);
    }
}
