//! Signal handling for shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM both end the probe loop wherever it is,
//! including mid-attempt; the process then exits cleanly with status 0.

/// Which signal asked us to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    #[cfg_attr(not(unix), allow(dead_code))]
    Terminate,
}

/// Resolve when the process is asked to shut down.
#[cfg(unix)]
pub async fn shutdown_signal() -> Shutdown {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => Shutdown::Interrupt,
                _ = sigterm.recv() => Shutdown::Terminate,
            }
        }
        Err(err) => {
            tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
            wait_ctrl_c(ctrl_c).await
        }
    }
}

/// Resolve when the process is asked to shut down.
#[cfg(not(unix))]
pub async fn shutdown_signal() -> Shutdown {
    wait_ctrl_c(tokio::signal::ctrl_c()).await
}

async fn wait_ctrl_c(ctrl_c: impl std::future::Future<Output = std::io::Result<()>>) -> Shutdown {
    if let Err(err) = ctrl_c.await {
        tracing::error!(%err, "ctrl-c signal handler failed");
        // Without a working handler there is nothing left to wait for.
        std::future::pending::<()>().await;
    }
    Shutdown::Interrupt
}
