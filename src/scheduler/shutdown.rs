//! Process-wide shutdown latch.

use tokio_util::sync::CancellationToken;

/// One-way shutdown signal shared by the scheduler loop and every job.
///
/// Cloning yields another handle to the same latch. Once signaled it stays
/// signaled for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Idempotent.
    pub fn signal(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the latch is set.
    pub async fn signaled(&self) {
        self.token.cancelled().await
    }
}

/// Resolve on SIGINT or SIGTERM, then set the latch.
pub async fn wait_for_signal(shutdown: ShutdownCoordinator) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = shutdown.signaled() => return,
    }

    shutdown.signal();
}
