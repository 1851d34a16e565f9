//! Graceful shutdown signal handling.
//!
//! Listens for OS termination signals (SIGINT, SIGTERM) and produces
//! a future that resolves when the server should begin shutting down.
//! Designed to be passed to `axum::serve().with_graceful_shutdown()`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Returns a future that resolves when an OS shutdown signal is received.
///
/// On Unix, listens for both SIGINT (Ctrl+C) and SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

/// Waits for `signal`, then stops admitting requests by clearing `accepting`.
pub async fn drain_on<F>(signal: F, accepting: Arc<AtomicBool>)
where
    F: Future<Output = ()>,
{
    signal.await;
    accepting.store(false, Ordering::SeqCst);
}

/// [`drain_on`] driven by OS signals.
pub async fn shutdown_signal(accepting: Arc<AtomicBool>) {
    drain_on(wait_for_signal(), accepting).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `axum::serve(..).with_graceful_shutdown()` needs a `Send` future.
    #[test]
    fn shutdown_signal_is_send_future() {
        fn assert_send_future<T: Future<Output = ()> + Send>(_f: T) {}

        assert_send_future(shutdown_signal(Arc::new(AtomicBool::new(true))));
    }

    #[tokio::test]
    async fn no_signal_means_still_accepting() {
        let accepting = Arc::new(AtomicBool::new(true));
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), async {
            tokio::select! {
                () = shutdown_signal(accepting.clone()) => "shutdown",
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => "timeout",
            }
        })
        .await;

        assert_eq!(result.expect("outer timeout should not fire"), "timeout");
        assert!(accepting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn signal_stops_accepting() {
        let accepting = Arc::new(AtomicBool::new(true));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let drain = tokio::spawn(drain_on(
            async move {
                let _ = rx.await;
            },
            accepting.clone(),
        ));
        assert!(accepting.load(Ordering::SeqCst));
        tx.send(()).unwrap();
        drain.await.unwrap();
        assert!(!accepting.load(Ordering::SeqCst));
    }
}
