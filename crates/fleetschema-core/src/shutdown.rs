//! Shutdown signalling over `tokio::sync::watch`.
//!
//! Long-running loops and retry waits take a `watch::Receiver<bool>`; the
//! owner flips it to `true` to cancel. A receiver whose sender has been
//! dropped never fires, so a dropped handle cannot masquerade as a
//! cancellation request.

use tokio::sync::watch;

/// Whether shutdown has already been requested.
pub fn is_shutdown(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Resolve once shutdown is requested.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A receiver that is never signalled.
pub fn never() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}
