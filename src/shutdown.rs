//! Shutdown signal helpers
//!
//! The process-wide cancellation signal is a `watch` channel carrying `true`
//! once shutdown has been requested.

use tokio::sync::watch;

pub fn is_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Resolves once shutdown is requested
///
/// A dropped sender means nobody can request shutdown any more, so this
/// future then never resolves.
pub async fn requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
