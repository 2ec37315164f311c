//! Graceful shutdown coordination: stop accepting new SMTP connections, let
//! the dispatcher drain whatever is already pending, and force-exit past a
//! grace period rather than hang on a stuck delivery.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;
use crate::webhook::Dispatcher;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

/// Waits for SIGTERM/SIGINT, signals the SMTP listener to stop accepting via
/// `listener_token`, then polls `dispatcher.pending_count()` until it drains
/// to zero (or `FORCE_EXIT_AFTER` elapses), and finally cancels every
/// scheduler timer so the process can exit cleanly.
pub async fn wait_and_drain(
    listener_token: CancellationToken,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
) {
    wait_for_signal().await;
    info!("shutdown signal received: closing SMTP listener and draining pending deliveries");
    listener_token.cancel();
    drain(&dispatcher).await;
    scheduler.cancel_all();
}

/// Polls `dispatcher.pending_count()` until it reaches zero or
/// `FORCE_EXIT_AFTER` elapses. Callers are responsible for closing the SMTP
/// listener first; shared by the signal-triggered path above and by a
/// non-recoverable top-level error in `run()`, so both paths drain the same
/// way before the process exits.
pub async fn drain(dispatcher: &Arc<Dispatcher>) {
    let deadline = tokio::time::Instant::now() + FORCE_EXIT_AFTER;
    let mut ticker = interval(POLL_INTERVAL);

    loop {
        let pending = dispatcher.pending_count();
        if pending == 0 {
            info!("dispatcher drained, shutting down");
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("forcing shutdown after {:?} with {pending} deliveries still pending", FORCE_EXIT_AFTER);
            break;
        }
        ticker.tick().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
