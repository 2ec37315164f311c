//! Orchestrates application startup and component lifecycle: configuration,
//! the durable queue, attachment storage, webhook routing/dispatch, the
//! SMTP listener, the health endpoint, and graceful shutdown.

pub mod config;
pub mod domain;
pub mod error;
pub mod health;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod shutdown;
pub mod smtp;
pub mod storage;
pub mod webhook;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::select;
use tokio_util::sync::CancellationToken;

use config::Config;
use health::AppState;
use queue::FileQueue;
use scheduler::Scheduler;
use storage::AttachmentStore;
use webhook::{Dispatcher, WebhookRouter};

/// Runs the application until a fatal error occurs or a shutdown signal is
/// handled to completion. Only returns `Err` for unrecoverable startup
/// failures or an essential server task exiting unexpectedly.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} inbound-SMTP-to-webhook relay",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(Config::from_env().context("loading configuration")?);

    let queue = Arc::new(FileQueue::open(&config.durable_queue_path).context("opening durable queue")?);
    let store = Arc::new(AttachmentStore::new(config.clone()).await);
    let router = Arc::new(WebhookRouter::new(
        config.webhook_rules_raw.as_deref(),
        config.webhook_url.clone(),
        config.allow_insecure_http,
    ));
    let scheduler = Arc::new(Scheduler::new());
    let dispatcher = Dispatcher::spawn(config.clone(), queue.clone(), router, scheduler.clone());

    store.spawn_background_tasks(config.clone(), scheduler.clone()).await;

    replay_pending_tasks(&queue, &dispatcher);

    let smtp_server = Arc::new(
        smtp::Server::new(config.clone(), queue.clone(), store.clone(), dispatcher.clone())
            .context("initializing SMTP server")?,
    );
    let listener_token = CancellationToken::new();

    let health_state = AppState {
        queue: queue.clone(),
        dispatcher: dispatcher.clone(),
    };

    let mut smtp_handle = Some({
        let smtp_server = smtp_server.clone();
        let token = listener_token.clone();
        tokio::spawn(async move { smtp_server.run(token).await })
    });

    let mut health_handle = Some({
        let config = config.clone();
        tokio::spawn(async move { health::run_health_server(config, health_state).await })
    });

    let mut shutdown_handle = {
        let token = listener_token.clone();
        let dispatcher = dispatcher.clone();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            shutdown::wait_and_drain(token, dispatcher, scheduler).await;
        })
    };

    // A top-level task error is classified before it's allowed to end the
    // process: a recoverable network fault is logged and the loop keeps
    // running without that task (spec §7's "logged and ignored"); anything
    // else closes the listener and drains in-flight deliveries the same way
    // a signal-triggered shutdown would, then returns the error so `main`
    // exits non-zero.
    loop {
        select! {
            res = async { smtp_handle.as_mut().unwrap().await }, if smtp_handle.is_some() => {
                match res {
                    Ok(Ok(())) => {
                        warn!("SMTP listener stopped; treating as a normal shutdown");
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        if error::is_recoverable(error::classify_message(&format!("{e:#}"))) {
                            warn!("SMTP server hit a recoverable network fault, ignoring: {e:#}");
                            smtp_handle = None;
                            continue;
                        }
                        error!("SMTP server failed: {e:#}");
                        listener_token.cancel();
                        shutdown::drain(&dispatcher).await;
                        scheduler.cancel_all();
                        return Err(e);
                    }
                    Err(join_error) => {
                        listener_token.cancel();
                        shutdown::drain(&dispatcher).await;
                        scheduler.cancel_all();
                        return Err(anyhow::anyhow!("SMTP server task failed: {join_error}"));
                    }
                }
            }
            res = async { health_handle.as_mut().unwrap().await }, if health_handle.is_some() => {
                match res {
                    Ok(Ok(())) => {
                        listener_token.cancel();
                        shutdown::drain(&dispatcher).await;
                        scheduler.cancel_all();
                        return Err(anyhow::anyhow!("health check server exited unexpectedly"));
                    }
                    Ok(Err(e)) => {
                        if error::is_recoverable(error::classify_message(&format!("{e:#}"))) {
                            warn!("health check server hit a recoverable network fault, ignoring: {e:#}");
                            health_handle = None;
                            continue;
                        }
                        error!("health check server failed: {e:#}");
                        listener_token.cancel();
                        shutdown::drain(&dispatcher).await;
                        scheduler.cancel_all();
                        return Err(e);
                    }
                    Err(join_error) => {
                        listener_token.cancel();
                        shutdown::drain(&dispatcher).await;
                        scheduler.cancel_all();
                        return Err(anyhow::anyhow!("health check server task failed: {join_error}"));
                    }
                }
            }
            _ = &mut shutdown_handle => {
                info!("shutdown complete");
                return Ok(());
            }
        }
    }
}

/// Re-enqueues every task still on disk from a prior run, in creation order.
fn replay_pending_tasks(queue: &Arc<FileQueue>, dispatcher: &Arc<Dispatcher>) {
    match queue.list_tasks() {
        Ok(tasks) if tasks.is_empty() => {}
        Ok(tasks) => {
            info!("replaying {} pending task(s) from the durable queue", tasks.len());
            for task in tasks {
                dispatcher.enqueue(task.id);
            }
        }
        Err(e) => warn!("failed to list pending tasks for replay: {e:#}"),
    }
}
