//! Bounded worker pool that drains task ids, routes each task's email
//! through the [`WebhookRouter`](super::router::WebhookRouter), and POSTs
//! signed JSON payloads with in-worker retry and deferred re-enqueue on
//! exhaustion.
//!
//! The HTTP client setup (hyper + hyper-rustls, native roots, HTTP/1.1) is
//! carried over unchanged from the single-target webhook client this
//! dispatcher replaces; what's new is the per-target fan-out, signing, and
//! retry bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::model::{now_millis, Task};
use crate::queue::FileQueue;
use crate::scheduler::Scheduler;
use crate::webhook::router::{RouteTarget, WebhookRouter};
use crate::webhook::signing;

const MAX_RETRIES: u32 = 3;

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type DispatchHttpClient = Client<HttpsConn, Full<Bytes>>;

struct DeliveryOutcome {
    target: RouteTarget,
    success: bool,
    status: Option<u16>,
    error: Option<String>,
}

/// Drives webhook delivery for every enqueued task id.
pub struct Dispatcher {
    config: Arc<Config>,
    queue: Arc<FileQueue>,
    router: Arc<WebhookRouter>,
    scheduler: Arc<Scheduler>,
    client: DispatchHttpClient,
    user_agent: String,
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<AtomicUsize>,
}

impl Dispatcher {
    /// Builds the dispatcher and spawns `config.webhook_concurrency` worker
    /// tasks pulling from a shared queue of task ids.
    pub fn spawn(
        config: Arc<Config>,
        queue: Arc<FileQueue>,
        router: Arc<WebhookRouter>,
        scheduler: Arc<Scheduler>,
    ) -> Arc<Dispatcher> {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("failed to load native root certificates for hyper-rustls")
            .https_or_http()
            .enable_http1()
            .build();
        let client: DispatchHttpClient = Client::builder(TokioExecutor::new()).build(https);
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));

        let dispatcher = Arc::new(Dispatcher {
            config,
            queue,
            router,
            scheduler,
            client,
            user_agent,
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        });

        for worker_id in 0..dispatcher.config.webhook_concurrency.max(1) {
            let dispatcher = dispatcher.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let id = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match id {
                        Some(id) => dispatcher.process(worker_id, id).await,
                        None => break,
                    }
                }
            });
        }

        dispatcher
    }

    /// Pushes a task id for delivery, incrementing the pending count. Used
    /// both for fresh tasks and for startup replay.
    pub fn enqueue(&self, id: String) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(id);
    }

    /// Current number of tasks either in-flight or awaiting a worker slot,
    /// used by the health endpoint and the shutdown poll loop.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn process(&self, worker_id: usize, id: String) {
        let task = match self.queue.get(&id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                // Already removed by a prior attempt; nothing to do.
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                error!("worker {worker_id}: failed to load task {id}: {e:#}");
                self.pending.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };

        self.deliver(task).await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    async fn deliver(&self, mut task: Task) {
        let mut targets = self.router.route(&task.parsed);

        if targets.is_empty() {
            warn!(
                "task {} routed to zero targets; leaving in durable queue for operator action",
                task.id
            );
            return;
        }

        if let Some(restrict_to) = &task.failed_webhooks {
            let restrict: std::collections::HashSet<&str> =
                restrict_to.iter().map(|s| s.as_str()).collect();
            targets.retain(|t| restrict.contains(t.webhook.as_str()));
            if targets.is_empty() {
                info!(
                    "task {}: retry restriction eliminated all targets, dropping",
                    task.id
                );
                if let Err(e) = self.queue.remove(&task.id) {
                    error!("failed to remove exhausted task {}: {e:#}", task.id);
                }
                return;
            }
        }

        let email_json = match serde_json::to_value(&task.parsed) {
            Ok(v) => v,
            Err(e) => {
                error!("task {}: failed to serialize parsed email: {e:#}", task.id);
                return;
            }
        };

        let mut remaining = targets;
        let mut last_error: Option<String> = None;
        let mut attempts_used: u32 = 0;

        for attempt in 1..=MAX_RETRIES {
            attempts_used = attempt;
            let outcomes = self.attempt_batch(&email_json, &remaining).await;

            let mut still_failing = Vec::new();
            for outcome in outcomes {
                if !outcome.success {
                    if let Some(status) = outcome.status {
                        last_error = Some(format!("{} responded {}", outcome.target.webhook, status));
                    } else if let Some(err) = &outcome.error {
                        last_error = Some(format!("{}: {}", outcome.target.webhook, err));
                    }
                    still_failing.push(outcome.target);
                }
            }

            remaining = still_failing;
            if remaining.is_empty() {
                break;
            }
            if attempt < MAX_RETRIES {
                let backoff = Duration::from_secs(1) * 2u32.pow(attempt - 1);
                tokio::time::sleep(backoff.min(Duration::from_secs(10))).await;
            }
        }

        if remaining.is_empty() {
            if let Err(e) = self.queue.remove(&task.id) {
                error!("failed to remove completed task {}: {e:#}", task.id);
            }
            return;
        }

        task.failed_webhooks = Some(remaining.iter().map(|t| t.webhook.clone()).collect());
        task.last_error = last_error;
        task.attempts += attempts_used;
        task.updated_at = Some(chrono::Utc::now());

        if let Err(e) = self.queue.put(&task) {
            error!("failed to persist retry state for task {}: {e:#}", task.id);
            return;
        }

        let id = task.id.clone();
        let delay = self.config.webhook_retry_delay;
        let dispatcher = self.self_handle();
        self.scheduler.after(delay, move || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.enqueue(id);
            }
        });
    }

    async fn attempt_batch(&self, email_json: &Value, targets: &[RouteTarget]) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push(self.post_one(email_json, target).await);
        }
        outcomes
    }

    async fn post_one(&self, email_json: &Value, target: &RouteTarget) -> DeliveryOutcome {
        let payload = build_payload(email_json, target);
        let body_bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                return DeliveryOutcome {
                    target: target.clone(),
                    success: false,
                    status: None,
                    error: Some(format!("serialization failed: {e}")),
                }
            }
        };

        let mut builder = Request::builder()
            .method(hyper::Method::POST)
            .uri(&target.webhook)
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent);

        if let Some(secret) = &self.config.webhook_secret {
            let timestamp = now_millis();
            let signed_message = format!("{timestamp}.{}", String::from_utf8_lossy(&body_bytes));
            let signature = signing::sign(secret, signed_message.as_bytes());
            builder = builder
                .header("X-Inbound-Email-Timestamp", timestamp.to_string())
                .header("X-Inbound-Email-Signature", signature)
                .header("X-Inbound-Email-Signature-Version", "v1");
        }

        let request = match builder.body(Full::new(Bytes::from(body_bytes))) {
            Ok(r) => r,
            Err(e) => {
                return DeliveryOutcome {
                    target: target.clone(),
                    success: false,
                    status: None,
                    error: Some(format!("invalid request: {e}")),
                }
            }
        };

        let send = self.client.request(request);
        let outcome = match tokio::time::timeout(self.config.webhook_timeout, send).await {
            Ok(Ok(response)) => {
                let status = response.status();
                let _ = response.into_body().collect().await;
                DeliveryOutcome {
                    target: target.clone(),
                    success: status.is_success(),
                    status: Some(status.as_u16()),
                    error: None,
                }
            }
            Ok(Err(e)) => DeliveryOutcome {
                target: target.clone(),
                success: false,
                status: None,
                error: Some(e.to_string()),
            },
            Err(_) => DeliveryOutcome {
                target: target.clone(),
                success: false,
                status: None,
                error: Some("request timed out".to_string()),
            },
        };

        outcome
    }

    /// A cheap clone handle used to move `self` into a scheduler closure
    /// without threading an `Arc<Dispatcher>` through every call site.
    fn self_handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }
}

/// The minimal state a deferred re-enqueue closure needs: enough to push an
/// id back onto the work channel and bump the pending count, without
/// capturing the full `Dispatcher` (and its HTTP client) into every timer.
#[derive(Clone)]
struct DispatcherHandle {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<AtomicUsize>,
}

impl DispatcherHandle {
    fn enqueue(&self, id: String) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(id);
    }
}

/// Merges `_webhookMeta` into the parsed-email JSON for one target,
/// matching the outbound payload schema in the external interfaces section.
fn build_payload(email_json: &Value, target: &RouteTarget) -> Value {
    let mut payload = email_json.clone();
    let meta = serde_json::json!({
        "webhook": target.webhook,
        "ruleName": target.rule_name,
        "priority": target.priority,
    });
    if let Value::Object(map) = &mut payload {
        map.insert("_webhookMeta".to_string(), meta);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::router::DEFAULT_TARGET_PRIORITY;

    #[test]
    fn build_payload_merges_webhook_meta() {
        let email = serde_json::json!({"subject": "hi"});
        let target = RouteTarget {
            webhook: "https://d".to_string(),
            rule_name: "default".to_string(),
            priority: DEFAULT_TARGET_PRIORITY,
        };
        let merged = build_payload(&email, &target);
        assert_eq!(merged["_webhookMeta"]["ruleName"], "default");
        assert_eq!(merged["_webhookMeta"]["priority"], DEFAULT_TARGET_PRIORITY);
        assert_eq!(merged["subject"], "hi");
    }
}
