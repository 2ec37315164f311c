//! End-to-end coverage driving the real SMTP listener over raw TCP, with a
//! minimal local HTTP listener standing in for the webhook receiver.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use mailhook::config::Config;
use mailhook::queue::FileQueue;
use mailhook::scheduler::Scheduler;
use mailhook::smtp::Server;
use mailhook::storage::AttachmentStore;
use mailhook::webhook::{Dispatcher, WebhookRouter};

// Environment variables are process-global; every test in this binary that
// calls `Config::from_env` must serialize on this lock so runs don't stomp
// on each other under the default multi-threaded test runner.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const MANAGED_VARS: &[&str] = &[
    "DURABLE_QUEUE_PATH",
    "LOCAL_STORAGE_PATH",
    "ALLOW_INSECURE_WEBHOOK_HTTP",
    "PORT",
    "WEBHOOK_URL",
    "WEBHOOK_RULES",
    "ALLOWED_SENDER_DOMAINS",
    "REQUIRED_AUTH_RESULTS",
    "TRUSTED_RELAY_IPS",
    "SMTP_RATE_LIMIT_MAX_CONNECTIONS",
];

fn clear_env() {
    for var in MANAGED_VARS {
        std::env::remove_var(var);
    }
}

/// A minimal HTTP/1.1 receiver that accepts any request, records its parsed
/// JSON body, and replies `200 OK`.
struct MockWebhook {
    addr: SocketAddr,
    received: Arc<tokio::sync::Mutex<Vec<Value>>>,
}

impl MockWebhook {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_for_task = received.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let received = received_for_task.clone();
                tokio::spawn(async move {
                    let _ = handle_one_request(stream, received).await;
                });
            }
        });

        MockWebhook { addr, received }
    }

    fn url(&self) -> String {
        format!("http://{}/webhook", self.addr)
    }

    async fn received(&self) -> Vec<Value> {
        self.received.lock().await.clone()
    }
}

async fn handle_one_request(stream: TcpStream, received: Arc<tokio::sync::Mutex<Vec<Value>>>) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" {
            break;
        }
        if let Some(rest) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = rest.trim().parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body).await?;
    }
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        received.lock().await.push(value);
    }
    let response = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    reader.into_inner().write_all(response).await?;
    Ok(())
}

/// A thin raw-TCP SMTP client for driving the listener in tests.
struct SmtpClient {
    reader: BufReader<TcpStream>,
}

impl SmtpClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        SmtpClient { reader: BufReader::new(stream) }
    }

    async fn read_reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    async fn send(&mut self, line: &str) {
        self.reader.get_mut().write_all(line.as_bytes()).await.unwrap();
        self.reader.get_mut().write_all(b"\r\n").await.unwrap();
    }

    async fn command(&mut self, line: &str) -> String {
        self.send(line).await;
        self.read_reply().await
    }

    async fn send_data(&mut self, body: &str) -> String {
        self.command("DATA").await;
        self.reader.get_mut().write_all(body.as_bytes()).await.unwrap();
        if !body.ends_with("\r\n") {
            self.reader.get_mut().write_all(b"\r\n").await.unwrap();
        }
        self.reader.get_mut().write_all(b".\r\n").await.unwrap();
        self.read_reply().await
    }
}

/// Everything one test needs to drive a fresh, isolated stack. Holds the
/// `ENV_LOCK` guard for its lifetime so configuration stays stable for as
/// long as the stack is running.
struct TestStack {
    addr: SocketAddr,
    token: CancellationToken,
    queue: Arc<FileQueue>,
    dispatcher: Arc<Dispatcher>,
    _queue_dir: tempfile::TempDir,
    _storage_dir: tempfile::TempDir,
    _env_guard: MutexGuard<'static, ()>,
}

impl TestStack {
    async fn start(configure: impl FnOnce()) -> Self {
        let env_guard = ENV_LOCK.lock().unwrap_or_else(|poison| poison.into_inner());
        clear_env();

        let queue_dir = tempfile::tempdir().unwrap();
        let storage_dir = tempfile::tempdir().unwrap();

        std::env::set_var("DURABLE_QUEUE_PATH", queue_dir.path().to_str().unwrap());
        std::env::set_var("LOCAL_STORAGE_PATH", storage_dir.path().to_str().unwrap());
        std::env::set_var("ALLOW_INSECURE_WEBHOOK_HTTP", "true");
        std::env::set_var("PORT", "0");
        configure();
        let config = Arc::new(Config::from_env().unwrap());

        let queue = Arc::new(FileQueue::open(&config.durable_queue_path).unwrap());
        let store = Arc::new(AttachmentStore::new(config.clone()).await);
        let router = Arc::new(WebhookRouter::new(
            config.webhook_rules_raw.as_deref(),
            config.webhook_url.clone(),
            config.allow_insecure_http,
        ));
        let scheduler = Arc::new(Scheduler::new());
        let dispatcher = Dispatcher::spawn(config.clone(), queue.clone(), router, scheduler.clone());

        let server = Arc::new(Server::new(config, queue.clone(), store, dispatcher.clone()).unwrap());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let serve_token = token.clone();
        tokio::spawn(async move {
            let _ = server.serve(listener, serve_token).await;
        });

        // Give the accept loop a moment to start polling.
        tokio::time::sleep(Duration::from_millis(20)).await;

        TestStack {
            addr,
            token,
            queue,
            dispatcher,
            _queue_dir: queue_dir,
            _storage_dir: storage_dir,
            _env_guard: env_guard,
        }
    }
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.token.cancel();
        clear_env();
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn delivers_to_the_default_webhook_when_no_rules_match() {
    let webhook = MockWebhook::start().await;
    let webhook_url = webhook.url();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_URL", &webhook_url);
    })
    .await;

    let mut client = SmtpClient::connect(stack.addr).await;
    assert!(client.read_reply().await.starts_with("220"));
    assert_eq!(client.command("EHLO client.test").await, "250 mailhook greets you");
    assert_eq!(client.command("MAIL FROM:<alice@example.com>").await, "250 OK");
    assert_eq!(client.command("RCPT TO:<bob@example.com>").await, "250 OK");
    let body = "From: alice@example.com\r\nTo: bob@example.com\r\nSubject: hello\r\nContent-Type: text/plain\r\n\r\nhi there\r\n";
    let reply = client.send_data(body).await;
    assert!(reply.starts_with("250"));

    assert!(wait_until(|| stack.queue.list_ids().unwrap().is_empty(), Duration::from_secs(5)).await);
    let received = webhook.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["subject"], "hello");
    assert_eq!(received[0]["_webhookMeta"]["ruleName"], "default");
}

#[tokio::test]
async fn fans_out_to_every_matching_rule_and_stops_at_stop_processing() {
    let first = MockWebhook::start().await;
    let second = MockWebhook::start().await;
    let never_reached = MockWebhook::start().await;

    let rules = serde_json::json!([
        {"name": "urgent", "conditions": {"subject": "*urgent*"}, "webhook": first.url(), "priority": 1},
        {"name": "also-urgent", "conditions": {"subject": "*urgent*"}, "webhook": second.url(), "priority": 2, "stopProcessing": true},
        {"name": "never", "conditions": {"subject": "*urgent*"}, "webhook": never_reached.url(), "priority": 3},
    ]);
    let rules_raw = rules.to_string();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_RULES", &rules_raw);
    })
    .await;

    let mut client = SmtpClient::connect(stack.addr).await;
    client.read_reply().await;
    client.command("EHLO client.test").await;
    client.command("MAIL FROM:<alice@example.com>").await;
    client.command("RCPT TO:<bob@example.com>").await;
    let body = "From: alice@example.com\r\nTo: bob@example.com\r\nSubject: urgent: act now\r\nContent-Type: text/plain\r\n\r\nhi\r\n";
    let reply = client.send_data(body).await;
    assert!(reply.starts_with("250"));

    assert!(wait_until(|| stack.queue.list_ids().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(first.received().await.len(), 1);
    assert_eq!(second.received().await.len(), 1);
    assert_eq!(never_reached.received().await.len(), 0);
}

#[tokio::test]
async fn replays_pending_tasks_left_on_disk_from_a_prior_run() {
    let webhook = MockWebhook::start().await;
    let webhook_url = webhook.url();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_URL", &webhook_url);
    })
    .await;

    // Simulate a task that was durably queued before a restart, bypassing
    // the SMTP path entirely.
    let task = mailhook::model::Task {
        id: mailhook::model::generate_id(12),
        created_at: chrono::Utc::now(),
        parsed: mailhook::model::ParsedEmail {
            from: mailhook::model::AddressList::single("carol@example.com", None),
            to: mailhook::model::AddressList::single("dave@example.com", None),
            cc: mailhook::model::AddressList::default(),
            subject: "queued before restart".to_string(),
            text: "body".to_string(),
            html: String::new(),
            headers: mailhook::model::HeaderMap::default(),
            attachment_info: Vec::new(),
            skipped_attachments: Vec::new(),
            storage_summary: None,
        },
        failed_webhooks: None,
        attempts: 0,
        last_error: None,
        updated_at: None,
    };
    stack.queue.put(&task).unwrap();

    // Replay, as the startup path does after reopening the queue.
    for pending in stack.queue.list_tasks().unwrap() {
        stack.dispatcher.enqueue(pending.id);
    }

    assert!(wait_until(|| stack.queue.list_ids().unwrap().is_empty(), Duration::from_secs(5)).await);
    let received = webhook.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["subject"], "queued before restart");
}

#[tokio::test]
async fn rejects_the_connection_past_the_configured_rate_limit() {
    let webhook = MockWebhook::start().await;
    let webhook_url = webhook.url();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_URL", &webhook_url);
        std::env::set_var("SMTP_RATE_LIMIT_MAX_CONNECTIONS", "1");
    })
    .await;

    let mut first = SmtpClient::connect(stack.addr).await;
    assert!(first.read_reply().await.starts_with("220"));

    let mut second = SmtpClient::connect(stack.addr).await;
    let reply = second.read_reply().await;
    assert!(reply.starts_with("421"), "expected 421, got {reply}");
}

#[tokio::test]
async fn rejects_mail_from_a_disallowed_sender_domain() {
    let webhook = MockWebhook::start().await;
    let webhook_url = webhook.url();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_URL", &webhook_url);
        std::env::set_var("ALLOWED_SENDER_DOMAINS", "trusted.test");
    })
    .await;

    let mut client = SmtpClient::connect(stack.addr).await;
    client.read_reply().await;
    client.command("EHLO client.test").await;
    let reply = client.command("MAIL FROM:<eve@untrusted.test>").await;
    assert!(reply.starts_with("553"), "expected 553, got {reply}");
}

#[tokio::test]
async fn enforces_required_authentication_results_from_a_trusted_relay() {
    let webhook = MockWebhook::start().await;
    let webhook_url = webhook.url();

    let stack = TestStack::start(|| {
        std::env::set_var("WEBHOOK_URL", &webhook_url);
        std::env::set_var("REQUIRED_AUTH_RESULTS", "spf=pass");
        std::env::set_var("TRUSTED_RELAY_IPS", "127.0.0.1");
    })
    .await;

    let mut client = SmtpClient::connect(stack.addr).await;
    client.read_reply().await;
    client.command("EHLO client.test").await;
    client.command("MAIL FROM:<alice@example.com>").await;
    client.command("RCPT TO:<bob@example.com>").await;

    let missing_auth = "From: alice@example.com\r\nTo: bob@example.com\r\nSubject: no auth\r\n\r\nbody\r\n";
    let reply = client.send_data(missing_auth).await;
    assert!(reply.starts_with("550"), "expected 550, got {reply}");

    client.command("MAIL FROM:<alice@example.com>").await;
    client.command("RCPT TO:<bob@example.com>").await;
    let with_auth = "From: alice@example.com\r\nTo: bob@example.com\r\nSubject: has auth\r\nAuthentication-Results: mx.example.com; spf=pass\r\n\r\nbody\r\n";
    let reply = client.send_data(with_auth).await;
    assert!(reply.starts_with("250"), "expected 250, got {reply}");

    assert!(wait_until(|| stack.queue.list_ids().unwrap().is_empty(), Duration::from_secs(5)).await);
    assert_eq!(webhook.received().await.len(), 1);
}
