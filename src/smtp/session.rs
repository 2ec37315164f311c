//! The admission-policy hook chain: `on_connect` / `on_mail_from` /
//! `on_rcpt_to` / `on_data`, each returning a [`HookOutcome`] the wire layer
//! in [`super`] translates into an SMTP reply. This is the only place that
//! knows about allow-lists, the rate limiter, and the queue-depth/
//! `Authentication-Results` gates on `DATA` — it knows nothing about sockets.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use crate::config::Config;
use crate::domain;
use crate::model::{generate_id, Task};
use crate::queue::FileQueue;
use crate::smtp::rate_limiter::RateLimiter;
use crate::storage::AttachmentStore;
use crate::webhook::Dispatcher;

/// Per-session state, mirroring the design's `Idle -> Connected ->
/// (MailFrom -> RcptTo+ -> Data -> Accepted|Rejected) -> Closed` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    MailFrom,
    RcptTo,
    Data,
    Closed,
}

/// The result of one hook: either the command is accepted (the wire layer
/// replies `250`/`354`/etc. appropriately) or rejected with an explicit
/// SMTP code and message.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Accept,
    Reject(u16, String),
}

impl HookOutcome {
    pub fn is_accept(&self) -> bool {
        matches!(self, HookOutcome::Accept)
    }
}

/// Everything one SMTP session's hooks need: configuration, the shared rate
/// limiter, and the durable-queue/storage/dispatcher handles required to
/// commit a message on `DATA`.
pub struct Session {
    config: Arc<Config>,
    queue: Arc<FileQueue>,
    store: Arc<AttachmentStore>,
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Arc<RateLimiter>,
    state: SessionState,
    remote_ip: String,
    is_trusted_relay: bool,
    sender: Option<String>,
    recipients: Vec<String>,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<FileQueue>,
        store: Arc<AttachmentStore>,
        dispatcher: Arc<Dispatcher>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Session {
            config,
            queue,
            store,
            dispatcher,
            rate_limiter,
            state: SessionState::Idle,
            remote_ip: String::new(),
            is_trusted_relay: false,
            sender: None,
            recipients: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `on connect`: normalizes the remote IP, checks the client allow-list
    /// and trusted-relay requirement, and applies the sliding-window rate
    /// limiter.
    pub fn on_connect(&mut self, remote_ip: &str) -> HookOutcome {
        let normalized = domain::normalize_remote_ip(remote_ip);
        self.remote_ip = normalized.clone();
        self.is_trusted_relay = domain::ip_allowed(&normalized, &self.config.trusted_relay_ips)
            && !self.config.trusted_relay_ips.is_empty();

        if !domain::ip_allowed(&normalized, &self.config.allowed_smtp_clients) {
            return HookOutcome::Reject(550, "Access denied".to_string());
        }
        if self.config.require_trusted_relay && !self.is_trusted_relay {
            return HookOutcome::Reject(550, "Relay not trusted".to_string());
        }
        if !self.rate_limiter.check(&normalized) {
            return HookOutcome::Reject(421, "Too many connections, try again later".to_string());
        }

        self.state = SessionState::Connected;
        HookOutcome::Accept
    }

    /// `on MAIL FROM`: enforces the sender-domain allow-list.
    pub fn on_mail_from(&mut self, address: &str) -> HookOutcome {
        if !domain::domain_allowed(address, &self.config.allowed_sender_domains) {
            return HookOutcome::Reject(553, "Sender domain not allowed".to_string());
        }
        self.sender = Some(address.to_string());
        self.recipients.clear();
        self.state = SessionState::MailFrom;
        HookOutcome::Accept
    }

    /// `on RCPT TO`: enforces the recipient-domain allow-list, plus the
    /// legacy exact-address allow-list kept for existing deployments.
    pub fn on_rcpt_to(&mut self, address: &str) -> HookOutcome {
        if !domain::domain_allowed(address, &self.config.allowed_recipient_domains) {
            return HookOutcome::Reject(553, "Recipient domain not allowed".to_string());
        }
        if !self.config.target_emails.is_empty()
            && !self
                .config
                .target_emails
                .iter()
                .any(|e| e.eq_ignore_ascii_case(address))
        {
            return HookOutcome::Reject(550, "No such user here".to_string());
        }
        self.recipients.push(address.to_string());
        self.state = SessionState::RcptTo;
        HookOutcome::Accept
    }

    /// `on DATA` admission check, performed before the message body is read:
    /// rejects with 451 when the dispatcher's queue is already saturated.
    pub fn on_data_admission(&mut self) -> HookOutcome {
        if self.dispatcher.pending_count() >= self.config.max_queue_size {
            return HookOutcome::Reject(451, "Server busy, try again later".to_string());
        }
        self.state = SessionState::Data;
        HookOutcome::Accept
    }

    /// Parses the collected MIME payload, enforces the post-parse
    /// `REQUIRED_AUTH_RESULTS` policy, and persists+enqueues a [`Task`] on
    /// success. Resets session state back to `Connected` so the same
    /// connection can submit another message.
    pub async fn on_data(&mut self, raw: &[u8]) -> HookOutcome {
        let parsed = match super::parser::parse(raw, &self.store, self.config.max_file_size).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("failed to parse inbound message from {}: {e:#}", self.remote_ip);
                return HookOutcome::Reject(451, "Could not parse message".to_string());
            }
        };

        if !self.config.required_auth_results.is_empty() {
            if !self.is_trusted_relay {
                return HookOutcome::Reject(
                    550,
                    "Authentication-Results not accepted from this relay".to_string(),
                );
            }
            let concatenated = parsed
                .headers
                .get_all("Authentication-Results")
                .join(" ")
                .to_lowercase();
            let satisfied = self
                .config
                .required_auth_results
                .iter()
                .all(|token| concatenated.contains(&token.to_lowercase()));
            if !satisfied {
                return HookOutcome::Reject(550, "Required Authentication-Results not present".to_string());
            }
        }

        let task = Task {
            id: generate_id(16),
            created_at: Utc::now(),
            parsed,
            failed_webhooks: None,
            attempts: 0,
            last_error: None,
            updated_at: None,
        };

        if let Err(e) = self.queue.put(&task) {
            warn!("failed to persist task for {}: {e:#}", self.remote_ip);
            return HookOutcome::Reject(451, "Could not queue message".to_string());
        }

        info!(
            "accepted message {} from {:?} to {:?}",
            task.id, self.sender, self.recipients
        );
        self.dispatcher.enqueue(task.id);

        self.sender = None;
        self.recipients.clear();
        self.state = SessionState::Connected;
        HookOutcome::Accept
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}
