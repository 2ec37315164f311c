//! The SMTP ingestion surface: accepts connections (bounded by
//! `smtp_max_clients`), drives the line protocol in [`protocol`], evaluates
//! admission policy through [`session`], and optionally upgrades a
//! connection to TLS via [`tls`] on `STARTTLS`.

pub mod parser;
pub mod protocol;
pub mod rate_limiter;
pub mod session;
pub mod stream;
pub mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::queue::FileQueue;
use crate::storage::AttachmentStore;
use crate::webhook::Dispatcher;
use protocol::{parse_command, Command, DataResult, SmtpProtocol};
use rate_limiter::RateLimiter;
use session::{HookOutcome, Session};
use stream::{AsyncStream, BoxedStream};

const BANNER: &str = "mailhook ESMTP ready";

/// Owns the shared state every accepted connection needs: configuration,
/// the durable queue, attachment storage, the dispatcher's work channel, and
/// the rate limiter's shared hit map.
pub struct Server {
    config: Arc<Config>,
    queue: Arc<FileQueue>,
    store: Arc<AttachmentStore>,
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Arc<RateLimiter>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl Server {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<FileQueue>,
        store: Arc<AttachmentStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.smtp_rate_limit_window,
            config.smtp_rate_limit_max_connections,
        ));

        let tls_acceptor = if config.smtp_secure {
            let cert_path = config
                .smtp_tls_cert_path
                .as_deref()
                .context("SMTP_SECURE is set but SMTP_TLS_CERT_PATH is missing")?;
            let key_path = config
                .smtp_tls_key_path
                .as_deref()
                .context("SMTP_SECURE is set but SMTP_TLS_KEY_PATH is missing")?;
            Some(tls::load_acceptor(cert_path, key_path)?)
        } else {
            None
        };

        Ok(Server {
            config,
            queue,
            store,
            dispatcher,
            rate_limiter,
            tls_acceptor,
        })
    }

    /// Binds the configured address/port, e.g. to discover the assigned
    /// port ahead of [`Server::serve`] when `smtp_port` is `0` (used by
    /// tests that need a known, collision-free address).
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.smtp_bind_address, self.config.smtp_port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding SMTP listener to {addr}"))
    }

    /// Binds the configured address/port and accepts connections until
    /// `shutdown` is cancelled. Each connection is handled on its own task,
    /// bounded by a semaphore sized `smtp_max_clients`; in-flight sessions
    /// are left to finish on their own once the accept loop stops.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accepts connections on an already-bound `listener` until `shutdown`
    /// is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            "SMTP server listening on {}",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
        );

        let permits = Arc::new(Semaphore::new(self.config.smtp_max_clients.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SMTP listener closing: no longer accepting new connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("error accepting SMTP connection: {e}");
                            continue;
                        }
                    };

                    let Ok(permit) = permits.clone().try_acquire_owned() else {
                        warn!("rejecting connection from {peer}: at smtp_max_clients capacity");
                        drop(stream);
                        continue;
                    };

                    let server = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = server.handle_connection(stream, peer.ip().to_string()).await {
                            if crate::error::is_recoverable(crate::error::classify_message(&format!("{e:#}"))) {
                                warn!("SMTP session with {peer} hit a recoverable network fault: {e:#}");
                            } else {
                                error!("SMTP session with {peer} ended in error: {e:#}");
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote_ip: String) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let boxed: BoxedStream = Box::new(stream);
        let mut protocol = SmtpProtocol::new(boxed);

        let mut session = Session::new(
            self.config.clone(),
            self.queue.clone(),
            self.store.clone(),
            self.dispatcher.clone(),
            self.rate_limiter.clone(),
        );

        match session.on_connect(&remote_ip) {
            HookOutcome::Accept => protocol.send_greeting(BANNER).await?,
            HookOutcome::Reject(code, msg) => {
                protocol.write_line(&format!("{code} {msg}")).await?;
                return Ok(());
            }
        }

        loop {
            let line = self.read_with_timeout(&mut protocol).await?;
            if line.is_empty() {
                info!("connection from {remote_ip} closed (EOF)");
                break;
            }
            debug!("{remote_ip} -> {line}");

            match parse_command(&line) {
                Command::Helo(_) | Command::Ehlo(_) => {
                    protocol.write_line("250 mailhook greets you").await?;
                }
                Command::MailFrom(address) => match session.on_mail_from(&address) {
                    HookOutcome::Accept => protocol.write_line("250 OK").await?,
                    HookOutcome::Reject(code, msg) => protocol.write_line(&format!("{code} {msg}")).await?,
                },
                Command::RcptTo(address) => match session.on_rcpt_to(&address) {
                    HookOutcome::Accept => protocol.write_line("250 OK").await?,
                    HookOutcome::Reject(code, msg) => protocol.write_line(&format!("{code} {msg}")).await?,
                },
                Command::Data => {
                    match session.on_data_admission() {
                        HookOutcome::Accept => {
                            protocol.write_line("354 End data with <CR><LF>.<CR><LF>").await?;
                        }
                        HookOutcome::Reject(code, msg) => {
                            protocol.write_line(&format!("{code} {msg}")).await?;
                            continue;
                        }
                    }

                    let data = self.read_data_with_timeout(&mut protocol).await?;
                    match data {
                        DataResult::TooLarge => {
                            protocol.write_line("552 Message size exceeds maximum permitted").await?;
                        }
                        DataResult::Complete(raw) => match session.on_data(&raw).await {
                            HookOutcome::Accept => protocol.write_line("250 OK: message queued").await?,
                            HookOutcome::Reject(code, msg) => {
                                protocol.write_line(&format!("{code} {msg}")).await?
                            }
                        },
                    }
                }
                Command::StartTls => {
                    if self.tls_acceptor.is_none() {
                        protocol.write_line("454 TLS not available").await?;
                        continue;
                    }
                    protocol.write_line("220 Ready to start TLS").await?;
                    let inner = protocol.into_inner();
                    let acceptor = self.tls_acceptor.clone().unwrap();
                    let upgraded = acceptor
                        .accept(inner)
                        .await
                        .context("STARTTLS handshake failed")?;
                    let boxed: BoxedStream = Box::new(upgraded);
                    protocol = SmtpProtocol::new(boxed);
                }
                Command::Rset => {
                    session = Session::new(
                        self.config.clone(),
                        self.queue.clone(),
                        self.store.clone(),
                        self.dispatcher.clone(),
                        self.rate_limiter.clone(),
                    );
                    session.on_connect(&remote_ip);
                    protocol.write_line("250 OK").await?;
                }
                Command::Noop => protocol.write_line("250 OK").await?,
                Command::Quit => {
                    protocol.write_line("221 Bye").await?;
                    break;
                }
                Command::Unknown(_) => {
                    protocol.write_line("500 Command not recognized").await?;
                }
            }
        }

        session.close();
        Ok(())
    }

    async fn read_with_timeout(&self, protocol: &mut SmtpProtocol<BoxedStream>) -> Result<String> {
        match tokio::time::timeout(self.config.smtp_socket_timeout, protocol.read_line()).await {
            Ok(result) => result,
            Err(_) => Ok(String::new()),
        }
    }

    async fn read_data_with_timeout(&self, protocol: &mut SmtpProtocol<BoxedStream>) -> Result<DataResult> {
        let fut = protocol.read_data(self.config.smtp_max_message_size);
        match tokio::time::timeout(self.config.smtp_socket_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Ok(DataResult::TooLarge),
        }
    }
}

// Blanket bound used by `handle_connection`'s TLS upgrade path: both a plain
// `TcpStream` and a `TlsStream<TcpStream>` satisfy `AsyncStream`.
#[allow(dead_code)]
fn _assert_boxed_stream_bounds<S: AsyncStream>() {}
