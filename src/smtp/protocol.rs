//! Line-oriented SMTP command/reply plumbing. This layer knows nothing
//! about admission policy or dispatch — it only reads command lines, parses
//! them, writes replies, and collects a `DATA` payload with dot-unstuffing.
//! Everything policy-related lives in [`super::session`], which drives this
//! protocol's state machine via hook results (`{accept | reject(code, msg)}`,
//! per the design's callback-heavy-SMTP-hooks note).

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// One parsed SMTP command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    StartTls,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

/// Parses one command line (without its trailing CRLF).
pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim_end();
    let mut parts = trimmed.splitn(2, ' ');
    let verb = parts.next().unwrap_or("").to_uppercase();
    let rest = parts.next().unwrap_or("").trim();

    match verb.as_str() {
        "HELO" => Command::Helo(rest.to_string()),
        "EHLO" => Command::Ehlo(rest.to_string()),
        "MAIL" => Command::MailFrom(extract_address(rest, "FROM:")),
        "RCPT" => Command::RcptTo(extract_address(rest, "TO:")),
        "DATA" => Command::Data,
        "STARTTLS" => Command::StartTls,
        "RSET" => Command::Rset,
        "NOOP" => Command::Noop,
        "QUIT" => Command::Quit,
        _ => Command::Unknown(trimmed.to_string()),
    }
}

/// Extracts the bracketed address from `MAIL FROM:<a@b>` / `RCPT TO:<a@b>`
/// style arguments, tolerating a missing `prefix:` or missing angle
/// brackets (some clients omit them).
fn extract_address(rest: &str, prefix: &str) -> String {
    let without_prefix = rest
        .to_uppercase()
        .find(prefix)
        .map(|idx| &rest[idx + prefix.len()..])
        .unwrap_or(rest)
        .trim();

    let before_params = without_prefix.split_whitespace().next().unwrap_or("");
    before_params
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Outcome of reading a `DATA` payload: either the full dot-unstuffed
/// message body, or a rejection because it exceeded the configured cap.
pub enum DataResult {
    Complete(Vec<u8>),
    TooLarge,
}

/// Wraps a bidirectional stream with line-buffered reads and CRLF-terminated
/// writes.
pub struct SmtpProtocol<S> {
    io: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpProtocol<S> {
    pub fn new(stream: S) -> Self {
        SmtpProtocol {
            io: BufReader::new(stream),
        }
    }

    /// Reads one line, stripped of its trailing CRLF/LF. An empty string
    /// return means the peer closed the connection (EOF).
    pub async fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let n = self.io.read_line(&mut buf).await.context("reading line from client")?;
        if n == 0 {
            return Ok(String::new());
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Writes one CRLF-terminated reply line and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.io.write_all(line.as_bytes()).await.context("writing reply")?;
        self.io.write_all(b"\r\n").await.context("writing reply terminator")?;
        self.io.flush().await.context("flushing reply")?;
        Ok(())
    }

    pub async fn send_greeting(&mut self, banner: &str) -> Result<()> {
        self.write_line(&format!("220 {banner}")).await
    }

    /// Reads the `DATA` payload up to the terminating `.` line, applying
    /// dot-unstuffing (a line starting with `..` has one leading dot
    /// removed) and enforcing `max_size` as a running byte budget.
    pub async fn read_data(&mut self, max_size: usize) -> Result<DataResult> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            let unstuffed = if let Some(rest) = line.strip_prefix('.') {
                rest
            } else {
                line.as_str()
            };

            if body.len() + unstuffed.len() + 2 > max_size {
                // Drain the remaining lines so the connection stays in sync
                // with the client's view of the DATA phase.
                loop {
                    let drain_line = self.read_line().await?;
                    if drain_line == "." || drain_line.is_empty() {
                        break;
                    }
                }
                return Ok(DataResult::TooLarge);
            }

            body.extend_from_slice(unstuffed.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        Ok(DataResult::Complete(body))
    }

    /// Unwraps the inner stream, e.g. to hand it off to a TLS acceptor
    /// after `STARTTLS`.
    pub fn into_inner(self) -> S {
        self.io.into_inner()
    }
}
