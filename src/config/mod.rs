//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides the `from_env` function to populate this struct. It supports
//! loading variables from a `.env` file via the `dotenv` crate and provides
//! default values for optional settings.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Holds the application's runtime configuration settings.
///
/// These settings are typically loaded from environment variables via
/// [`Config::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // --- Webhook routing & dispatch ---
    /// Fallback webhook URL used when no rule matches. (`WEBHOOK_URL`)
    pub webhook_url: Option<String>,
    /// Raw `WEBHOOK_RULES` JSON (array, `{rules:[...]}`, or absent).
    pub webhook_rules_raw: Option<String>,
    /// Shared secret used to sign outbound webhook payloads. (`WEBHOOK_SECRET`)
    pub webhook_secret: Option<String>,
    /// Webhook HTTP request timeout. (`WEBHOOK_TIMEOUT`, ms, default 5000)
    pub webhook_timeout: Duration,
    /// Bounded worker pool size for dispatch. (`WEBHOOK_CONCURRENCY`, default 5)
    pub webhook_concurrency: usize,
    /// Delay before a deferred re-enqueue after retry exhaustion.
    /// (`WEBHOOK_RETRY_DELAY_MS`, default 60_000)
    pub webhook_retry_delay: Duration,
    /// Allow `http://` webhook targets. (`ALLOW_INSECURE_WEBHOOK_HTTP`, default false)
    pub allow_insecure_http: bool,

    // --- SMTP server ---
    /// Bind address for the SMTP listener. (`MAIL_LASER_BIND_ADDRESS`, default "0.0.0.0")
    pub smtp_bind_address: String,
    /// Bind port for the SMTP listener. (`PORT`, default 2525)
    pub smtp_port: u16,
    /// Whether TLS materials are required / STARTTLS is advertised. (`SMTP_SECURE`)
    pub smtp_secure: bool,
    /// PEM certificate chain path, required when `smtp_secure` is set.
    pub smtp_tls_cert_path: Option<String>,
    /// PEM private key path, required when `smtp_secure` is set.
    pub smtp_tls_key_path: Option<String>,
    /// Maximum concurrent SMTP clients. (`SMTP_MAX_CLIENTS`, default 100)
    pub smtp_max_clients: usize,
    /// Per-read/write socket timeout. (`SMTP_SOCKET_TIMEOUT`, ms, default 30_000)
    pub smtp_socket_timeout: Duration,
    /// Grace period allowed for an in-flight session to finish during shutdown.
    /// (`SMTP_CLOSE_TIMEOUT`, ms, default 5_000)
    pub smtp_close_timeout: Duration,
    /// Maximum accepted message size in bytes. (`SMTP_MAX_MESSAGE_SIZE`, default 25MB)
    pub smtp_max_message_size: usize,
    /// Sliding rate-limit window. (`SMTP_RATE_LIMIT_WINDOW_MS`, default 60_000)
    pub smtp_rate_limit_window: Duration,
    /// Maximum connections admitted per window per remote IP.
    /// (`SMTP_RATE_LIMIT_MAX_CONNECTIONS`, default 100)
    pub smtp_rate_limit_max_connections: u32,

    // --- Admission policy ---
    /// Legacy single/multi recipient allow-list kept for backward compatibility
    /// with deployments that pin an exact target address.
    /// (`MAIL_LASER_TARGET_EMAILS`, comma-separated, optional)
    pub target_emails: Vec<String>,
    /// Bound on the in-memory dispatcher queue before `DATA` is rejected with 451.
    /// (`MAX_QUEUE_SIZE`, default 1000)
    pub max_queue_size: usize,
    /// Per-attachment byte cap; larger attachments are skipped outright.
    /// (`MAX_FILE_SIZE`, default 10MB)
    pub max_file_size: usize,
    /// Recipient domain allow-list. (`ALLOWED_RECIPIENT_DOMAINS`, comma-separated)
    pub allowed_recipient_domains: Vec<String>,
    /// Sender domain allow-list. (`ALLOWED_SENDER_DOMAINS`, comma-separated)
    pub allowed_sender_domains: Vec<String>,
    /// Remote-IP allow-list for connecting SMTP clients. (`ALLOWED_SMTP_CLIENTS`)
    pub allowed_smtp_clients: Vec<String>,
    /// Relay IPs trusted to assert `Authentication-Results`. (`TRUSTED_RELAY_IPS`)
    pub trusted_relay_ips: Vec<String>,
    /// Require the connecting peer to be a trusted relay. (`REQUIRE_TRUSTED_RELAY`)
    pub require_trusted_relay: bool,
    /// Tokens that must all appear in `Authentication-Results`. (`REQUIRED_AUTH_RESULTS`,
    /// comma-separated, e.g. `spf=pass,dmarc=pass`)
    pub required_auth_results: Vec<String>,

    // --- Object store (primary attachment backend) ---
    pub s3_region: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_force_path_style: bool,
    /// How often the reconciliation loop attempts to drain the local
    /// fallback into the primary store. (`S3_RETRY_INTERVAL`, minutes, default 5)
    pub s3_retry_interval: Duration,
    /// Max reconciliation attempts per locally-stored item before it is
    /// dropped from the retry set. (`S3_MAX_RETRIES`, default 10)
    pub s3_max_retries: u32,

    // --- Local attachment fallback ---
    /// Directory used for local attachment fallback storage.
    /// (`LOCAL_STORAGE_PATH`, default "./data/attachments")
    pub local_storage_path: String,
    /// Hours before a locally-stored attachment is garbage collected.
    /// (`LOCAL_STORAGE_RETENTION`, default 168 = 7 days)
    pub local_storage_retention_hours: u64,
    /// 32-byte hex or base64 key enabling AES-256-GCM at-rest encryption.
    /// (`LOCAL_STORAGE_ENCRYPTION_KEY`)
    pub local_storage_encryption_key: Option<[u8; 32]>,

    // --- Durable queue ---
    /// Directory holding one `{id}.json` file per pending task.
    /// (`DURABLE_QUEUE_PATH`, default "./data/queue")
    pub durable_queue_path: String,

    // --- Health check server ---
    pub health_check_bind_address: String,
    pub health_check_port: u16,

    // --- Hardening gate ---
    /// When set, `validate_production` is enforced at startup. (`PRODUCTION`)
    pub production: bool,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_csv(key: &str) -> Vec<String> {
    env::var(key)
        .map(|val| {
            val.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_bool(key: &str, default_val: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default_val)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default_val: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow!("{key} ('{val}') is invalid: {e}")),
        Err(_) => Ok(default_val),
    }
}

/// Decodes a 32-byte key from hex (64 chars) or standard base64.
fn decode_encryption_key(raw: &str) -> Result<[u8; 32]> {
    use base64::Engine;

    let bytes = if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(raw).context("LOCAL_STORAGE_ENCRYPTION_KEY is not valid hex")?
    } else {
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .context("LOCAL_STORAGE_ENCRYPTION_KEY is not valid hex or base64")?
    };

    if bytes.len() != 32 {
        return Err(anyhow!(
            "LOCAL_STORAGE_ENCRYPTION_KEY must decode to exactly 32 bytes, got {}",
            bytes.len()
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl Config {
    /// Loads configuration settings from environment variables.
    ///
    /// Reads variables as documented on each field above. Supports loading
    /// from a `.env` file if present. Provides default values for optional
    /// settings and logs the resolved configuration (never the secret
    /// values) at `info`.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let webhook_url = env_string("WEBHOOK_URL");
        let webhook_rules_raw = env_string("WEBHOOK_RULES");
        let webhook_secret = env_string("WEBHOOK_SECRET");

        let target_emails = env_csv("MAIL_LASER_TARGET_EMAILS");

        if webhook_url.is_none() && webhook_rules_raw.is_none() {
            log::error!("Neither WEBHOOK_URL nor WEBHOOK_RULES is set; no webhook can ever be targeted");
            return Err(anyhow!(
                "at least one of WEBHOOK_URL or WEBHOOK_RULES must be set"
            ));
        }

        let webhook_timeout_ms: u64 = env_parsed("WEBHOOK_TIMEOUT", 5000)?;
        let webhook_concurrency: usize = env_parsed("WEBHOOK_CONCURRENCY", 5)?;
        let webhook_retry_delay_ms: u64 = env_parsed("WEBHOOK_RETRY_DELAY_MS", 60_000)?;
        let allow_insecure_http = env_bool("ALLOW_INSECURE_WEBHOOK_HTTP", false);

        let smtp_bind_address =
            env::var("MAIL_LASER_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());
        let smtp_port: u16 = env_parsed("PORT", 2525)?;
        let smtp_secure = env_bool("SMTP_SECURE", false);
        let smtp_tls_cert_path = env_string("SMTP_TLS_CERT_PATH");
        let smtp_tls_key_path = env_string("SMTP_TLS_KEY_PATH");
        let smtp_max_clients: usize = env_parsed("SMTP_MAX_CLIENTS", 100)?;
        let smtp_socket_timeout_ms: u64 = env_parsed("SMTP_SOCKET_TIMEOUT", 30_000)?;
        let smtp_close_timeout_ms: u64 = env_parsed("SMTP_CLOSE_TIMEOUT", 5_000)?;
        let smtp_max_message_size: usize = env_parsed("SMTP_MAX_MESSAGE_SIZE", 25 * 1024 * 1024)?;
        let smtp_rate_limit_window_ms: u64 = env_parsed("SMTP_RATE_LIMIT_WINDOW_MS", 60_000)?;
        let smtp_rate_limit_max_connections: u32 =
            env_parsed("SMTP_RATE_LIMIT_MAX_CONNECTIONS", 100)?;

        if smtp_secure && (smtp_tls_cert_path.is_none() || smtp_tls_key_path.is_none()) {
            let err_msg = "SMTP_SECURE is set but SMTP_TLS_CERT_PATH/SMTP_TLS_KEY_PATH are missing";
            log::error!("{err_msg}");
            return Err(anyhow!(err_msg.to_string()));
        }

        let max_queue_size: usize = env_parsed("MAX_QUEUE_SIZE", 1000)?;
        let max_file_size: usize = env_parsed("MAX_FILE_SIZE", 10 * 1024 * 1024)?;
        let allowed_recipient_domains = env_csv("ALLOWED_RECIPIENT_DOMAINS");
        let allowed_sender_domains = env_csv("ALLOWED_SENDER_DOMAINS");
        let allowed_smtp_clients = env_csv("ALLOWED_SMTP_CLIENTS");
        let trusted_relay_ips = env_csv("TRUSTED_RELAY_IPS");
        let require_trusted_relay = env_bool("REQUIRE_TRUSTED_RELAY", false);
        let required_auth_results = env_csv("REQUIRED_AUTH_RESULTS");

        let s3_region = env_string("S3_REGION").or_else(|| env_string("AWS_REGION"));
        let s3_bucket = env_string("S3_BUCKET");
        let s3_access_key_id = env_string("S3_ACCESS_KEY_ID");
        let s3_secret_access_key = env_string("S3_SECRET_ACCESS_KEY");
        let s3_endpoint = env_string("S3_ENDPOINT");
        let s3_force_path_style = env_bool("S3_FORCE_PATH_STYLE", false);
        let s3_retry_interval_min: u64 = env_parsed("S3_RETRY_INTERVAL", 5)?;
        let s3_max_retries: u32 = env_parsed("S3_MAX_RETRIES", 10)?;

        let local_storage_path =
            env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./data/attachments".to_string());
        let local_storage_retention_hours: u64 = env_parsed("LOCAL_STORAGE_RETENTION", 168)?;
        let local_storage_encryption_key = match env_string("LOCAL_STORAGE_ENCRYPTION_KEY") {
            Some(raw) => Some(decode_encryption_key(&raw)?),
            None => None,
        };

        let durable_queue_path =
            env::var("DURABLE_QUEUE_PATH").unwrap_or_else(|_| "./data/queue".to_string());

        let health_check_bind_address =
            env::var("MAIL_LASER_HEALTH_BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string());
        let health_check_port: u16 = env_parsed("MAIL_LASER_HEALTH_PORT", 8080)?;

        let production = env_bool("PRODUCTION", false);

        let config = Config {
            webhook_url,
            webhook_rules_raw,
            webhook_secret,
            webhook_timeout: Duration::from_millis(webhook_timeout_ms),
            webhook_concurrency,
            webhook_retry_delay: Duration::from_millis(webhook_retry_delay_ms),
            allow_insecure_http,
            smtp_bind_address,
            smtp_port,
            smtp_secure,
            smtp_tls_cert_path,
            smtp_tls_key_path,
            smtp_max_clients,
            smtp_socket_timeout: Duration::from_millis(smtp_socket_timeout_ms),
            smtp_close_timeout: Duration::from_millis(smtp_close_timeout_ms),
            smtp_max_message_size,
            smtp_rate_limit_window: Duration::from_millis(smtp_rate_limit_window_ms),
            smtp_rate_limit_max_connections,
            target_emails,
            max_queue_size,
            max_file_size,
            allowed_recipient_domains,
            allowed_sender_domains,
            allowed_smtp_clients,
            trusted_relay_ips,
            require_trusted_relay,
            required_auth_results,
            s3_region,
            s3_bucket,
            s3_access_key_id,
            s3_secret_access_key,
            s3_endpoint,
            s3_force_path_style,
            s3_retry_interval: Duration::from_secs(s3_retry_interval_min * 60),
            s3_max_retries,
            local_storage_path,
            local_storage_retention_hours,
            local_storage_encryption_key,
            durable_queue_path,
            health_check_bind_address,
            health_check_port,
            production,
        };

        config.validate_production()?;

        log::info!(
            "Config: smtp {}:{} (secure={}), health {}:{}, webhook_url={:?}, concurrency={}",
            config.smtp_bind_address,
            config.smtp_port,
            config.smtp_secure,
            config.health_check_bind_address,
            config.health_check_port,
            config.webhook_url,
            config.webhook_concurrency,
        );

        Ok(config)
    }

    /// True when the object-store primary backend has everything it needs
    /// to be constructed (region, bucket; credentials may come from the
    /// ambient AWS credential chain when not set explicitly).
    pub fn s3_configured(&self) -> bool {
        self.s3_region.is_some() && self.s3_bucket.is_some()
    }

    /// Enforces the production hardening gate from the design's error
    /// handling section: when `production` is set, `require_trusted_relay`,
    /// `trusted_relay_ips`, `allowed_recipient_domains`, and `webhook_secret`
    /// must all be configured, and `allow_insecure_http` must be false.
    ///
    /// Deliberately does **not** require `smtp_secure` — that asymmetry is
    /// preserved from the source behavior (see design notes, open questions).
    pub fn validate_production(&self) -> Result<()> {
        if !self.production {
            return Ok(());
        }

        let mut missing = Vec::new();
        if !self.require_trusted_relay {
            missing.push("REQUIRE_TRUSTED_RELAY");
        }
        if self.trusted_relay_ips.is_empty() {
            missing.push("TRUSTED_RELAY_IPS");
        }
        if self.allowed_recipient_domains.is_empty() {
            missing.push("ALLOWED_RECIPIENT_DOMAINS");
        }
        if self.webhook_secret.is_none() {
            missing.push("WEBHOOK_SECRET");
        }
        if self.allow_insecure_http {
            missing.push("ALLOW_INSECURE_WEBHOOK_HTTP must be false");
        }

        if !missing.is_empty() {
            let err_msg = format!(
                "PRODUCTION hardening gate failed, missing/invalid: {}",
                missing.join(", ")
            );
            log::error!("{err_msg}");
            return Err(anyhow!(err_msg));
        }

        Ok(())
    }
}

mod tests;
