#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize every test that
    // touches them so runs don't stomp on each other under `cargo test`'s
    // default multi-threaded runner.
    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const MANAGED_VARS: &[&str] = &[
        "WEBHOOK_URL",
        "WEBHOOK_RULES",
        "WEBHOOK_SECRET",
        "PORT",
        "MAIL_LASER_BIND_ADDRESS",
        "SMTP_SECURE",
        "SMTP_TLS_CERT_PATH",
        "SMTP_TLS_KEY_PATH",
        "ALLOW_INSECURE_WEBHOOK_HTTP",
        "REQUIRE_TRUSTED_RELAY",
        "TRUSTED_RELAY_IPS",
        "ALLOWED_RECIPIENT_DOMAINS",
        "PRODUCTION",
        "LOCAL_STORAGE_ENCRYPTION_KEY",
        "MAIL_LASER_TARGET_EMAILS",
    ];

    fn clear_env() {
        for var in MANAGED_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_values_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("MAIL_LASER_BIND_ADDRESS", "127.0.0.1");
        env::set_var("PORT", "2525");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.webhook_url.as_deref(), Some("https://webhook.example.com/endpoint"));
        assert_eq!(config.smtp_bind_address, "127.0.0.1");
        assert_eq!(config.smtp_port, 2525);

        clear_env();
    }

    #[test]
    fn applies_defaults_for_optional_settings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.smtp_bind_address, "0.0.0.0");
        assert_eq!(config.smtp_port, 2525);
        assert_eq!(config.webhook_concurrency, 5);
        assert_eq!(config.max_queue_size, 1000);
        assert!(!config.allow_insecure_http);

        clear_env();
    }

    #[test]
    fn requires_webhook_url_or_rules() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();

        let result = Config::from_env();

        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn webhook_rules_alone_satisfies_requirement() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_RULES", r#"{"rules":[]}"#);

        let config = Config::from_env().expect("config should load with rules only");
        assert!(config.webhook_url.is_none());

        clear_env();
    }

    #[test]
    fn secure_smtp_requires_tls_materials() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("SMTP_SECURE", "true");

        let result = Config::from_env();

        assert!(result.is_err());
        clear_env();
    }

    #[test]
    fn production_gate_requires_hardening_settings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("PRODUCTION", "true");

        let result = Config::from_env();
        assert!(result.is_err());

        env::set_var("REQUIRE_TRUSTED_RELAY", "true");
        env::set_var("TRUSTED_RELAY_IPS", "10.0.0.1");
        env::set_var("ALLOWED_RECIPIENT_DOMAINS", "example.com");
        env::set_var("WEBHOOK_SECRET", "shh");

        let config = Config::from_env().expect("production gate should now pass");
        assert!(config.production);

        clear_env();
    }

    #[test]
    fn production_gate_rejects_insecure_http_allowance() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("PRODUCTION", "true");
        env::set_var("REQUIRE_TRUSTED_RELAY", "true");
        env::set_var("TRUSTED_RELAY_IPS", "10.0.0.1");
        env::set_var("ALLOWED_RECIPIENT_DOMAINS", "example.com");
        env::set_var("WEBHOOK_SECRET", "shh");
        env::set_var("ALLOW_INSECURE_WEBHOOK_HTTP", "true");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_env();
    }

    #[test]
    fn decodes_hex_encryption_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("LOCAL_STORAGE_ENCRYPTION_KEY", "11".repeat(32));

        let config = Config::from_env().expect("config should load");
        assert_eq!(config.local_storage_encryption_key, Some([0x11u8; 32]));

        clear_env();
    }

    #[test]
    fn rejects_malformed_encryption_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("WEBHOOK_URL", "https://webhook.example.com/endpoint");
        env::set_var("LOCAL_STORAGE_ENCRYPTION_KEY", "not-a-key");

        let result = Config::from_env();
        assert!(result.is_err());

        clear_env();
    }
}
