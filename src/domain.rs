//! Domain- and address-matching helpers shared by the SMTP admission hooks.
//!
//! Registrable-domain extraction uses `psl` (the public suffix list) so an
//! allow-list entry like `example.com` also matches `mail.example.com`,
//! rather than requiring operators to enumerate every subdomain that might
//! legitimately send or receive mail.

/// Extracts the email address's domain, lowercased.
pub fn domain_of(address: &str) -> Option<String> {
    address.rsplit_once('@').map(|(_, domain)| domain.to_lowercase())
}

/// Extracts the registrable (eTLD+1) domain for comparison against an
/// allow-list, falling back to the raw lowercased domain when `psl` can't
/// classify it (e.g. bare IP literals or single-label hosts in tests).
pub fn registrable_domain(host: &str) -> String {
    let lower = host.to_lowercase();
    match psl::domain(lower.as_bytes()) {
        Some(d) => String::from_utf8_lossy(d.as_bytes()).to_string(),
        None => lower,
    }
}

/// True when `address`'s domain is present in `allowed`, comparing at the
/// registrable-domain level so a configured `example.com` covers
/// subdomains like `mail.example.com`.
pub fn domain_allowed(address: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(domain) = domain_of(address) else {
        return false;
    };
    let candidate = registrable_domain(&domain);
    allowed
        .iter()
        .any(|a| registrable_domain(a) == candidate || a.to_lowercase() == domain)
}

/// Strips the IPv4-mapped IPv6 prefix (`::ffff:`) and lowercases, per the
/// `on connect` normalization step in the ingestion admission pipeline.
pub fn normalize_remote_ip(raw: &str) -> String {
    let lower = raw.to_lowercase();
    lower
        .strip_prefix("::ffff:")
        .unwrap_or(&lower)
        .to_string()
}

/// True when `ip` is present in `allowed` after normalization.
pub fn ip_allowed(ip: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let normalized = normalize_remote_ip(ip);
    allowed.iter().any(|a| normalize_remote_ip(a) == normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_domain_from_address() {
        assert_eq!(domain_of("user@Example.COM"), Some("example.com".to_string()));
        assert_eq!(domain_of("not-an-email"), None);
    }

    #[test]
    fn empty_allow_list_allows_everything() {
        assert!(domain_allowed("a@anything.test", &[]));
    }

    #[test]
    fn subdomains_match_registrable_domain() {
        let allowed = vec!["example.com".to_string()];
        assert!(domain_allowed("a@mail.example.com", &allowed));
        assert!(domain_allowed("a@example.com", &allowed));
        assert!(!domain_allowed("a@evil-example.com", &allowed));
    }

    #[test]
    fn normalizes_ipv4_mapped_ipv6() {
        assert_eq!(normalize_remote_ip("::FFFF:10.0.0.1"), "10.0.0.1");
        assert_eq!(normalize_remote_ip("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn ip_allow_list_matches_after_normalization() {
        let allowed = vec!["10.0.0.1".to_string()];
        assert!(ip_allowed("::ffff:10.0.0.1", &allowed));
        assert!(!ip_allowed("10.0.0.2", &allowed));
    }
}
