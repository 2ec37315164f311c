//! HMAC-SHA256 request signing for outbound webhook deliveries, matching the
//! svix-style `sha256=<hex>` signature header convention.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Computes `sha256=<hex digest>` over `body` keyed by `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a previously computed signature, exposed
/// for tests and for any downstream receiver-side verification helpers.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let expected = sign(secret, body);
    let expected_bytes = expected.as_bytes();
    let given_bytes = signature.as_bytes();
    if expected_bytes.len() != given_bytes.len() {
        return false;
    }
    expected_bytes
        .iter()
        .zip(given_bytes.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic() {
        let a = sign("secret", b"payload");
        let b = sign("secret", b"payload");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = sign("secret-one", b"payload");
        let b = sign("secret-two", b"payload");
        assert_ne!(a, b);
    }

    #[test]
    fn verify_accepts_matching_signature_and_rejects_tampering() {
        let sig = sign("secret", b"payload");
        assert!(verify("secret", b"payload", &sig));
        assert!(!verify("secret", b"tampered", &sig));
        assert!(!verify("other-secret", b"payload", &sig));
    }
}
