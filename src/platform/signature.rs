//! HMAC-SHA256 signatures used by the identity and payment webhooks.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Hex encoded HMAC-SHA256 of `body`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `body`.
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex encoded SHA-256, used to store one-time codes.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_own_signature() {
        let signature = sign("secret", b"{\"type\":\"user.created\"}").unwrap();
        assert!(verify("secret", b"{\"type\":\"user.created\"}", &signature));
    }

    #[test]
    fn rejects_tampered_body_or_wrong_secret() {
        let signature = sign("secret", b"payload").unwrap();
        assert!(!verify("secret", b"payload!", &signature));
        assert!(!verify("other", b"payload", &signature));
    }

    #[test]
    fn rejects_malformed_signature() {
        assert!(!verify("secret", b"payload", "not-hex"));
        assert!(!verify("secret", b"payload", ""));
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex("123456"),
            "8d969eef6ecad3c29a3a629280e686cf0c3f5d5a86aff3ca12020c923adc6c92"
        );
    }
}
