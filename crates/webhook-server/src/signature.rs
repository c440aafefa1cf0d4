//! Webhook signature verification (`X-Hub-Signature-256`).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `header` (the raw `X-Hub-Signature-256` header value, including
/// its `sha256=` prefix) against `body` under `secret`, in constant time.
/// Returns `false` for a missing/malformed header or a key of invalid
/// length, never panics on attacker-controlled input.
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    computed.ct_eq(&expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_correct_signature() {
        let secret = "topsecret";
        let body = b"payload";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify(secret, body, &format!("sha256={sig}")));
    }

    #[test]
    fn rejects_wrong_signature() {
        assert!(!verify("secret", b"payload", "sha256=deadbeef"));
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(!verify("secret", b"payload", "deadbeef"));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(!verify("secret", b"payload", "sha256=not-hex!!"));
    }
}
