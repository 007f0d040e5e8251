//! Small shared helpers: epoch timestamps, random hex material and
//! HMAC-SHA256 message signing for hub traffic.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Current wall-clock time in epoch milliseconds.
pub fn epoch_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// `n` random bytes rendered as lowercase hex (`2n` characters).
///
/// Used for the per-startup control auth token, generated recipe env values
/// and short progress-frame ids.
pub fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A short id suitable for tagging progress frames of one request.
pub fn short_id() -> String {
    random_hex(4)
}

/// Sign `message` with the hub secret using HMAC-SHA256, hex encoded.
pub fn sign_message(secret: &str, message: &str) -> String {
    // HMAC accepts keys of any length, so new_from_slice cannot fail here.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| HmacSha256::new_from_slice(b"").expect("empty hmac key"));
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_length_and_charset() {
        let token = random_hex(32);
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_hex_is_not_constant() {
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn signing_is_deterministic_per_secret() {
        let a = sign_message("s3cret", "payload");
        let b = sign_message("s3cret", "payload");
        let c = sign_message("other", "payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // 32-byte digest, hex encoded
    }
}
