// ===============================
// src/signing.rs
// ===============================
//
// Hash helpers: sha256 untuk idempotency key, HMAC-SHA256 untuk tanda tangan
// webhook alert (header X-Signature).
//
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hex HMAC-SHA256 of `payload`. HMAC takes keys of any length, so `None`
/// is not expected in practice.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}
