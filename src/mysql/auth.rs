use sha1::{Digest, Sha1};
use sha2::Sha256;

use super::protocol::{CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD};

/// Computes the auth response blob for the given plugin. An unknown
/// plugin yields an empty response, deferring to the server's
/// auth-switch request.
pub fn scramble_auth_response(password: &[u8], nonce: &[u8], plugin: &str) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    match plugin {
        MYSQL_NATIVE_PASSWORD => scramble_native_password(password, nonce),
        CACHING_SHA2_PASSWORD => scramble_sha256_password(password, nonce),
        _ => Vec::new(),
    }
}

/// mysql_native_password: SHA1(password) XOR SHA1(nonce + SHA1(SHA1(password))).
pub fn scramble_native_password(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// caching_sha2_password fast-auth scramble:
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + nonce)).
pub fn scramble_sha256_password(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(nonce);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Verifies a client's native-password response against a stored plain
/// password. Constant shape, not constant time; frontend user stores are
/// configuration, not secrets infrastructure.
pub fn verify_native_password(password: &[u8], nonce: &[u8], response: &[u8]) -> bool {
    if password.is_empty() {
        return response.is_empty();
    }
    scramble_native_password(password, nonce) == response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_scramble_is_20_bytes() {
        let nonce: Vec<u8> = (1..=20).collect();
        let resp = scramble_native_password(b"123456", &nonce);
        assert_eq!(resp.len(), 20);
    }

    #[test]
    fn sha256_scramble_is_32_bytes() {
        let nonce: Vec<u8> = (1..=20).collect();
        let resp = scramble_sha256_password(b"123456", &nonce);
        assert_eq!(resp.len(), 32);
    }

    #[test]
    fn empty_password_yields_empty_response() {
        let nonce = [0x41u8; 20];
        assert!(scramble_auth_response(b"", &nonce, MYSQL_NATIVE_PASSWORD).is_empty());
        assert!(scramble_auth_response(b"", &nonce, CACHING_SHA2_PASSWORD).is_empty());
    }

    #[test]
    fn unknown_plugin_defers_to_auth_switch() {
        let nonce = [0x41u8; 20];
        assert!(scramble_auth_response(b"123456", &nonce, "sha256_password_v3").is_empty());
    }

    #[test]
    fn sha2_scramble_single_byte_nonce() {
        // A 1-byte nonce is unusual but valid for the scramble itself.
        let resp = scramble_auth_response(b"123456", b"A", CACHING_SHA2_PASSWORD);
        assert_eq!(resp.len(), 32);
    }

    #[test]
    fn verify_accepts_matching_response() {
        let nonce: Vec<u8> = (10..30).collect();
        let resp = scramble_native_password(b"secret", &nonce);
        assert!(verify_native_password(b"secret", &nonce, &resp));
        assert!(!verify_native_password(b"other", &nonce, &resp));
    }

    #[test]
    fn scramble_depends_on_nonce() {
        let a = scramble_native_password(b"pw", &[1u8; 20]);
        let b = scramble_native_password(b"pw", &[2u8; 20]);
        assert_ne!(a, b);
    }
}
