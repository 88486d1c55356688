//! Test-runner requests.
//!
//! A test runner marks its requests with a User-Agent of the form
//! `simpletestNNNN;timestamp;salt;hmac`. When the HMAC checks out and the
//! timestamp is at most five seconds old, the request runs against the test
//! run's table prefix.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;

static TEST_USER_AGENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(simpletest\d+);(.+);(.+);(.+)$").expect("valid regex")
});

/// Seconds a signed User-Agent stays valid.
pub const MAX_AGE: i64 = 5;

const BLOCK_SIZE: usize = 64;

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let key = if key.len() > BLOCK_SIZE {
        Sha256::digest(key).to_vec()
    } else {
        key.to_vec()
    };
    let mut padded = key;
    padded.resize(BLOCK_SIZE, 0);

    let ipad: Vec<u8> = padded.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = padded.iter().map(|b| b ^ 0x5C).collect();

    let inner = Sha256::new().chain_update(&ipad).chain_update(data).finalize();
    Sha256::new()
        .chain_update(&opad)
        .chain_update(inner)
        .finalize()
        .into()
}

/// HMAC-SHA256 as URL-safe base64 without padding.
pub fn hmac_base64(data: &str, key: &str) -> String {
    URL_SAFE_NO_PAD.encode(hmac_sha256(key.as_bytes(), data.as_bytes()))
}

/// Signing key: the hash salt plus the settings file's mtime and size, so a
/// key stops working when the settings change.
pub fn signing_key(hash_salt: &str, settings_path: Option<&Path>) -> String {
    let metadata = settings_path.and_then(|path| std::fs::metadata(path).ok());
    match metadata {
        Some(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or_default();
            format!("{hash_salt}{mtime}{}", meta.len())
        }
        None => hash_salt.to_string(),
    }
}

/// The test prefix carried by a valid signed User-Agent.
pub fn valid_test_ua(user_agent: &str, key: &str, request_time: i64) -> Option<String> {
    let caps = TEST_USER_AGENT.captures(user_agent)?;
    let prefix = caps.get(1)?.as_str();
    let time = caps.get(2)?.as_str();
    let salt = caps.get(3)?.as_str();
    let hmac = caps.get(4)?.as_str();

    let time_diff = request_time.checked_sub(time.parse::<i64>().ok()?)?;
    if !(0..=MAX_AGE).contains(&time_diff) {
        return None;
    }
    let given = URL_SAFE_NO_PAD.decode(hmac).ok()?;
    let check = format!("{prefix};{time};{salt}");
    let expected = hmac_sha256(key.as_bytes(), check.as_bytes());
    constant_time_eq(&given, &expected).then(|| prefix.to_string())
}

/// Byte equality whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Sign a User-Agent for `prefix`.
pub fn generate_test_ua<R: RngCore + ?Sized>(
    prefix: &str,
    key: &str,
    request_time: i64,
    rng: &mut R,
) -> String {
    let salt = format!("{:016x}", rng.next_u64());
    let check = format!("{prefix};{request_time};{salt}");
    format!("{check};{}", hmac_base64(&check, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    #[test]
    fn test_hmac_sha256_known_vector() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        let hex: String = mac.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_generated_ua_validates() {
        let mut rng = StdRng::seed_from_u64(9);
        let ua = generate_test_ua("simpletest123", "key", 1000, &mut rng);
        assert_eq!(valid_test_ua(&ua, "key", 1000).as_deref(), Some("simpletest123"));
        assert_eq!(valid_test_ua(&ua, "key", 1005).as_deref(), Some("simpletest123"));
    }

    #[test]
    fn test_rejects_stale_or_forged() {
        let mut rng = StdRng::seed_from_u64(9);
        let ua = generate_test_ua("simpletest123", "key", 1000, &mut rng);
        assert!(valid_test_ua(&ua, "key", 1006).is_none());
        assert!(valid_test_ua(&ua, "key", 999).is_none());
        assert!(valid_test_ua(&ua, "other", 1000).is_none());
        assert!(valid_test_ua("Mozilla/5.0", "key", 1000).is_none());
    }

    #[test]
    fn test_rejects_out_of_range_timestamp() {
        let ua = "simpletest1;-9223372036854775808;a;b";
        assert!(valid_test_ua(ua, "k", 1_700_000_000).is_none());
        assert!(valid_test_ua("simpletest1;9223372036854775807;a;b", "k", -10).is_none());
    }

    #[test]
    fn test_rejects_tampered_signature() {
        let mut rng = StdRng::seed_from_u64(3);
        let ua = generate_test_ua("simpletest7", "key", 1000, &mut rng);
        let (signed, mac) = ua.rsplit_once(';').unwrap();
        assert!(valid_test_ua(&format!("{signed};{}", &mac[1..]), "key", 1000).is_none());
        assert!(valid_test_ua(&format!("{signed};not base64!"), "key", 1000).is_none());

        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_signing_key_tracks_settings_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"{}").unwrap();

        let key = signing_key("salt", Some(&path));
        assert!(key.starts_with("salt"));
        assert!(key.ends_with('2'));
        assert_eq!(signing_key("salt", None), "salt");
        assert_eq!(signing_key("salt", Some(&dir.path().join("missing"))), "salt");
    }
}
