//! HMAC-SHA256 request signatures.
//!
//! The client signs the request timestamp with its team API key; the
//! dispatcher accepts the signature if it verifies against any
//! currently-valid key for the team. Verification is constant-time.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum tolerated distance between the signature timestamp and the
/// dispatcher's clock, in either direction.
pub const MAX_TIME_SKEW_SECONDS: f64 = 30.0;

/// Generate the HMAC-SHA256 tag for a message.
pub fn sign(message: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Whether `tag` is a valid HMAC for `message` under `key`.
pub fn validate(message: &[u8], tag: &[u8], key: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// Whether `tag` verifies against any of the given keys.
pub fn validate_any<'a>(
    message: &[u8],
    tag: &[u8],
    keys: impl IntoIterator<Item = &'a [u8]>,
) -> bool {
    keys.into_iter().any(|key| validate(message, tag, key))
}

/// Whether a signature timestamp is within the permitted skew window.
pub fn within_time_range(t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let skew = (now - t).num_milliseconds() as f64 / 1000.0;
    skew.abs() < MAX_TIME_SKEW_SECONDS
}
