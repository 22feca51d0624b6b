//! Crate-level primitives shared by every subsystem

use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte block/transaction identifier.
pub type Hash = [u8; 32];

/// All-zero hash, used as the "no stop hash" sentinel in locator requests.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Current unix time in seconds.
///
/// Signed so that elapsed-time arithmetic (`now() - stamp`) stays natural
/// even around zero-initialized stamps.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Short hex form of a hash for log lines.
pub fn short_hash(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_monotonic_enough() {
        let a = now();
        let b = now();
        assert!(b >= a);
        assert!(a > 1_500_000_000);
    }

    #[test]
    fn test_short_hash() {
        let mut h = ZERO_HASH;
        h[0] = 0xab;
        assert_eq!(short_hash(&h), "ab00000000000000");
    }
}
