use sha2::{Digest, Sha256};

/// Consistent hashing for percentage rollout.
///
/// Buckets the first 32 bits of `SHA-256(user_id + ":" + flag_key)` into
/// `[0, 100]` and compares against `percentage`. Changing the number of hash
/// bits used would reassign users across every existing rollout.
pub fn is_in_rollout(user_id: &str, flag_key: &str, percentage: f64) -> bool {
    if percentage.is_nan() || percentage <= 0.0 {
        return false;
    }
    if percentage >= 100.0 {
        return true;
    }

    bucket(user_id, flag_key) < percentage
}

/// Position of the user in the rollout range for a flag.
pub fn bucket(user_id: &str, flag_key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b":");
    hasher.update(flag_key.as_bytes());
    let digest = hasher.finalize();

    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    f64::from(prefix) / f64::from(u32::MAX) * 100.0
}
