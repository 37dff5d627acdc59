//! Small shared helpers.

use rand::Rng;

/// Generate a random lowercase hex string of the given length.
///
/// Used for unique resource names and for the initial (pre-policy) image
/// tag, which only needs to be collision-resistant within one cluster.
pub fn random_hex(len: usize) -> String {
    const CHARSET: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Current wall-clock time in nanoseconds, for time-ordered resource names.
pub fn unix_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
