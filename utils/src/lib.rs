use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{distributions::Alphanumeric, thread_rng, Rng};

/// Generates a random alphanumeric string of a given length.
///
/// # Examples
///
/// ```
/// let random_string = utils::generate_random_string(10);
/// assert_eq!(random_string.len(), 10);
/// ```
pub fn generate_random_string(length: usize) -> String {
    let rng = thread_rng();
    rng.sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Current time as a duration since UNIX_EPOCH.
///
/// # Examples
///
/// ```
/// let now = utils::current_time_duration();
/// assert!(now.as_secs() > 0);
/// ```
pub fn current_time_duration() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
