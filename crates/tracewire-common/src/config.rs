//! Environment-variable helpers shared by the `from_env()` constructors of the
//! agent, server and pipeline configuration structs.
//!
//! Every variable is optional. A variable that is absent or fails to parse
//! leaves the built-in default in place.

use std::str::FromStr;
use std::time::Duration;

/// Prefix for every environment variable TraceWire reads.
pub const ENV_PREFIX: &str = "TRACEWIRE_";

/// Reads `TRACEWIRE_<key>` and parses it.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let name = format!("{}{}", ENV_PREFIX, key);
    let raw = std::env::var(&name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = %name, value = %raw, "Ignoring unparseable environment value");
            None
        }
    }
}

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_parse(key).unwrap_or(default)
}

/// Reads `TRACEWIRE_<key>` as a number of milliseconds.
pub fn env_millis(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable so they can run in parallel.

    #[test]
    fn test_absent_variable_falls_back() {
        assert_eq!(env_or("CONFIG_TEST_ABSENT", 42u32), 42);
        assert_eq!(
            env_millis("CONFIG_TEST_ABSENT_MS", Duration::from_millis(3000)),
            Duration::from_millis(3000)
        );
        assert!(env_string("CONFIG_TEST_ABSENT_STR").is_none());
    }

    #[test]
    fn test_present_variable_is_parsed() {
        std::env::set_var("TRACEWIRE_CONFIG_TEST_PRESENT_MS", "250");
        assert_eq!(
            env_millis("CONFIG_TEST_PRESENT_MS", Duration::from_millis(3000)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_unparseable_variable_falls_back() {
        std::env::set_var("TRACEWIRE_CONFIG_TEST_GARBAGE", "lots");
        assert_eq!(env_or("CONFIG_TEST_GARBAGE", 7usize), 7);
    }
}
