//! Environment variable loading
//!
//! Typed helpers for reading configuration from the process environment.

use crate::{Result, ToolingError};
use std::env;
use std::str::FromStr;

/// Load an environment variable as a string.
///
/// Returns `Ok(None)` when the variable is not set.
pub fn get_env(key: &str) -> Result<Option<String>> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(ToolingError::General(format!(
            "Environment variable {} contains invalid UTF-8",
            key
        ))),
    }
}

/// Load and parse an environment variable.
///
/// Returns `Ok(None)` when the variable is not set and an error when it is
/// set but fails to parse.
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => {
            let parsed = val.parse::<T>().map_err(|e| {
                ToolingError::General(format!("Failed to parse environment variable {}: {}", key, e))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Load a parsed environment variable, falling back to a default.
pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env_parse(key).ok().flatten().unwrap_or(default)
}

/// Load a boolean flag from the environment.
///
/// Accepts `1`, `true`, `yes`, `on` (case-insensitive) as true; everything
/// else, including an unset variable, as `default`.
pub fn env_flag(key: &str, default: bool) -> bool {
    match get_env(key).ok().flatten() {
        Some(val) => matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_missing() {
        assert_eq!(get_env("SYNAPSE_TEST_MISSING_VAR").unwrap(), None);
    }

    #[test]
    fn test_get_env_present() {
        env::set_var("SYNAPSE_TEST_PRESENT", "hello");
        assert_eq!(
            get_env("SYNAPSE_TEST_PRESENT").unwrap(),
            Some("hello".to_string())
        );
        env::remove_var("SYNAPSE_TEST_PRESENT");
    }

    #[test]
    fn test_get_env_parse_number() {
        env::set_var("SYNAPSE_TEST_PORT", "8080");
        let port: Option<u16> = get_env_parse("SYNAPSE_TEST_PORT").unwrap();
        assert_eq!(port, Some(8080));
        env::remove_var("SYNAPSE_TEST_PORT");
    }

    #[test]
    fn test_get_env_parse_failure() {
        env::set_var("SYNAPSE_TEST_BAD_PORT", "not-a-port");
        let result: Result<Option<u16>> = get_env_parse("SYNAPSE_TEST_BAD_PORT");
        assert!(result.is_err());
        env::remove_var("SYNAPSE_TEST_BAD_PORT");
    }

    #[test]
    fn test_env_or_default() {
        let value: u64 = env_or("SYNAPSE_TEST_UNSET_U64", 30);
        assert_eq!(value, 30);
    }

    #[test]
    fn test_env_flag() {
        env::set_var("SYNAPSE_TEST_FLAG", "true");
        assert!(env_flag("SYNAPSE_TEST_FLAG", false));

        env::set_var("SYNAPSE_TEST_FLAG", "off");
        assert!(!env_flag("SYNAPSE_TEST_FLAG", true));

        env::remove_var("SYNAPSE_TEST_FLAG");
        assert!(env_flag("SYNAPSE_TEST_FLAG", true));
    }
}
