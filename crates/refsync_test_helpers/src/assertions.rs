//! Domain-specific assertions for RefSync tests
//!
//! Provides custom predicates and assertion helpers for common
//! test patterns in RefSync.

use predicates::prelude::*;
use predicates::str::contains;

/// Assert that stderr does NOT contain any of the given strings
///
/// Useful for verifying that certain log messages or errors don't appear.
///
/// # Example
///
/// ```rust
/// use refsync_test_helpers::assertions::stderr_not_contains;
/// use predicates::prelude::*;
///
/// let stderr = "✓ Sync complete";
/// assert!(stderr_not_contains(&["ERROR", "WARN"]).eval(stderr));
/// ```
pub fn stderr_not_contains(values: &[&str]) -> impl Predicate<str> {
    let owned_values: Vec<String> = values.iter().map(|&s| s.to_string()).collect();
    predicate::function(move |s: &str| !owned_values.iter().any(|v| s.contains(v.as_str())))
}

/// Assert that a string is the JSON rendering of `refsync status --json`
pub fn valid_status_json() -> impl Predicate<str> {
    contains("\"items\"")
        .and(contains("\"collections\""))
        .and(contains("\"ledger\""))
}

/// Assert that a string contains a temporary `local-` key
pub fn contains_temporary_key() -> impl Predicate<str> {
    predicate::function(|s: &str| {
        s.split(|c: char| c.is_whitespace() || c == '"' || c == ',')
            .any(refsync_store::model::is_temporary_key)
    })
}

/// Assert that a string contains a server-assigned key
///
/// Server keys are 8 characters of uppercase letters and digits.
pub fn contains_server_key() -> impl Predicate<str> {
    predicate::function(|s: &str| {
        s.split(|c: char| !c.is_ascii_alphanumeric()).any(|word| {
            word.len() == 8
                && word
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_not_contains() {
        let stderr = "Some output without errors";
        assert!(stderr_not_contains(&["ERROR", "WARN"]).eval(stderr));

        let stderr_with_error = "ERROR: something went wrong";
        assert!(!stderr_not_contains(&["ERROR"]).eval(stderr_with_error));
    }

    #[test]
    fn test_valid_status_json() {
        let valid = r#"{"items":1,"collections":0,"attachments":0,"ledger":{"new":0}}"#;
        assert!(valid_status_json().eval(valid));
        assert!(!valid_status_json().eval(r#"{"data":"test"}"#));
    }

    #[test]
    fn test_key_predicates() {
        assert!(contains_server_key().eval("Confirmed item ABCD1234"));
        assert!(!contains_server_key().eval("abcd1234 ABC123"));
        assert!(!contains_server_key().eval("local-abc"));
    }
}
