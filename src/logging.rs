//! Logging configuration for askdb.
//!
//! The server logs to stderr; verbosity comes from `RUST_LOG` with an "info"
//! fallback. Secrets never reach log lines: adapters and the registry redact
//! key material before formatting errors.

use tracing_subscriber::EnvFilter;

/// Initializes stderr logging for the server process.
pub fn init(filter_override: Option<&str>) {
    let filter = match filter_override {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Replaces any occurrence of `secret` in `text` with asterisks.
///
/// Used when provider errors might echo the request back, auth header
/// included.
pub fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, "***")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_replaces_secret() {
        let line = "request failed: Bearer sk-abc123 rejected";
        assert_eq!(
            redact(line, "sk-abc123"),
            "request failed: Bearer *** rejected"
        );
    }

    #[test]
    fn test_redact_empty_secret_is_noop() {
        assert_eq!(redact("hello", ""), "hello");
    }

    #[test]
    fn test_redact_absent_secret_is_noop() {
        assert_eq!(redact("hello", "sk-xyz"), "hello");
    }
}
