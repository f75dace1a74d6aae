//! Tests for tracing setup.

use super::*;

/// Verify that a filter is built from the configured level.
#[test]
fn test_env_filter_from_config() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        json_format: false,
    };

    let filter = env_filter(&config);
    assert!(!filter.to_string().is_empty());
}

/// Verify that only the first installation succeeds.
#[test]
fn test_init_tracing_once() {
    let config = LoggingConfig {
        level: "warn".to_string(),
        json_format: true,
    };

    let _ = init_tracing(&config);
    assert!(!init_tracing(&config));
}
