//! Tests for logging configuration and format parsing

use mqtt_loadpub::observability::logging::{init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_known_values() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_compact() {
    for input in ["invalid", "", "xml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact, "input: {input}");
    }
}

#[test]
fn test_parse_level_is_case_insensitive() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("Warn"), Level::WARN);
    assert_eq!(parse_level("DEBUG"), Level::DEBUG);
    assert_eq!(parse_level("trace"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_second_init_reports_existing_subscriber() {
    // Each integration test file is its own process, so the first call installs.
    let first = init_logging(Level::INFO, LogFormat::Compact, false);
    let second = init_logging(Level::DEBUG, LogFormat::Json, true);

    assert!(first);
    assert!(!second);
}
