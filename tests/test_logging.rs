//! Tests for logging configuration and format parsing

use tbagent::observability::logging::{init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_known_formats() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("PRETTY"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Compact"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_log_format_parse_whitespace() {
    assert!(matches!(LogFormat::parse("  pretty  "), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("compact\n"), LogFormat::Compact));
}

#[test]
fn test_parse_level() {
    let cases = [
        ("ERROR", Level::ERROR),
        ("warn", Level::WARN),
        ("Debug", Level::DEBUG),
        (" trace ", Level::TRACE),
        ("info", Level::INFO),
        ("", Level::INFO),
        ("verbose", Level::INFO),
    ];
    for (input, expected) in cases {
        assert_eq!(parse_level(input), expected, "input {input:?}");
    }
}

#[test]
fn test_second_init_is_refused() {
    // whichever call wins, a later one must not panic
    init_logging(Level::INFO, LogFormat::Compact, false);
    assert!(!init_logging(Level::DEBUG, LogFormat::Json, true));
}
