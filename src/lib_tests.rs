// Tests for lib.rs core types
//
// Tests cover: interrupt handling, SyncError display, helpers, conversions and Clone.

use super::*;
use serial_test::serial;

// ==================== INTERRUPT HANDLING TESTS ====================

#[test]
#[serial]
fn test_interrupt_initially_not_set() {
    reset_interrupted();
    assert!(
        !is_interrupted(),
        "Interrupt flag should initially be not set"
    );
}

#[test]
#[serial]
fn test_set_and_reset_interrupt_flag() {
    reset_interrupted();
    set_interrupted();
    assert!(is_interrupted(), "Interrupt flag should be set");
    assert!(is_interrupted(), "Flag should remain set on subsequent calls");

    reset_interrupted();
    assert!(!is_interrupted());
}

// ==================== SYNC ERROR TESTS ====================

#[test]
fn test_storage_error_helpers() {
    let err = SyncError::storage("SlowDown", "Please reduce your request rate");
    assert_eq!(err.storage_code(), Some("SlowDown"));
    assert_eq!(err.variant_name(), "Storage");
    assert!(err.to_string().contains("SlowDown"));
    assert!(err.to_string().contains("reduce your request rate"));

    assert_eq!(SyncError::Timeout("read".into()).storage_code(), None);
}

#[test]
fn test_error_display() {
    assert!(SyncError::Connection("reset by peer".into())
        .to_string()
        .contains("Connection error"));
    assert!(SyncError::MissingField("sha256".into())
        .to_string()
        .contains("sha256"));
    assert_eq!(SyncError::Cancelled.to_string(), "Operation cancelled");
    assert_eq!(SyncError::Other("plain".into()).to_string(), "plain");
}

#[test]
fn test_io_error_conversion_and_clone() {
    let err: SyncError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
    assert_eq!(err.variant_name(), "Io");

    let cloned = err.clone();
    match cloned {
        SyncError::Io(inner) => {
            assert_eq!(inner.kind(), std::io::ErrorKind::PermissionDenied);
            assert!(inner.to_string().contains("denied"));
        }
        other => panic!("expected Io, got {:?}", other),
    }
}

#[test]
fn test_json_error_conversion() {
    let parse = serde_json::from_str::<serde_json::Value>("{broken").unwrap_err();
    let err: SyncError = parse.into();
    assert_eq!(err.variant_name(), "Json");
    assert!(err.to_string().starts_with("Invalid JSON"));
}

#[test]
fn test_config_error_conversion() {
    let missing = ::config::Config::builder()
        .add_source(::config::File::with_name("/nonexistent/bottle-sync").required(true))
        .build()
        .unwrap_err();
    let expected = missing.to_string();

    let err: SyncError = missing.into();
    assert!(matches!(err, SyncError::Config(ref msg) if *msg == expected));
    assert_eq!(err.variant_name(), "Config");
}

#[test]
fn test_anyhow_conversion_keeps_message() {
    let err: SyncError = anyhow::anyhow!("wrapped failure").into();
    assert!(err.to_string().contains("wrapped failure"));
}

#[test]
fn test_variant_names_are_distinct() {
    let errors = [
        SyncError::Connection(String::new()),
        SyncError::Timeout(String::new()),
        SyncError::storage("", ""),
        SyncError::Validation(String::new()),
        SyncError::MissingField(String::new()),
        SyncError::PermissionDenied(String::new()),
        SyncError::Json(String::new()),
        SyncError::Http(String::new()),
        SyncError::Config(String::new()),
        SyncError::Cancelled,
        SyncError::Other(String::new()),
    ];
    let names: std::collections::HashSet<&str> = errors.iter().map(|e| e.variant_name()).collect();
    assert_eq!(names.len(), errors.len());
}
