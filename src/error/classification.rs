/// Error classification for recovery strategy selection
///
/// Every failure observed during a sync is mapped to one of the [`ErrorType`]
/// categories. The resulting [`ErrorContext`] is what gets logged, metriced and
/// handed to the recovery resolver.
use crate::SyncError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Provider codes for missing buckets/keys and denied access
pub const STORAGE_CODES: &[&str] = &["NoSuchBucket", "NoSuchKey", "AccessDenied"];

/// Provider codes for malformed requests
pub const VALIDATION_CODES: &[&str] = &["InvalidRequest", "MalformedPolicy"];

/// Provider codes for throttling and rate limits
pub const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "SlowDown",
];

/// Provider codes for bad signatures and credentials
pub const AUTHENTICATION_CODES: &[&str] = &["SignatureDoesNotMatch", "InvalidAccessKeyId"];

/// Category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    /// Connection failures and transport timeouts
    #[serde(rename = "network_error")]
    Network,

    /// Object store failures (missing objects, denied access, other provider codes)
    #[serde(rename = "s3_error")]
    Storage,

    /// Malformed input or requests, never fixed by retrying
    #[serde(rename = "validation_error")]
    Validation,

    /// Ledger inconsistency, remedied by a rebuild
    #[serde(rename = "hash_corruption")]
    HashCorruption,

    /// Throttling and rate limits
    #[serde(rename = "resource_exhaustion")]
    ResourceExhaustion,

    /// Timeouts reported through error messages
    #[serde(rename = "timeout_error")]
    Timeout,

    /// Bad credentials or denied permissions
    #[serde(rename = "authentication_error")]
    Authentication,

    /// Shutdown requested
    #[serde(rename = "cancelled")]
    Cancelled,

    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorType {
    /// Stable identifier used in logs and metric dimensions
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Network => "network_error",
            ErrorType::Storage => "s3_error",
            ErrorType::Validation => "validation_error",
            ErrorType::HashCorruption => "hash_corruption",
            ErrorType::ResourceExhaustion => "resource_exhaustion",
            ErrorType::Timeout => "timeout_error",
            ErrorType::Authentication => "authentication_error",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Unknown => "unknown_error",
        }
    }

    /// Get human-readable description of error type
    pub fn description(&self) -> &'static str {
        match self {
            ErrorType::Network => "Network failure that may resolve on retry",
            ErrorType::Storage => "Object storage failure",
            ErrorType::Validation => "Invalid data or request",
            ErrorType::HashCorruption => "Hash file inconsistency requiring rebuild",
            ErrorType::ResourceExhaustion => "Rate limited or throttled",
            ErrorType::Timeout => "Operation exceeded its time budget",
            ErrorType::Authentication => "Credentials rejected, needs operator attention",
            ErrorType::Cancelled => "Operation cancelled by shutdown request",
            ErrorType::Unknown => "Unclassified failure",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context information about one failure occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_type: ErrorType,

    pub error_message: String,

    /// Call site (e.g., "download_json", "upload_bottle")
    pub operation: String,

    /// Bottle or object the failure relates to
    pub resource_id: Option<String>,

    /// 1-based attempt number the failure happened on
    pub attempt_number: u32,

    pub timestamp: DateTime<Utc>,

    /// Rendered error and its source chain
    pub stack_trace: Option<String>,

    pub metadata: HashMap<String, String>,
}

impl ErrorContext {
    /// Create a context for an already known error type
    pub fn new(
        error_type: ErrorType,
        error_message: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            error_message: error_message.into(),
            operation: operation.into(),
            resource_id: None,
            attempt_number: 1,
            timestamp: Utc::now(),
            stack_trace: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the resource the failure relates to
    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set the attempt number (1-based)
    pub fn with_attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number.max(1);
        self
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Timestamp as ISO-8601 UTC with a trailing `Z`
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} (attempt {}): {}",
            self.error_type, self.operation, self.attempt_number, self.error_message
        )
    }
}

/// Error classifier - maps a failure to its [`ErrorType`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error raised by `operation` on its first attempt
    pub fn classify(&self, error: &SyncError, operation: &str) -> ErrorContext {
        let mut context = ErrorContext::new(
            Self::determine_error_type(error),
            error.to_string(),
            operation,
        );
        context.stack_trace = Some(render_error_chain(error));
        context
            .metadata
            .insert("exception_type".into(), error.variant_name().into());
        context
            .metadata
            .insert("exception_module".into(), module_path!().into());
        if let Some(code) = error.storage_code() {
            context.metadata.insert("error_code".into(), code.into());
        }
        context
    }

    /// Classify an error that happened on a later attempt
    pub fn classify_attempt(&self, error: &SyncError, operation: &str, attempt: u32) -> ErrorContext {
        self.classify(error, operation).with_attempt(attempt)
    }

    /// Determine the error type; first matching rule wins
    pub fn determine_error_type(error: &SyncError) -> ErrorType {
        match error {
            SyncError::Cancelled => return ErrorType::Cancelled,

            SyncError::Connection(_) | SyncError::Timeout(_) => return ErrorType::Network,

            SyncError::Storage { code, .. } => return Self::classify_storage_code(code),

            SyncError::Validation(_) | SyncError::MissingField(_) | SyncError::Json(_) => {
                return ErrorType::Validation
            }

            SyncError::PermissionDenied(_) => return ErrorType::Authentication,

            SyncError::Io(io_err) => {
                if let Some(error_type) = Self::classify_io_error(io_err) {
                    return error_type;
                }
            }

            SyncError::Http(_) | SyncError::Config(_) | SyncError::Other(_) => {}
        }

        let message = error.to_string().to_lowercase();
        if message.contains("timeout") {
            ErrorType::Timeout
        } else if message.contains("hash") || message.contains("corruption") {
            ErrorType::HashCorruption
        } else {
            ErrorType::Unknown
        }
    }

    /// Classify a provider error code
    fn classify_storage_code(code: &str) -> ErrorType {
        if STORAGE_CODES.contains(&code) {
            ErrorType::Storage
        } else if VALIDATION_CODES.contains(&code) {
            ErrorType::Validation
        } else if THROTTLING_CODES.contains(&code) {
            ErrorType::ResourceExhaustion
        } else if AUTHENTICATION_CODES.contains(&code) {
            ErrorType::Authentication
        } else {
            ErrorType::Storage
        }
    }

    /// I/O kinds that map directly; others fall through to message checks
    fn classify_io_error(io_err: &std::io::Error) -> Option<ErrorType> {
        use std::io::ErrorKind;

        match io_err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe => Some(ErrorType::Network),
            ErrorKind::PermissionDenied => Some(ErrorType::Authentication),
            _ => None,
        }
    }
}

/// Render an error followed by its `source()` chain
fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn classify(error: SyncError) -> ErrorType {
        ErrorClassifier::new().classify(&error, "test_op").error_type
    }

    #[test]
    fn test_connection_and_timeout_are_network() {
        assert_eq!(classify(SyncError::Connection("reset".into())), ErrorType::Network);
        assert_eq!(classify(SyncError::Timeout("read".into())), ErrorType::Network);
        assert_eq!(
            classify(SyncError::Io(io::Error::new(io::ErrorKind::TimedOut, "t"))),
            ErrorType::Network
        );
    }

    #[test]
    fn test_storage_codes() {
        assert_eq!(classify(SyncError::storage("NoSuchKey", "gone")), ErrorType::Storage);
        assert_eq!(classify(SyncError::storage("AccessDenied", "no")), ErrorType::Storage);
        assert_eq!(
            classify(SyncError::storage("MalformedPolicy", "bad")),
            ErrorType::Validation
        );
        assert_eq!(
            classify(SyncError::storage("Throttling", "slow")),
            ErrorType::ResourceExhaustion
        );
        assert_eq!(
            classify(SyncError::storage("RequestLimitExceeded", "slow")),
            ErrorType::ResourceExhaustion
        );
        assert_eq!(
            classify(SyncError::storage("SignatureDoesNotMatch", "sig")),
            ErrorType::Authentication
        );
        assert_eq!(
            classify(SyncError::storage("InternalError", "boom")),
            ErrorType::Storage
        );
    }

    #[test]
    fn test_validation_and_permission() {
        assert_eq!(classify(SyncError::Validation("x".into())), ErrorType::Validation);
        assert_eq!(classify(SyncError::MissingField("sha256".into())), ErrorType::Validation);
        assert_eq!(classify(SyncError::Json("eof".into())), ErrorType::Validation);
        assert_eq!(
            classify(SyncError::PermissionDenied("root".into())),
            ErrorType::Authentication
        );
        assert_eq!(
            classify(SyncError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro"))),
            ErrorType::Authentication
        );
    }

    #[test]
    fn test_message_rules() {
        assert_eq!(
            classify(SyncError::Other("gateway TIMEOUT while streaming".into())),
            ErrorType::Timeout
        );
        assert_eq!(
            classify(SyncError::Other("hash mismatch for wget".into())),
            ErrorType::HashCorruption
        );
        assert_eq!(
            classify(SyncError::Http("ledger corruption detected".into())),
            ErrorType::HashCorruption
        );
        assert_eq!(classify(SyncError::Other("boom".into())), ErrorType::Unknown);
        assert_eq!(
            classify(SyncError::Io(io::Error::new(io::ErrorKind::NotFound, "missing"))),
            ErrorType::Unknown
        );
    }

    #[test]
    fn test_cancelled_is_its_own_type() {
        assert_eq!(classify(SyncError::Cancelled), ErrorType::Cancelled);
    }

    #[test]
    fn test_context_carries_chain_and_metadata() {
        let error = SyncError::Io(io::Error::new(io::ErrorKind::Other, "disk gone"));
        let context = ErrorClassifier::new()
            .classify(&error, "download_file")
            .with_resource("wget-1.0-monterey")
            .with_attempt(3);

        assert_eq!(context.operation, "download_file");
        assert_eq!(context.attempt_number, 3);
        assert_eq!(context.resource_id.as_deref(), Some("wget-1.0-monterey"));
        assert_eq!(
            context.metadata.get("exception_type").map(String::as_str),
            Some("Io")
        );
        let trace = context.stack_trace.as_deref().unwrap();
        assert!(trace.contains("disk gone"));
        assert!(trace.contains("caused by"));
        assert!(context.timestamp_iso().ends_with('Z'));
    }

    #[test]
    fn test_storage_code_recorded() {
        let context =
            ErrorClassifier::new().classify(&SyncError::storage("NoSuchKey", "k"), "get");
        assert_eq!(
            context.metadata.get("error_code").map(String::as_str),
            Some("NoSuchKey")
        );
    }

    #[test]
    fn test_error_type_serde_names() {
        let json = serde_json::to_string(&ErrorType::Storage).unwrap();
        assert_eq!(json, "\"s3_error\"");
        assert_eq!(ErrorType::ResourceExhaustion.to_string(), "resource_exhaustion");
    }
}
