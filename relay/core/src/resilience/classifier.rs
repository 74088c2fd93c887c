//! Error Classification
//!
//! Turns raw [`AdapterError`]s into [`ErrorRecord`]s carrying a category,
//! a severity and whether another attempt on the same server makes sense.

use std::time::Duration;

use serde::Serialize;

use crate::adapter::AdapterError;

/// What kind of failure an attempt hit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    Auth,
    RateLimit,
    ServerFault,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ServerFault => "server_fault",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this failure says something about the server's health
    ///
    /// Bad input, bad credentials and throttling are the caller's problem
    /// and must not demote an otherwise working server.
    #[must_use]
    pub fn penalizes_server(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::ServerFault | Self::Unknown
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How bad a failure is
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified failure of one attempt
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub retryable: bool,
    pub origin_method: String,
    /// Attempt number on the server that failed, starting at 1
    pub attempt: u32,
    pub cause: String,
    /// Server-supplied delay hint
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl ErrorRecord {
    /// Mark the record as the last word on a server after its budget ran out
    pub fn exhausted(mut self) -> Self {
        if self.category == ErrorCategory::ServerFault {
            self.severity = Severity::High;
        }
        self.retryable = false;
        self
    }
}

/// Maps adapter failures to error records
#[derive(Clone, Debug, Default)]
pub struct ErrorClassifier {
    /// A credential refresh hook is available, so auth failures get one more try
    auth_refresh: bool,
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier for a dispatcher that has a credential refresher
    pub fn with_auth_refresh(mut self, enabled: bool) -> Self {
        self.auth_refresh = enabled;
        self
    }

    /// Classify one failed attempt
    pub fn classify(&self, error: &AdapterError, method: &str, attempt: u32) -> ErrorRecord {
        let (category, retry_after) = match error {
            AdapterError::InvalidRequest(_) => (ErrorCategory::Validation, None),
            AdapterError::AuthenticationFailed(_) => (ErrorCategory::Auth, None),
            AdapterError::RateLimited { retry_after } => (ErrorCategory::RateLimit, *retry_after),
            AdapterError::ConnectionFailed(_) => (ErrorCategory::Network, None),
            AdapterError::Timeout(_) => (ErrorCategory::Timeout, None),
            AdapterError::ServerFault { .. } => (ErrorCategory::ServerFault, None),
            AdapterError::Other(message) => (classify_message(message), None),
        };

        let (retryable, severity) = match category {
            ErrorCategory::Validation => (false, Severity::Medium),
            ErrorCategory::Auth => (self.auth_refresh, Severity::High),
            ErrorCategory::RateLimit => (true, Severity::Low),
            ErrorCategory::Network | ErrorCategory::Timeout => (true, Severity::Medium),
            ErrorCategory::ServerFault => (true, Severity::Medium),
            ErrorCategory::Unknown => (true, Severity::Medium),
        };

        ErrorRecord {
            category,
            severity,
            retryable,
            origin_method: method.to_string(),
            attempt,
            cause: error.to_string(),
            retry_after,
        }
    }
}

/// Best-effort bucketing of free-form failure messages
fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timed out", "timeout", "deadline"]) {
        ErrorCategory::Timeout
    } else if has(&["econnreset", "econnrefused", "enotfound", "dns", "connection reset"]) {
        ErrorCategory::Network
    } else if has(&["rate limit", "too many requests", "quota"]) {
        ErrorCategory::RateLimit
    } else if has(&["unauthorized", "forbidden", "permission denied", "invalid token"]) {
        ErrorCategory::Auth
    } else if has(&["validation", "invalid argument", "schema"]) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}
