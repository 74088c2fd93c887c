//! Error Classifier & Resilience Policy
//!
//! - [`ErrorClassifier`] maps raw adapter failures to [`ErrorRecord`]s
//! - [`RetryPolicy`] / [`RetryState`] decide between retrying, failing over
//!   and aborting
//! - [`redact_params`] scrubs secrets before parameters reach a log line
//! - [`CredentialRefresher`] is the optional hook that makes auth failures
//!   retryable once

mod classifier;
mod redact;
mod retry;

pub use classifier::{ErrorCategory, ErrorClassifier, ErrorRecord, Severity};
pub use redact::{is_sensitive_key, redact_params};
pub use retry::{RetryDecision, RetryPolicy, RetryState};

use async_trait::async_trait;

use crate::adapter::AdapterError;

/// Renews credentials for a server after an auth failure
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, server_id: &str) -> Result<(), AdapterError>;
}
