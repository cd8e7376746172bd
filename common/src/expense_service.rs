// Contract for the external expense-creation collaborator, its token
// provider, and the retry classification the engine applies around it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AuthFailure;

#[derive(Debug, Clone, Serialize)]
pub struct ExpensePayload {
    pub merchant_amount: f64,
    pub merchant_currency: String,
    pub date: chrono::NaiveDate,
    pub merchant_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reporting_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpenseReceipt {
    pub id: String,
}

/// Errors the expense service can raise, distinguished so the caller can
/// apply the retry policy (retry 5xx/429/timeout/network, never retry auth
/// or validation).
#[derive(Debug, thiserror::Error)]
pub enum ExpenseServiceError {
    #[error("expense service returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("authentication rejected: {0}")]
    Auth(#[from] AuthFailure),

    #[error("request validation failed for field {field:?}: {message}")]
    Validation { field: Option<String>, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

impl ExpenseServiceError {
    /// Whether this failure is eligible for retry under the engine's policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExpenseServiceError::Api { status, .. } => *status >= 500 || *status == 429,
            ExpenseServiceError::Timeout | ExpenseServiceError::Network(_) => true,
            ExpenseServiceError::Auth(_) | ExpenseServiceError::Validation { .. } => false,
        }
    }
}

#[async_trait]
pub trait ExpenseService: Send + Sync {
    async fn create_expense(&self, payload: ExpensePayload) -> Result<ExpenseReceipt, ExpenseServiceError>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns `Ok(None)` to signal a non-retryable auth failure, matching
    /// the contract's "null is a non-retryable auth failure" rule.
    async fn get_token(&self) -> Result<Option<String>, AuthFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(ExpenseServiceError::Api { status: 503, message: String::new() }.is_retryable());
        assert!(ExpenseServiceError::Api { status: 429, message: String::new() }.is_retryable());
        assert!(ExpenseServiceError::Timeout.is_retryable());
        assert!(ExpenseServiceError::Network("reset".to_string()).is_retryable());
    }

    #[test]
    fn auth_and_validation_errors_are_not_retryable() {
        assert!(!ExpenseServiceError::Auth(AuthFailure::TokenRejected).is_retryable());
        assert!(!ExpenseServiceError::Validation { field: None, message: String::new() }.is_retryable());
        assert!(!ExpenseServiceError::Api { status: 400, message: String::new() }.is_retryable());
    }
}
