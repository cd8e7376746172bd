// Error taxonomy for the template scheduling engine and its public API envelope.

use thiserror::Error;

/// Errors raised while computing or validating a schedule's next execution.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("day_of_month must be 1-31 or 'last', got {0}")]
    InvalidDayOfMonth(String),

    #[error("days_of_week must not be empty for a weekly schedule")]
    EmptyWeeklyDays,

    #[error("custom interval {interval_ms}ms is below the minimum of {min_ms}ms")]
    CustomIntervalTooShort { interval_ms: i64, min_ms: i64 },

    #[error("custom interval {interval_ms}ms exceeds the maximum of {max_ms}ms")]
    CustomIntervalTooLong { interval_ms: i64, max_ms: i64 },

    #[error("end_date {end_date} is before start_date {start_date}")]
    EndBeforeStart {
        start_date: chrono::DateTime<chrono::Utc>,
        end_date: chrono::DateTime<chrono::Utc>,
    },

    #[error("schedule has no remaining executions: end_date {0} has passed")]
    ScheduleExhausted(chrono::DateTime<chrono::Utc>),

    #[error("unknown IANA timezone '{0}'")]
    UnknownTimezone(String),
}

/// Errors raised by the `Validator` on template creation/update.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("name must be 1-{max} characters, got {actual}")]
    InvalidNameLength { max: usize, actual: usize },

    #[error("name contains control characters")]
    NameContainsControlChars,

    #[error("merchant_amount must be positive, got {0}")]
    NonPositiveAmount(f64),

    #[error("merchant_currency '{0}' is not a recognized ISO 4217 code")]
    InvalidCurrencyCode(String),

    #[error("tag '{tag}' exceeds {max} characters")]
    TagTooLong { tag: String, max: usize },

    #[error("a template may carry at most {max} tags, got {actual}")]
    TooManyTags { max: usize, actual: usize },

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Errors surfaced by `TemplateManager`/`TemplateStore` at the template level.
#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template '{0}' was not found")]
    NotFound(String),

    #[error("account has reached the maximum of {max} templates")]
    LimitExceeded { max: usize },

    #[error("template '{0}' was modified concurrently; retry the operation")]
    ConcurrentModification(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored value for key '{key}' failed to deserialize: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("transaction aborted after {attempts} attempts due to repeated conflicts")]
    TransactionConflict { attempts: u32 },

    #[error("account has reached the maximum of {max} templates")]
    LimitExceeded { max: usize },
}

/// Errors from driving a template through the scheduled execution path.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("expense service rejected the request: {0}")]
    ExpenseServiceRejected(String),

    #[error("expense service call timed out after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors obtaining or validating a token via `TokenProvider`.
#[derive(Error, Debug)]
pub enum AuthFailure {
    #[error("token provider could not produce a token: {0}")]
    TokenUnavailable(String),

    #[error("token was rejected by the expense service as expired or invalid")]
    TokenRejected,
}

/// A stable, serializable error envelope returned across the `common` crate
/// boundary, independent of the originating error's Rust type.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<&ScheduleError> for ApiError {
    fn from(err: &ScheduleError) -> Self {
        ApiError::new("SCHEDULE_INVALID", err.to_string())
    }
}

impl From<&ValidationError> for ApiError {
    fn from(err: &ValidationError) -> Self {
        match err {
            ValidationError::Schedule(inner) => inner.into(),
            other => ApiError::new("VALIDATION_FAILED", other.to_string()),
        }
    }
}

impl From<&TemplateError> for ApiError {
    fn from(err: &TemplateError) -> Self {
        match err {
            TemplateError::NotFound(_) => ApiError::new("TEMPLATE_NOT_FOUND", err.to_string()),
            TemplateError::LimitExceeded { .. } => {
                ApiError::new("TEMPLATE_LIMIT_EXCEEDED", err.to_string())
            }
            TemplateError::ConcurrentModification(_) => {
                ApiError::new("TEMPLATE_CONFLICT", err.to_string())
            }
            TemplateError::Validation(inner) => inner.into(),
            TemplateError::Storage(inner) => inner.into(),
        }
    }
}

impl From<&StorageError> for ApiError {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::LimitExceeded { .. } => {
                ApiError::new("TEMPLATE_LIMIT_EXCEEDED", err.to_string())
            }
            other => ApiError::new("STORAGE_ERROR", other.to_string()),
        }
    }
}

impl From<&ExecutionError> for ApiError {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::ExpenseServiceRejected(_) => {
                ApiError::new("EXPENSE_SERVICE_REJECTED", err.to_string())
            }
            ExecutionError::ExhaustedRetries { .. } => {
                ApiError::new("EXPENSE_SERVICE_UNAVAILABLE", err.to_string())
            }
            ExecutionError::Auth(_) => ApiError::new("AUTH_FAILED", err.to_string()),
            ExecutionError::Storage(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_not_found_maps_to_stable_code() {
        let err = TemplateError::NotFound("tmpl_1".to_string());
        let api: ApiError = (&err).into();
        assert_eq!(api.code, "TEMPLATE_NOT_FOUND");
    }

    #[test]
    fn nested_schedule_error_surfaces_schedule_code() {
        let err = ValidationError::Schedule(ScheduleError::EmptyWeeklyDays);
        let api: ApiError = (&err).into();
        assert_eq!(api.code, "SCHEDULE_INVALID");
    }
}
