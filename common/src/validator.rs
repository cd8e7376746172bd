// Domain rules for template and schedule payloads, independent of storage.

use crate::errors::ValidationError;
use crate::models::{ExpenseData, Schedule};
use crate::schedule::ScheduleCalculator;
use once_cell_compat::NAME_PATTERN;
use std::collections::BTreeSet;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 30;

/// A warning never blocks acceptance; it accompanies an otherwise-valid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning(pub String);

pub struct NormalizedCreate {
    pub name: String,
    pub tags: BTreeSet<String>,
}

pub struct ValidateCreateOutcome {
    pub warnings: Vec<Warning>,
    pub normalized: NormalizedCreate,
}

/// Stateless validation and normalization for template creation/update requests.
pub struct Validator;

impl Validator {
    pub fn validate_name(name: &str) -> Result<String, ValidationError> {
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.chars().count() > MAX_NAME_LEN {
            return Err(ValidationError::InvalidNameLength {
                max: MAX_NAME_LEN,
                actual: trimmed.chars().count(),
            });
        }
        if !NAME_PATTERN.is_match(trimmed) {
            return Err(ValidationError::NameContainsControlChars);
        }
        Ok(trimmed.to_string())
    }

    pub fn validate_tags(tags: &[String]) -> Result<BTreeSet<String>, ValidationError> {
        let mut normalized = BTreeSet::new();
        for tag in tags {
            let t = tag.trim().to_lowercase();
            if t.is_empty() {
                continue;
            }
            if t.chars().count() > MAX_TAG_LEN {
                return Err(ValidationError::TagTooLong { tag: t, max: MAX_TAG_LEN });
            }
            normalized.insert(t);
        }
        if normalized.len() > MAX_TAGS {
            return Err(ValidationError::TooManyTags {
                max: MAX_TAGS,
                actual: normalized.len(),
            });
        }
        Ok(normalized)
    }

    pub fn validate_expense_data(data: &ExpenseData) -> Result<Vec<Warning>, ValidationError> {
        if data.merchant.name.trim().is_empty() {
            return Err(ValidationError::InvalidNameLength { max: MAX_NAME_LEN, actual: 0 });
        }
        if data.merchant_amount <= 0.0 {
            return Err(ValidationError::NonPositiveAmount(data.merchant_amount));
        }
        if data.merchant_currency.len() != 3 || !data.merchant_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidCurrencyCode(data.merchant_currency.clone()));
        }

        let mut warnings = Vec::new();
        if data.merchant_amount > 10_000.0 {
            warnings.push(Warning(format!(
                "amount {:.2} {} seems unusually high",
                data.merchant_amount, data.merchant_currency
            )));
        }
        Ok(warnings)
    }

    pub fn validate_schedule(schedule: &Schedule) -> Result<(), ValidationError> {
        ScheduleCalculator::validate(schedule).map_err(ValidationError::from)
    }

    /// Validates a create request's name, expense data, and tags together,
    /// returning the normalized form (trimmed name, deduped/lowercased tags)
    /// and any non-blocking warnings.
    pub fn validate_create(
        name: &str,
        expense_data: &ExpenseData,
        tags: &[String],
        schedule: Option<&Schedule>,
    ) -> Result<ValidateCreateOutcome, ValidationError> {
        let normalized_name = Self::validate_name(name)?;
        let mut warnings = Self::validate_expense_data(expense_data)?;
        let normalized_tags = Self::validate_tags(tags)?;
        if let Some(s) = schedule {
            Self::validate_schedule(s)?;
        }
        warnings.retain(|w| !w.0.is_empty());
        Ok(ValidateCreateOutcome {
            warnings,
            normalized: NormalizedCreate {
                name: normalized_name,
                tags: normalized_tags,
            },
        })
    }
}

/// Small local shim so the name-character rule lives next to its use site
/// without pulling in a lazy-static dependency for a single static pattern.
mod once_cell_compat {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct LazyRegex(OnceLock<Regex>, &'static str);

    impl LazyRegex {
        pub fn is_match(&self, s: &str) -> bool {
            self.0.get_or_init(|| Regex::new(self.1).unwrap()).is_match(s)
        }
    }

    pub static NAME_PATTERN: LazyRegex = LazyRegex(OnceLock::new(), r"^[\w\s\-.]+$");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Merchant;

    fn valid_expense() -> ExpenseData {
        ExpenseData {
            merchant: Merchant { name: "Acme".to_string() },
            merchant_amount: 42.50,
            merchant_currency: "USD".to_string(),
            policy_type: None,
            details: None,
            reporting_data: None,
            policy: None,
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let tags = vec![" Travel ".to_string(), "TRAVEL".to_string(), "food".to_string()];
        let outcome = Validator::validate_create("  My Template  ", &valid_expense(), &tags, None).unwrap();
        assert_eq!(outcome.normalized.name, "My Template");
        assert_eq!(outcome.normalized.tags.len(), 2);

        let reapplied_tags: Vec<String> = outcome.normalized.tags.iter().cloned().collect();
        let second = Validator::validate_create(
            &outcome.normalized.name,
            &valid_expense(),
            &reapplied_tags,
            None,
        )
        .unwrap();
        assert_eq!(second.normalized.name, outcome.normalized.name);
        assert_eq!(second.normalized.tags, outcome.normalized.tags);
    }

    #[test]
    fn rejects_non_positive_amount() {
        let mut data = valid_expense();
        data.merchant_amount = 0.0;
        assert!(matches!(
            Validator::validate_expense_data(&data),
            Err(ValidationError::NonPositiveAmount(_))
        ));
    }

    #[test]
    fn rejects_too_many_tags() {
        let tags: Vec<String> = (0..20).map(|i| format!("tag{i}")).collect();
        assert!(matches!(
            Validator::validate_tags(&tags),
            Err(ValidationError::TooManyTags { .. })
        ));
    }

    #[test]
    fn unusually_high_amount_is_a_warning_not_an_error() {
        let mut data = valid_expense();
        data.merchant_amount = 50_000.0;
        let warnings = Validator::validate_expense_data(&data).unwrap();
        assert_eq!(warnings.len(), 1);
    }
}
