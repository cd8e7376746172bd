// Data model for recurring expense templates, schedules, and execution history.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::str::FromStr;

fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(tz.name())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// Template
// ============================================================================

/// The durable, user-authored recipe for a recurring expense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
    pub expense_data: ExpenseData,
    pub scheduling: Option<Schedule>,
    /// Newest first, length <= MAX_HISTORY.
    pub execution_history: Vec<ExecutionRecord>,
    pub metadata: TemplateMetadata,
}

/// Current schema version written by this implementation.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_expense_id: Option<String>,
    pub created_from: CreatedFrom,
    pub tags: BTreeSet<String>,
    pub favorite: bool,
    pub use_count: u64,
    pub scheduled_use_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Default for TemplateMetadata {
    fn default() -> Self {
        Self {
            source_expense_id: None,
            created_from: CreatedFrom::Manual,
            tags: BTreeSet::new(),
            favorite: false,
            use_count: 0,
            scheduled_use_count: 0,
            last_used: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreatedFrom {
    Manual,
    Expense,
}

/// The opaque payload handed to the external expense-creation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseData {
    pub merchant: Merchant,
    pub merchant_amount: f64,
    pub merchant_currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ExpenseDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporting_data: Option<serde_json::Value>,
    /// Legacy policy shape carried over from older clients; resolved by the
    /// engine's fire handler into `policy_type` at execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<LegacyPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpenseDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Legacy policy shapes seen in templates created before `policy_type` existed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyPolicy {
    Object { id: String },
    Name(String),
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub enabled: bool,
    pub paused: bool,
    pub interval: ScheduleInterval,
    /// Wall-clock time of day; ignored for `Custom`.
    pub execution_time: ExecutionTime,
    #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
    pub timezone: Tz,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Cached next firing instant; authoritative in the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionTime {
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleInterval {
    Daily,
    Weekly {
        days_of_week: BTreeSet<Weekday>,
    },
    Monthly {
        day_of_month: DayOfMonth,
    },
    Custom {
        custom_interval_ms: i64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub fn from_chrono(w: chrono::Weekday) -> Self {
        use chrono::Weekday as C;
        match w {
            C::Sun => Weekday::Sun,
            C::Mon => Weekday::Mon,
            C::Tue => Weekday::Tue,
            C::Wed => Weekday::Wed,
            C::Thu => Weekday::Thu,
            C::Fri => Weekday::Fri,
            C::Sat => Weekday::Sat,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DayOfMonth {
    Day(u8),
    Last,
}

// ============================================================================
// Metadata index / queue
// ============================================================================

/// Lightweight projection of a template kept in `metadata.index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataIndexEntry {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub has_scheduling: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub tags: BTreeSet<String>,
    pub favorite: bool,
}

impl MetadataIndexEntry {
    pub fn from_template(t: &Template) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            created_at: t.created_at,
            updated_at: t.updated_at,
            has_scheduling: t.scheduling.is_some(),
            next_execution: t.scheduling.as_ref().and_then(|s| s.next_execution),
            last_used: t.metadata.last_used,
            use_count: t.metadata.use_count,
            tags: t.metadata.tags.clone(),
            favorite: t.metadata.favorite,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub template_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: QueueEntryStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Pending,
    InFlight,
    Failed,
}

// ============================================================================
// Execution history
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ExecutionRecordMetadata,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecordMetadata {
    pub execution_type: ExecutionType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Scheduled,
    Manual,
}

// ============================================================================
// Preferences
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub default_execution_time: ExecutionTime,
    pub notifications_enabled: bool,
    pub auto_cleanup_enabled: bool,
    pub retention_days: u32,
    #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
    pub timezone: Tz,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            default_execution_time: ExecutionTime { hour: 9, minute: 0 },
            notifications_enabled: true,
            auto_cleanup_enabled: false,
            retention_days: 90,
            timezone: Tz::UTC,
        }
    }
}

// ============================================================================
// List options (TemplateStore::list)
// ============================================================================

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub page: u32,
    pub limit: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub include_data: bool,
    pub filter: ListFilter,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            sort_by: SortBy::UpdatedAt,
            sort_order: SortOrder::Desc,
            include_data: false,
            filter: ListFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    UpdatedAt,
    CreatedAt,
    Name,
    UseCount,
    LastUsed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub has_scheduling: Option<bool>,
    pub favorite: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub search: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ListItem {
    Full(Box<Template>),
    Index(Box<MetadataIndexEntry>),
}

#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<ListItem>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}
