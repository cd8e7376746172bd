// CRUD facade enforcing business rules (quota, scheduling recompute, usage
// counters) atop `TemplateStore`.

use crate::errors::{TemplateError, ValidationError};
use crate::id::generate_template_id;
use crate::models::{
    CreatedFrom, ExecutionRecord, ExpenseData, ListOptions, ListResult, Schedule, Template,
    TemplateMetadata, CURRENT_SCHEMA_VERSION,
};
use crate::schedule::ScheduleCalculator;
use crate::store::TemplateStore;
use crate::validator::Validator;
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

pub struct CreateTemplateRequest {
    pub name: String,
    pub expense_data: ExpenseData,
    pub tags: Vec<String>,
    pub created_from: CreatedFrom,
    pub source_expense_id: Option<String>,
    pub scheduling: Option<Schedule>,
}

pub struct TemplateManager {
    store: Arc<TemplateStore>,
    max_templates: usize,
}

impl TemplateManager {
    pub fn new(store: Arc<TemplateStore>, max_templates: usize) -> Self {
        Self { store, max_templates }
    }

    #[instrument(skip(self, request))]
    pub async fn create(&self, request: CreateTemplateRequest) -> Result<Template, TemplateError> {
        let outcome = Validator::validate_create(
            &request.name,
            &request.expense_data,
            &request.tags,
            request.scheduling.as_ref(),
        )
        .map_err(TemplateError::Validation)?;

        if !outcome.warnings.is_empty() {
            for w in &outcome.warnings {
                tracing::warn!(warning = %w.0, "template create warning");
            }
        }

        let now = Utc::now();
        let mut scheduling = request.scheduling;
        if let Some(schedule) = &mut scheduling {
            schedule.next_execution = ScheduleCalculator::next(schedule, now)
                .map_err(|e| TemplateError::Validation(ValidationError::Schedule(e)))?;
        }

        let template = Template {
            id: generate_template_id(),
            name: outcome.normalized.name,
            created_at: now,
            updated_at: now,
            schema_version: CURRENT_SCHEMA_VERSION,
            expense_data: request.expense_data,
            scheduling,
            execution_history: Vec::new(),
            metadata: TemplateMetadata {
                source_expense_id: request.source_expense_id,
                created_from: request.created_from,
                tags: outcome.normalized.tags,
                favorite: false,
                use_count: 0,
                scheduled_use_count: 0,
                last_used: None,
            },
        };

        self.store.create(template, self.max_templates).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Template, TemplateError> {
        self.store
            .get(id)
            .await
            .map_err(TemplateError::Storage)?
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }

    #[instrument(skip(self, name, expense_data, tags))]
    pub async fn update(
        &self,
        id: &str,
        name: Option<String>,
        expense_data: Option<ExpenseData>,
        tags: Option<Vec<String>>,
        favorite: Option<bool>,
    ) -> Result<Template, TemplateError> {
        let normalized_name = match &name {
            Some(n) => Some(Validator::validate_name(n).map_err(TemplateError::Validation)?),
            None => None,
        };
        let normalized_tags = match &tags {
            Some(t) => Some(Validator::validate_tags(t).map_err(TemplateError::Validation)?),
            None => None,
        };
        if let Some(data) = &expense_data {
            Validator::validate_expense_data(data).map_err(TemplateError::Validation)?;
        }

        self.store
            .update(id, move |t| {
                if let Some(n) = &normalized_name {
                    t.name = n.clone();
                }
                if let Some(data) = &expense_data {
                    t.expense_data = data.clone();
                }
                if let Some(tags) = &normalized_tags {
                    t.metadata.tags = tags.clone();
                }
                if let Some(fav) = favorite {
                    t.metadata.favorite = fav;
                }
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), TemplateError> {
        self.store.delete(id).await
    }

    #[instrument(skip(self, schedule))]
    pub async fn set_schedule(&self, id: &str, mut schedule: Schedule) -> Result<Template, TemplateError> {
        Validator::validate_schedule(&schedule).map_err(TemplateError::Validation)?;
        schedule.next_execution = ScheduleCalculator::next(&schedule, Utc::now())
            .map_err(|e| TemplateError::Validation(ValidationError::Schedule(e)))?;
        self.store.update_scheduling(id, Some(schedule)).await
    }

    #[instrument(skip(self))]
    pub async fn remove_schedule(&self, id: &str) -> Result<Template, TemplateError> {
        self.store.update_scheduling(id, None).await
    }

    #[instrument(skip(self))]
    pub async fn pause_schedule(&self, id: &str) -> Result<Template, TemplateError> {
        self.store
            .update(id, |t| {
                if let Some(s) = &mut t.scheduling {
                    s.paused = true;
                }
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn resume_schedule(&self, id: &str) -> Result<Template, TemplateError> {
        let now = Utc::now();
        let result = self
            .store
            .update(id, move |t| {
                if let Some(s) = &mut t.scheduling {
                    s.paused = false;
                    s.next_execution = ScheduleCalculator::next(s, now).unwrap_or(None);
                }
            })
            .await?;
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn increment_usage(&self, id: &str) -> Result<Template, TemplateError> {
        let now = Utc::now();
        self.store
            .update(id, move |t| {
                t.metadata.use_count += 1;
                t.metadata.last_used = Some(now);
            })
            .await
    }

    #[instrument(skip(self, record))]
    pub async fn append_execution(&self, id: &str, record: ExecutionRecord) -> Result<Template, TemplateError> {
        self.store.append_execution(id, record).await
    }

    #[instrument(skip(self))]
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize, TemplateError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let list = self
            .store
            .list(ListOptions { include_data: true, limit: 1000, ..Default::default() })
            .await
            .map_err(TemplateError::Storage)?;

        let mut removed = 0usize;
        for item in list.items {
            if let crate::models::ListItem::Full(template) = item {
                let before = template.execution_history.len();
                let id = template.id.clone();
                self.store
                    .update(&id, move |t| {
                        t.execution_history.retain(|r| r.executed_at >= cutoff);
                    })
                    .await?;
                let after_count = self
                    .store
                    .get(&id)
                    .await
                    .map_err(TemplateError::Storage)?
                    .map(|t| t.execution_history.len())
                    .unwrap_or(before);
                removed += before.saturating_sub(after_count);
            }
        }
        Ok(removed)
    }

    pub async fn list(&self, options: ListOptions) -> Result<ListResult, TemplateError> {
        self.store.list(options).await.map_err(TemplateError::Storage)
    }

    pub async fn count(&self) -> Result<usize, TemplateError> {
        self.store.count().await.map_err(TemplateError::Storage)
    }
}
