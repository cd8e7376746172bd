// Transactional persistence for templates, the metadata index, the
// scheduling queue, and preferences, fronted by a private read cache.

use crate::cache::ReadCache;
use crate::db::kv::KvBackend;
use crate::errors::{StorageError, TemplateError};
use crate::models::{
    ExecutionOutcome, ExecutionRecord, ListFilter, ListItem, ListOptions, ListResult,
    MetadataIndexEntry, Preferences, QueueEntry, QueueEntryStatus, Schedule, SortBy, SortOrder,
    Template,
};
use chrono::Utc;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use tracing::instrument;

const METADATA_INDEX_KEY: &str = "metadata.index";
const QUEUE_KEY: &str = "queue";
const PREFERENCES_KEY: &str = "preferences";

fn template_key(id: &str) -> String {
    format!("template.{id}")
}

/// Transactional persistence over templates. Exposes no direct key access;
/// every operation reads and writes through a single transaction.
pub struct TemplateStore {
    kv: KvBackend,
    cache: ReadCache,
    max_history: usize,
}

impl TemplateStore {
    pub fn new(kv: KvBackend, max_history: usize) -> Self {
        Self {
            kv,
            cache: ReadCache::new(),
            max_history,
        }
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(self.kv.pool())
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }

    async fn load_index(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<HashMap<String, MetadataIndexEntry>, StorageError> {
        match KvBackend::get(tx, METADATA_INDEX_KEY).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                key: METADATA_INDEX_KEY.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(HashMap::new()),
        }
    }

    async fn save_index(
        tx: &mut Transaction<'_, Postgres>,
        index: &HashMap<String, MetadataIndexEntry>,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(index).expect("metadata index always serializes");
        KvBackend::set(tx, METADATA_INDEX_KEY, &value).await
    }

    async fn load_queue(
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<QueueEntry>, StorageError> {
        match KvBackend::get(tx, QUEUE_KEY).await? {
            Some(value) => serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                key: QUEUE_KEY.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn save_queue(
        tx: &mut Transaction<'_, Postgres>,
        queue: &[QueueEntry],
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(queue).expect("queue always serializes");
        KvBackend::set(tx, QUEUE_KEY, &value).await
    }

    async fn load_template_tx(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
    ) -> Result<Option<Template>, StorageError> {
        match KvBackend::get(tx, &template_key(id)).await? {
            Some(value) => {
                let template = serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                    key: template_key(id),
                    reason: e.to_string(),
                })?;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    async fn save_template_tx(
        tx: &mut Transaction<'_, Postgres>,
        template: &Template,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(template).expect("template always serializes");
        KvBackend::set(tx, &template_key(&template.id), &value).await
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        self.kv
            .transaction(|tx| {
                Box::pin(async move {
                    let index = Self::load_index(tx).await?;
                    Ok(index.len())
                })
            })
            .await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        if self.cache.get(&template_key(id)).is_some() {
            return Ok(true);
        }
        let id = id.to_string();
        self.kv
            .transaction(move |tx| {
                let id = id.clone();
                Box::pin(async move { Ok(Self::load_template_tx(tx, &id).await?.is_some()) })
            })
            .await
    }

    /// Checks the template-count quota and inserts the new template in one
    /// transaction, so two concurrent creators can never both observe
    /// `count < max_templates` and both commit (the TOCTOU spec.md §4.4
    /// warns against).
    #[instrument(skip(self, template))]
    pub async fn create(&self, template: Template, max_templates: usize) -> Result<Template, TemplateError> {
        let result = self
            .kv
            .transaction({
                let template = template.clone();
                move |tx| {
                    let template = template.clone();
                    Box::pin(async move {
                        let mut index = Self::load_index(tx).await?;
                        if index.len() >= max_templates {
                            return Err(StorageError::LimitExceeded { max: max_templates });
                        }

                        Self::save_template_tx(tx, &template).await?;

                        index.insert(template.id.clone(), MetadataIndexEntry::from_template(&template));
                        Self::save_index(tx, &index).await?;

                        Self::sync_queue_entry(tx, &template).await?;
                        Ok(template.clone())
                    })
                }
            })
            .await;

        let result = match result {
            Ok(t) => t,
            Err(StorageError::LimitExceeded { max }) => return Err(TemplateError::LimitExceeded { max }),
            Err(e) => return Err(TemplateError::Storage(e)),
        };

        self.cache.invalidate(&template_key(&result.id));
        self.cache.invalidate(METADATA_INDEX_KEY);
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Template>, StorageError> {
        if let Some(cached) = self.cache.get(&template_key(id)) {
            return Ok(Some(serde_json::from_value(cached).map_err(|e| StorageError::Corrupt {
                key: template_key(id),
                reason: e.to_string(),
            })?));
        }

        let id_owned = id.to_string();
        let template = self
            .kv
            .transaction(move |tx| {
                let id = id_owned.clone();
                Box::pin(async move { Self::load_template_tx(tx, &id).await })
            })
            .await?;

        if let Some(t) = &template {
            self.cache.put(template_key(id), serde_json::to_value(t).unwrap());
        }
        Ok(template)
    }

    /// Applies `mutate` to the current template (preserving `id`/`created_at`
    /// and merging `metadata` rather than replacing it is the caller's
    /// responsibility, as with `TemplateManager::update`), then rewrites the
    /// metadata index and queue entry to match.
    #[instrument(skip(self, mutate))]
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Template, TemplateError>
    where
        F: Fn(&mut Template) + Send + Sync,
    {
        let id_owned = id.to_string();
        let result = self
            .kv
            .transaction(move |tx| {
                let id = id_owned.clone();
                let mutate = &mutate;
                Box::pin(async move {
                    let mut template = Self::load_template_tx(tx, &id)
                        .await?
                        .ok_or_else(|| StorageError::Corrupt {
                            key: template_key(&id),
                            reason: "not found".to_string(),
                        })?;
                    mutate(&mut template);
                    template.updated_at = Utc::now();
                    Self::save_template_tx(tx, &template).await?;

                    let mut index = Self::load_index(tx).await?;
                    index.insert(template.id.clone(), MetadataIndexEntry::from_template(&template));
                    Self::save_index(tx, &index).await?;

                    Self::sync_queue_entry(tx, &template).await?;
                    Ok(template)
                })
            })
            .await;

        match result {
            Ok(template) => {
                self.cache.invalidate(&template_key(id));
                self.cache.invalidate(METADATA_INDEX_KEY);
                Ok(template)
            }
            Err(StorageError::Corrupt { reason, .. }) if reason == "not found" => {
                Err(TemplateError::NotFound(id.to_string()))
            }
            Err(e) => Err(TemplateError::Storage(e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), TemplateError> {
        let id_owned = id.to_string();
        let found = self
            .kv
            .transaction(move |tx| {
                let id = id_owned.clone();
                Box::pin(async move {
                    let existed = Self::load_template_tx(tx, &id).await?.is_some();
                    if !existed {
                        return Ok(false);
                    }
                    KvBackend::remove(tx, &template_key(&id)).await?;

                    let mut index = Self::load_index(tx).await?;
                    index.remove(&id);
                    Self::save_index(tx, &index).await?;

                    let mut queue = Self::load_queue(tx).await?;
                    queue.retain(|e| e.template_id != id);
                    Self::save_queue(tx, &queue).await?;

                    Ok(true)
                })
            })
            .await
            .map_err(TemplateError::Storage)?;

        if !found {
            return Err(TemplateError::NotFound(id.to_string()));
        }
        self.cache.invalidate(&template_key(id));
        self.cache.invalidate(METADATA_INDEX_KEY);
        Ok(())
    }

    /// Writes the template, rebuilds its index entry, and recomputes its
    /// queue membership in one transaction.
    #[instrument(skip(self, schedule))]
    pub async fn update_scheduling(
        &self,
        id: &str,
        schedule: Option<Schedule>,
    ) -> Result<Template, TemplateError> {
        self.update(id, move |t| t.scheduling = schedule.clone()).await
    }

    async fn sync_queue_entry(
        tx: &mut Transaction<'_, Postgres>,
        template: &Template,
    ) -> Result<(), StorageError> {
        let mut queue = Self::load_queue(tx).await?;
        queue.retain(|e| e.template_id != template.id);

        if let Some(schedule) = &template.scheduling {
            if schedule.enabled && !schedule.paused {
                if let Some(next) = schedule.next_execution {
                    queue.push(QueueEntry {
                        template_id: template.id.clone(),
                        scheduled_for: next,
                        status: QueueEntryStatus::Pending,
                        attempts: 0,
                    });
                }
            }
        }

        Self::save_queue(tx, &queue).await
    }

    #[instrument(skip(self, record))]
    pub async fn append_execution(
        &self,
        id: &str,
        record: ExecutionRecord,
    ) -> Result<Template, TemplateError> {
        let max_history = self.max_history;
        self.update(id, move |t| {
            t.execution_history.insert(0, record.clone());
            t.execution_history.truncate(max_history);
            if matches!(record.status, ExecutionOutcome::Success) {
                t.metadata.scheduled_use_count += 1;
                t.metadata.last_used = Some(record.executed_at);
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list(&self, options: ListOptions) -> Result<ListResult, StorageError> {
        let index = self
            .kv
            .transaction(|tx| Box::pin(async move { Self::load_index(tx).await }))
            .await?;

        let mut entries: Vec<MetadataIndexEntry> = index.into_values().collect();
        apply_filter(&mut entries, &options.filter);
        entries.sort_by(|a, b| compare_entries(a, b, options.sort_by));
        if options.sort_order == SortOrder::Desc {
            entries.reverse();
        }

        let total = entries.len() as u64;
        let start = ((options.page.max(1) - 1) as usize) * options.limit as usize;
        let page_slice: Vec<MetadataIndexEntry> = entries.into_iter().skip(start).take(options.limit as usize).collect();
        let has_more = (start + page_slice.len()) < total as usize;

        let items = if options.include_data {
            let mut full = Vec::with_capacity(page_slice.len());
            for entry in &page_slice {
                if let Some(t) = self.get(&entry.id).await? {
                    full.push(ListItem::Full(Box::new(t)));
                }
            }
            full
        } else {
            page_slice.into_iter().map(|e| ListItem::Index(Box::new(e))).collect()
        };

        Ok(ListResult {
            items,
            total,
            page: options.page,
            page_size: options.limit,
            has_more,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_preferences(&self) -> Result<Preferences, StorageError> {
        self.kv
            .transaction(|tx| {
                Box::pin(async move {
                    match KvBackend::get(tx, PREFERENCES_KEY).await? {
                        Some(value) => serde_json::from_value(value).map_err(|e| StorageError::Corrupt {
                            key: PREFERENCES_KEY.to_string(),
                            reason: e.to_string(),
                        }),
                        None => Ok(Preferences::default()),
                    }
                })
            })
            .await
    }

    #[instrument(skip(self, preferences))]
    pub async fn update_preferences(&self, preferences: Preferences) -> Result<(), StorageError> {
        self.kv
            .transaction(move |tx| {
                let value = serde_json::to_value(&preferences).expect("preferences always serialize");
                Box::pin(async move { KvBackend::set(tx, PREFERENCES_KEY, &value).await })
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn load_queue_snapshot(&self) -> Result<Vec<QueueEntry>, StorageError> {
        self.kv
            .transaction(|tx| Box::pin(async move { Self::load_queue(tx).await }))
            .await
    }
}

fn apply_filter(entries: &mut Vec<MetadataIndexEntry>, filter: &ListFilter) {
    if let Some(has_scheduling) = filter.has_scheduling {
        entries.retain(|e| e.has_scheduling == has_scheduling);
    }
    if let Some(favorite) = filter.favorite {
        entries.retain(|e| e.favorite == favorite);
    }
    if let Some(tags) = &filter.tags {
        entries.retain(|e| tags.iter().any(|t| e.tags.contains(t)));
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        entries.retain(|e| e.name.to_lowercase().contains(&needle));
    }
}

fn compare_entries(a: &MetadataIndexEntry, b: &MetadataIndexEntry, sort_by: SortBy) -> std::cmp::Ordering {
    match sort_by {
        SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
        SortBy::Name => a.name.cmp(&b.name),
        SortBy::UseCount => a.use_count.cmp(&b.use_count),
        SortBy::LastUsed => a.last_used.cmp(&b.last_used),
    }
}
