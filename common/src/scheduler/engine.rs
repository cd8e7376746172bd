// Binds schedules to the host timer facility, dedupes concurrent firings,
// drives one execution through the expense service, and reschedules.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, instrument, warn};

use crate::errors::ExecutionError;
use crate::expense_service::{ExpensePayload, ExpenseService, ExpenseServiceError, TokenProvider};
use crate::manager::TemplateManager;
use crate::models::{
    ExecutionOutcome, ExecutionRecord, ExecutionRecordMetadata, ExecutionType, LegacyPolicy,
    QueueEntryStatus, Template,
};
use crate::notifier::{Notification, Notifier, Priority};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::schedule::ScheduleCalculator;
use crate::scheduler::timer::HostTimerFacility;
use crate::store::TemplateStore;

const TIMER_NAME_PREFIX: &str = "template_schedule_";

fn timer_name(template_id: &str) -> String {
    format!("{TIMER_NAME_PREFIX}{template_id}")
}

fn template_id_from_timer(name: &str) -> Option<&str> {
    name.strip_prefix(TIMER_NAME_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScheduleState {
    Unbound,
    Armed,
    Firing,
    DisabledTerminal,
}

pub struct SchedulingEngineConfig {
    pub dedup_window: ChronoDuration,
    pub dedup_eviction: ChronoDuration,
}

impl Default for SchedulingEngineConfig {
    fn default() -> Self {
        Self {
            dedup_window: ChronoDuration::seconds(30),
            dedup_eviction: ChronoDuration::seconds(300),
        }
    }
}

pub struct SchedulingEngine {
    manager: Arc<TemplateManager>,
    store: Arc<TemplateStore>,
    timer: Arc<dyn HostTimerFacility>,
    expense_service: Arc<dyn ExpenseService>,
    token_provider: Arc<dyn TokenProvider>,
    notifier: Arc<dyn Notifier>,
    config: SchedulingEngineConfig,
    recent_fires: DashMap<String, DateTime<Utc>>,
    template_locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, TemplateScheduleState>,
    initialized: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    fire_loop: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SchedulingEngine {
    pub fn new(
        manager: Arc<TemplateManager>,
        store: Arc<TemplateStore>,
        timer: Arc<dyn HostTimerFacility>,
        expense_service: Arc<dyn ExpenseService>,
        token_provider: Arc<dyn TokenProvider>,
        notifier: Arc<dyn Notifier>,
        config: SchedulingEngineConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            manager,
            store,
            timer,
            expense_service,
            token_provider,
            notifier,
            config,
            recent_fires: DashMap::new(),
            template_locks: DashMap::new(),
            states: DashMap::new(),
            initialized: AtomicBool::new(false),
            shutdown_tx,
            fire_loop: Mutex::new(None),
        })
    }

    /// Idempotent: ensures exactly one fire-handler loop is running, loads
    /// the queue, and (re)registers a timer for every actively-scheduled
    /// template. Queue entries already due are fired immediately as a
    /// single catch-up execution, subject to dedup.
    #[instrument(skip(self))]
    pub async fn initialize(self: &Arc<Self>) -> Result<(), ExecutionError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.timer.on_fire(tx);

        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(name) = rx.recv() => {
                        if let Some(id) = template_id_from_timer(&name) {
                            let engine = Arc::clone(&engine);
                            let id = id.to_string();
                            tokio::spawn(async move { engine.handle_fire(&id).await; });
                        } else {
                            warn!(timer = %name, "ignoring foreign timer");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    else => break,
                }
            }
        });
        *self.fire_loop.lock().await = Some(handle);

        let queue = self.store.load_queue_snapshot().await.map_err(ExecutionError::Storage)?;
        let now = Utc::now();
        for entry in queue {
            if entry.status != QueueEntryStatus::Pending {
                continue;
            }
            if entry.scheduled_for <= now {
                info!(template_id = %entry.template_id, "catch-up firing missed schedule slot");
                self.handle_fire(&entry.template_id).await;
            } else {
                self.timer.create(timer_name(&entry.template_id), entry.scheduled_for).await;
                self.states.insert(entry.template_id.clone(), TemplateScheduleState::Armed);
            }
        }

        Ok(())
    }

    /// Registers, updates, or cancels the timer for one template based on
    /// its current schedule.
    #[instrument(skip(self, template))]
    pub async fn bind(&self, template: &Template) {
        let name = timer_name(&template.id);
        match &template.scheduling {
            Some(schedule) if schedule.enabled && !schedule.paused => {
                if let Some(next) = schedule.next_execution {
                    self.timer.create(name, next).await;
                    self.states.insert(template.id.clone(), TemplateScheduleState::Armed);
                    return;
                }
                self.timer.clear(&name).await;
                self.states.insert(template.id.clone(), TemplateScheduleState::Unbound);
            }
            _ => {
                self.timer.clear(&name).await;
                self.states.insert(template.id.clone(), TemplateScheduleState::Unbound);
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn unbind(&self, template_id: &str) {
        self.timer.clear(&timer_name(template_id)).await;
        self.states.insert(template_id.to_string(), TemplateScheduleState::Unbound);
    }

    pub async fn get_scheduled(&self) -> Vec<String> {
        self.timer
            .get_all()
            .await
            .into_iter()
            .filter_map(|e| template_id_from_timer(&e.name).map(str::to_string))
            .collect()
    }

    /// Immediate teardown: clears all timers and the dedup map. Used on
    /// shutdown.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        for entry in self.timer.get_all().await {
            self.timer.clear(&entry.name).await;
        }
        self.recent_fires.clear();
        self.states.clear();
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Graceful wrapper around `cleanup`: signals the fire loop to stop and
    /// gives in-flight handlers a moment to finish first.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.fire_loop.lock().await.take() {
            let _ = tokio::time::timeout(StdDuration::from_secs(5), handle).await;
        }
        self.cleanup().await;
    }

    fn template_lock(&self, template_id: &str) -> Arc<Mutex<()>> {
        self.template_locks
            .entry(template_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn evict_stale_dedup_entries(&self, now: DateTime<Utc>) {
        self.recent_fires.retain(|_, last| now - *last < self.config.dedup_eviction);
    }

    #[instrument(skip(self))]
    async fn handle_fire(&self, template_id: &str) {
        let now = Utc::now();
        self.evict_stale_dedup_entries(now);

        // Check-and-set under the shard's write lock so two truly parallel
        // callbacks (each dispatched via tokio::spawn) can't both observe no
        // recent entry and both be admitted.
        let admitted = match self.recent_fires.entry(template_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) if now - *e.get() < self.config.dedup_window => false,
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                e.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        };
        if !admitted {
            info!(template_id, "duplicate fire suppressed by dedup window");
            return;
        }

        let lock = self.template_lock(template_id);
        let _guard = lock.lock().await;
        self.states.insert(template_id.to_string(), TemplateScheduleState::Firing);

        let template = match self.manager.get(template_id).await {
            Ok(t) => t,
            Err(_) => {
                info!(template_id, "template missing at fire time, dropping");
                return;
            }
        };

        let Some(schedule) = &template.scheduling else {
            info!(template_id, "template has no schedule at fire time, dropping");
            return;
        };
        if !schedule.enabled || schedule.paused {
            info!(template_id, "template disabled or paused at fire time, dropping");
            return;
        }

        self.execute_and_reschedule(&template).await;
    }

    async fn execute_and_reschedule(&self, template: &Template) {
        let started = std::time::Instant::now();
        let result = self.execute_once(template).await;
        let duration = started.elapsed();
        metrics::histogram!("template_execution_duration_seconds").record(duration.as_secs_f64());

        let (record, notification) = match result {
            Ok(expense_id) => {
                metrics::counter!("template_execution_success_total").increment(1);
                (
                    ExecutionRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        executed_at: Utc::now(),
                        status: ExecutionOutcome::Success,
                        expense_id: Some(expense_id),
                        error: None,
                        metadata: ExecutionRecordMetadata { execution_type: ExecutionType::Scheduled },
                    },
                    Notification {
                        title: "Expense created".to_string(),
                        body: format!("'{}' created an expense on schedule", template.name),
                        context: Some(serde_json::json!({ "template_id": template.id })),
                        priority: Priority::Normal,
                    },
                )
            }
            Err(err) => {
                metrics::counter!("template_execution_failed_total").increment(1);
                let sanitized = sanitize_error(&err);
                (
                    ExecutionRecord {
                        id: uuid::Uuid::new_v4().to_string(),
                        executed_at: Utc::now(),
                        status: ExecutionOutcome::Failed,
                        expense_id: None,
                        error: Some(sanitized.clone()),
                        metadata: ExecutionRecordMetadata { execution_type: ExecutionType::Scheduled },
                    },
                    Notification {
                        title: "Scheduled expense failed".to_string(),
                        body: format!("'{}' failed: {}", template.name, sanitized),
                        context: Some(serde_json::json!({ "template_id": template.id })),
                        priority: Priority::High,
                    },
                )
            }
        };

        if let Err(e) = self.manager.append_execution(&template.id, record).await {
            warn!(template_id = %template.id, error = %e, "failed to record execution outcome");
        }
        self.notifier.notify(notification).await;

        self.reschedule(&template.id).await;
    }

    async fn execute_once(&self, template: &Template) -> Result<String, ExecutionError> {
        let token = self
            .token_provider
            .get_token()
            .await
            .map_err(ExecutionError::Auth)?
            .ok_or(ExecutionError::Auth(crate::errors::AuthFailure::TokenUnavailable(
                "token provider returned none".to_string(),
            )))?;
        let _ = token; // carried by the concrete ExpenseService implementation's transport.

        let payload = build_payload(template);
        let retry = ExponentialBackoff::default_expense_service_policy();

        let mut attempt = 0;
        loop {
            match self.expense_service.create_expense(payload.clone()).await {
                Ok(receipt) => return Ok(receipt.id),
                Err(ExpenseServiceError::Auth(auth)) => return Err(ExecutionError::Auth(auth)),
                Err(err) if err.is_retryable() && retry.should_retry(attempt) => {
                    if let Some(delay) = retry.next_delay(attempt) {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                    continue;
                }
                Err(err) if err.is_retryable() => {
                    return Err(ExecutionError::ExhaustedRetries { attempts: attempt })
                }
                Err(err) => return Err(ExecutionError::ExpenseServiceRejected(err.to_string())),
            }
        }
    }

    async fn reschedule(&self, template_id: &str) {
        let template = match self.manager.get(template_id).await {
            Ok(t) => t,
            Err(_) => return,
        };
        let Some(schedule) = template.scheduling.clone() else {
            self.unbind(template_id).await;
            return;
        };

        match ScheduleCalculator::next(&schedule, Utc::now()) {
            Ok(next) => {
                let mut updated = schedule;
                updated.next_execution = next;
                match self.store.update_scheduling(template_id, Some(updated)).await {
                    Ok(t) => {
                        self.states.insert(template_id.to_string(), TemplateScheduleState::Armed);
                        self.bind(&t).await;
                    }
                    Err(e) => warn!(template_id, error = %e, "failed to persist reschedule"),
                }
            }
            Err(_) => {
                // End date reached or config now invalid: disable and unbind.
                let mut disabled = schedule;
                disabled.enabled = false;
                if self.store.update_scheduling(template_id, Some(disabled)).await.is_ok() {
                    self.states.insert(template_id.to_string(), TemplateScheduleState::DisabledTerminal);
                    self.unbind(template_id).await;
                }
            }
        }
    }
}

fn build_payload(template: &Template) -> ExpensePayload {
    let data = &template.expense_data;
    // Precedence matches the legacy policy shapes: an object id wins, then
    // an explicit policyType, then a bare policy string.
    let policy_type = if let Some(LegacyPolicy::Object { id }) = &data.policy {
        Some(id.clone())
    } else if let Some(policy_type) = &data.policy_type {
        Some(policy_type.clone())
    } else if let Some(LegacyPolicy::Name(name)) = &data.policy {
        Some(name.clone())
    } else {
        None
    };

    ExpensePayload {
        merchant_amount: data.merchant_amount,
        merchant_currency: data.merchant_currency.clone(),
        date: Utc::now().date_naive(),
        merchant_name: data.merchant.name.clone(),
        policy_type,
        category: data.details.as_ref().and_then(|d| d.category.clone()),
        description: data.details.as_ref().and_then(|d| d.description.clone()),
        reporting_data: data.reporting_data.clone(),
    }
}

fn sanitize_error(err: &ExecutionError) -> String {
    let api: crate::errors::ApiError = err.into();
    api.message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExpenseDetails, LegacyPolicy, Merchant};

    #[test]
    fn timer_name_round_trips_template_id() {
        let name = timer_name("tmpl_123_abc");
        assert_eq!(template_id_from_timer(&name), Some("tmpl_123_abc"));
    }

    #[test]
    fn foreign_timer_name_does_not_parse() {
        assert_eq!(template_id_from_timer("some_other_timer"), None);
    }

    fn base_expense_data() -> crate::models::ExpenseData {
        crate::models::ExpenseData {
            merchant: Merchant { name: "Acme".to_string() },
            merchant_amount: 10.0,
            merchant_currency: "USD".to_string(),
            policy_type: None,
            details: Some(ExpenseDetails { category: Some("travel".to_string()), description: None }),
            reporting_data: None,
            policy: None,
        }
    }

    fn base_template(data: crate::models::ExpenseData) -> Template {
        Template {
            id: "tmpl_1".to_string(),
            name: "Test".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            schema_version: 1,
            expense_data: data,
            scheduling: None,
            execution_history: Vec::new(),
            metadata: crate::models::TemplateMetadata::default(),
        }
    }

    #[test]
    fn build_payload_prefers_legacy_policy_object_id_over_everything() {
        let mut data = base_expense_data();
        data.policy_type = Some("from_policy_type".to_string());
        data.policy = Some(LegacyPolicy::Object { id: "from_object".to_string() });
        let payload = build_payload(&base_template(data));
        assert_eq!(payload.policy_type.as_deref(), Some("from_object"));
    }

    #[test]
    fn build_payload_prefers_policy_type_over_legacy_policy_string() {
        let mut data = base_expense_data();
        data.policy_type = Some("from_policy_type".to_string());
        data.policy = Some(LegacyPolicy::Name("from_string".to_string()));
        let payload = build_payload(&base_template(data));
        assert_eq!(payload.policy_type.as_deref(), Some("from_policy_type"));
    }

    #[test]
    fn build_payload_falls_back_to_legacy_policy_string() {
        let mut data = base_expense_data();
        data.policy = Some(LegacyPolicy::Name("from_string".to_string()));
        let payload = build_payload(&base_template(data));
        assert_eq!(payload.policy_type.as_deref(), Some("from_string"));
    }

    #[test]
    fn build_payload_is_none_when_no_policy_information_present() {
        let payload = build_payload(&base_template(base_expense_data()));
        assert_eq!(payload.policy_type, None);
    }
}
