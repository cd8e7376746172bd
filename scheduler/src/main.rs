// Scheduler binary entry point: wires the persistence layer, the in-process
// timer facility, and the scheduling engine together, then runs until a
// shutdown signal arrives. Owns no business logic of its own.

use async_trait::async_trait;
use common::config::Settings;
use common::db::kv::KvBackend;
use common::db::pool::DbPool;
use common::errors::AuthFailure;
use common::expense_service::{ExpensePayload, ExpenseReceipt, ExpenseService, ExpenseServiceError, TokenProvider};
use common::manager::TemplateManager;
use common::notifier::LoggingNotifier;
use common::scheduler::{InProcessTimerFacility, SchedulingEngine, SchedulingEngineConfig};
use common::store::TemplateStore;
use std::sync::Arc;
use tracing::info;

/// The expense-creation service and its token provider are external
/// collaborators outside this crate's scope; this stand-in reports every
/// call as unavailable until a real transport is wired in by the host
/// application that embeds this engine.
struct UnconfiguredExpenseService;

#[async_trait]
impl ExpenseService for UnconfiguredExpenseService {
    async fn create_expense(&self, _payload: ExpensePayload) -> Result<ExpenseReceipt, ExpenseServiceError> {
        Err(ExpenseServiceError::Network(
            "no ExpenseService transport configured for this deployment".to_string(),
        ))
    }
}

struct UnconfiguredTokenProvider;

#[async_trait]
impl TokenProvider for UnconfiguredTokenProvider {
    async fn get_token(&self) -> Result<Option<String>, AuthFailure> {
        Err(AuthFailure::TokenUnavailable(
            "no TokenProvider configured for this deployment".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::load().unwrap_or_default();
    common::telemetry::init_logging(&settings.observability.log_level, settings.observability.tracing_endpoint.as_deref())?;

    info!("starting template scheduling engine");
    settings.validate().map_err(|e| anyhow::anyhow!(e))?;

    if let Err(e) = common::telemetry::init_metrics(settings.observability.metrics_port) {
        tracing::warn!(error = %e, "failed to start metrics exporter, continuing without it");
    }

    let db_pool = DbPool::new(&settings.database).await?;
    db_pool.health_check().await?;
    info!("database pool ready");

    let kv = KvBackend::new(db_pool.pool().clone());
    let store = Arc::new(TemplateStore::new(kv, settings.limits.max_history));
    let manager = Arc::new(TemplateManager::new(Arc::clone(&store), settings.limits.max_templates));

    let timer = InProcessTimerFacility::new();
    let expense_service = Arc::new(UnconfiguredExpenseService) as Arc<dyn ExpenseService>;
    let token_provider = Arc::new(UnconfiguredTokenProvider) as Arc<dyn TokenProvider>;
    let notifier = Arc::new(LoggingNotifier) as Arc<dyn common::notifier::Notifier>;

    let engine_config = SchedulingEngineConfig {
        dedup_window: chrono::Duration::seconds(settings.scheduling.dedup_window_seconds),
        dedup_eviction: chrono::Duration::seconds(settings.scheduling.dedup_eviction_seconds),
    };

    let engine = SchedulingEngine::new(
        manager,
        store,
        timer,
        expense_service,
        token_provider,
        notifier,
        engine_config,
    );

    engine.initialize().await?;
    info!("scheduling engine initialized");

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, stopping scheduling engine");
    engine.stop().await;

    info!("scheduler stopped");
    Ok(())
}
