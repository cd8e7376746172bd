// Host timer facility contract plus an in-process implementation.
//
// The production host (wherever this engine is embedded) may offer a timer
// facility that persists across process restarts; this crate assumes it
// does not, which is why `SchedulingEngine::initialize` treats the
// persisted queue, not live timer registrations, as the source of truth
// for catch-up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub name: String,
    pub when: DateTime<Utc>,
}

#[async_trait]
pub trait HostTimerFacility: Send + Sync {
    async fn create(&self, name: String, when: DateTime<Utc>);
    async fn clear(&self, name: &str);
    async fn get_all(&self) -> Vec<TimerEntry>;
    /// Registers the single process-wide fire handler. Calling this more
    /// than once replaces the previous handler.
    fn on_fire(&self, sender: mpsc::UnboundedSender<String>);
}

/// Timer facility backed by one `tokio::time::sleep` task per registration.
/// Timers are soft state: nothing here survives a process restart, which is
/// why the engine treats them as rebuildable from the persisted queue.
pub struct InProcessTimerFacility {
    timers: DashMap<String, (DateTime<Utc>, JoinHandle<()>)>,
    handler: std::sync::RwLock<Option<mpsc::UnboundedSender<String>>>,
}

impl InProcessTimerFacility {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            timers: DashMap::new(),
            handler: std::sync::RwLock::new(None),
        })
    }
}

impl Default for InProcessTimerFacility {
    fn default() -> Self {
        Self {
            timers: DashMap::new(),
            handler: std::sync::RwLock::new(None),
        }
    }
}

#[async_trait]
impl HostTimerFacility for InProcessTimerFacility {
    #[instrument(skip(self))]
    async fn create(&self, name: String, when: DateTime<Utc>) {
        self.clear(&name).await;

        let delay = (when - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        let fire_name = name.clone();
        let handler = self.handler.read().expect("lock not poisoned").clone();

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = handler {
                if sender.send(fire_name.clone()).is_err() {
                    warn!(timer = %fire_name, "fire handler channel closed, dropping timer event");
                }
            }
        });

        self.timers.insert(name, (when, join));
    }

    async fn clear(&self, name: &str) {
        if let Some((_, (_, handle))) = self.timers.remove(name) {
            handle.abort();
        }
    }

    async fn get_all(&self) -> Vec<TimerEntry> {
        self.timers
            .iter()
            .map(|e| TimerEntry { name: e.key().clone(), when: e.value().0 })
            .collect()
    }

    fn on_fire(&self, sender: mpsc::UnboundedSender<String>) {
        *self.handler.write().expect("lock not poisoned") = Some(sender);
    }
}

impl Drop for InProcessTimerFacility {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().1.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_clear_round_trip_through_get_all() {
        let facility = InProcessTimerFacility::new();
        let when = Utc::now() + chrono::Duration::seconds(60);
        facility.create("template_schedule_tmpl_1".to_string(), when).await;
        assert_eq!(facility.get_all().await.len(), 1);

        facility.clear("template_schedule_tmpl_1").await;
        assert!(facility.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn recreating_a_timer_replaces_the_previous_registration() {
        let facility = InProcessTimerFacility::new();
        let first = Utc::now() + chrono::Duration::seconds(60);
        let second = Utc::now() + chrono::Duration::seconds(120);

        facility.create("template_schedule_tmpl_1".to_string(), first).await;
        facility.create("template_schedule_tmpl_1".to_string(), second).await;

        let all = facility.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].when, second);
    }

    #[tokio::test]
    async fn fires_through_the_registered_handler_after_the_delay() {
        let facility = InProcessTimerFacility::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        facility.on_fire(tx);

        facility.create("template_schedule_tmpl_1".to_string(), Utc::now()).await;

        let fired = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timer should fire within the timeout");
        assert_eq!(fired, Some("template_schedule_tmpl_1".to_string()));
    }
}
