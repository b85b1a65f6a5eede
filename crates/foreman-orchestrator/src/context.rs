use crate::config::ForemanConfig;
use crate::monitor::RunMetrics;
use foreman_bus::MessageBus;
use foreman_core::ForemanResult;
use foreman_session::{new_run_id, EventLog, RunEvent, RunStore};
use std::sync::Arc;

/// Everything one run shares, created once and handed to each component.
#[derive(Clone)]
pub struct RunContext {
    /// Run identifier.
    pub run_id: String,
    /// Configuration of the run.
    pub config: Arc<ForemanConfig>,
    /// Message bus between coordinator, executors and reviewer.
    pub bus: MessageBus,
    /// Counters sampled by the stopping evaluator.
    pub metrics: Arc<RunMetrics>,
    /// Snapshot and report storage, absent for in-memory runs.
    pub store: Option<Arc<RunStore>>,
    /// Event log, absent for in-memory runs.
    pub events: Option<EventLog>,
}

impl RunContext {
    /// A context that keeps everything in memory.
    pub fn new(config: ForemanConfig) -> Self {
        let metrics = RunMetrics::new(config.limits.token_limit, config.limits.context_limit);
        Self {
            run_id: new_run_id(),
            config: Arc::new(config),
            bus: MessageBus::new(),
            metrics: Arc::new(metrics),
            store: None,
            events: None,
        }
    }

    /// A context persisting state under `config.data_dir`: snapshots and
    /// the report through a [`RunStore`], bus traffic and transitions
    /// through an [`EventLog`].
    pub async fn persistent(config: ForemanConfig) -> ForemanResult<Self> {
        let mut ctx = Self::new(config);
        let store = RunStore::new(&ctx.config.data_dir).await?;
        let events = EventLog::open(store.run_dir(&ctx.run_id)?, ctx.run_id.clone()).await?;
        ctx.bus.set_sink(Arc::new(events.clone()));
        ctx.store = Some(Arc::new(store));
        ctx.events = Some(events);
        tracing::info!(run_id = %ctx.run_id, data_dir = %ctx.config.data_dir.display(), "Run state persisted");
        Ok(ctx)
    }

    /// Append an event when an event log is configured.
    pub fn log(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            events.log(event);
        }
    }
}
