//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::Level;

use super::PipelineEvent;

/// Receives lifecycle events from the executor.
///
/// Sinks must not fail; anything that goes wrong inside a sink is its own
/// business and never affects the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    async fn emit(&self, event: &PipelineEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {}
}

/// A sink that logs events through `tracing`.
///
/// Failures are logged at `warn` regardless of the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        let name = event.name();
        let stage_id = event.stage_id().map(ToString::to_string);
        let data = event.to_data();

        match event {
            PipelineEvent::StageFailed { .. } | PipelineEvent::StageUpstreamFailed { .. } => {
                tracing::warn!(event_type = name, stage_id = ?stage_id, event_data = %data, "Event: {}", name);
            }
            _ if self.level == Level::DEBUG => {
                tracing::debug!(event_type = name, stage_id = ?stage_id, event_data = %data, "Event: {}", name);
            }
            _ => {
                tracing::info!(event_type = name, stage_id = ?stage_id, event_data = %data, "Event: {}", name);
            }
        }
    }
}

/// A sink that keeps every event, for tests and post-run inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Event names in emission order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.read().iter().map(PipelineEvent::name).collect()
    }

    /// Events whose name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name().starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}
