//! Run and stage lifecycle events.
//!
//! The executor reports progress through an [`EventSink`]. Events carry the
//! stage id and remote id so a sink can reconstruct what a run did without
//! reading the execution log.

mod event;
mod sink;

pub use event::PipelineEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
