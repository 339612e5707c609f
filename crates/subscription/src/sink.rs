//! Consumer seam for parsed stream events.

use common::stream::StreamEvent;

/// Receives every parsed update routed by the registry.
pub trait EventSink: Send + Sync + 'static {
    fn ingest(&self, event: StreamEvent);
}

impl<F> EventSink for F
where
    F: Fn(StreamEvent) + Send + Sync + 'static,
{
    fn ingest(&self, event: StreamEvent) {
        self(event)
    }
}
