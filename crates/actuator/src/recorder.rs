//! Event recorder: the append-only log is the source of truth, the
//! broadcast sink is best-effort fan-out for observers. Publishing never
//! awaits a subscriber and never fails the caller.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use rudder_core::{EngineEvent, ResourceEvent};
use rudder_persist::EventLog;

const SINK_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventRecorder {
    log: Arc<dyn EventLog>,
    sink: broadcast::Sender<EngineEvent>,
}

impl EventRecorder {
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        let (sink, _) = broadcast::channel(SINK_CAPACITY);
        Self { log, sink }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sink.subscribe()
    }

    /// Appends to history, then publishes. A failed append is logged and
    /// the event still published; observers may see events the log missed,
    /// never the other way around silently.
    pub async fn record(&self, event: ResourceEvent) {
        if let Err(e) = self.log.append(event.clone()).await {
            warn!(resource = %event.id, kind = event.data.name(), error = %e, "failed to append event");
        }
        let _ = self.sink.send(EngineEvent::Resource(event));
    }

    /// Fire-and-forget publish for events that are not resource history.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sink.send(event);
    }
}
