//! IDE-facing debug events.
//!
//! Events are broadcast so the IDE callback adapter and any tooling can
//! subscribe independently.

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ProgramCreated,
    ThreadCreated { thread_id: u32 },
    ThreadDestroyed { thread_id: u32 },
    BreakpointBound { remote_id: i32, gdb_id: u32 },
    BreakpointHit { gdb_id: u32, thread_id: Option<u32>, hit_count: u32 },
    BreakComplete { thread_id: Option<u32> },
    StepComplete { thread_id: Option<u32> },
    Exception { thread_id: Option<u32>, description: String },
    ExpressionEvaluated { expression: String, value: String },
    ProgramDestroyed { exit_code: Option<i32> },
}

impl EngineEvent {
    /// Events that present a stopped target to the IDE.
    pub const fn is_stop(&self) -> bool {
        matches!(
            self,
            Self::BreakpointHit { .. }
                | Self::BreakComplete { .. }
                | Self::StepComplete { .. }
                | Self::Exception { .. }
        )
    }
}

#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        log::debug!("event: {:?}", event);
        // No subscribers is not an error: the IDE may not have attached a callback yet.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_broadcast() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();
        sink.emit(EngineEvent::ThreadCreated { thread_id: 1 });
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::ThreadCreated { thread_id: 1 });
    }

    #[test]
    fn test_emit_without_subscribers() {
        let sink = EventSink::new(8);
        sink.emit(EngineEvent::ProgramCreated);
    }

    #[test]
    fn test_stop_classification() {
        assert!(EngineEvent::StepComplete { thread_id: None }.is_stop());
        assert!(!EngineEvent::ThreadDestroyed { thread_id: 2 }.is_stop());
    }
}
