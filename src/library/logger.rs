//! Bridge from the native log callback into the host.
//!
//! The callback may run on any thread, including threads owned by the library,
//! and must never block. Errors and panics are captured synchronously so a
//! request issued right after a panic observes it; everything else goes
//! through a bounded queue drained by a single task, which keeps events in the
//! order the library emitted them.

use super::LogCallback;
use crate::events::{
    classify_line, keep_first_error, trace_event, EngineEvent, EngineEventLevel, EventPublisher,
    LogLine, RustError, SpanExporter,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct LogBridge {
    engine_id: String,
    last_error: Mutex<Option<RustError>>,
    queue: mpsc::Sender<LogLine>,
    dropped: AtomicU64,
}

impl LogBridge {
    /// Create a bridge and the receiving end of its queue
    pub fn new(engine_id: impl Into<String>, capacity: usize) -> (Arc<Self>, mpsc::Receiver<LogLine>) {
        let (queue, receiver) = mpsc::channel(capacity.max(1));
        let bridge = Arc::new(Self {
            engine_id: engine_id.into(),
            last_error: Mutex::new(None),
            queue,
            dropped: AtomicU64::new(0),
        });
        (bridge, receiver)
    }

    /// Callback handed to the native library
    pub fn callback(self: &Arc<Self>) -> LogCallback {
        let bridge = self.clone();
        Arc::new(move |line: String| bridge.handle_line(&line))
    }

    pub fn handle_line(&self, line: &str) {
        let classified = classify_line(line);
        match &classified {
            LogLine::RustError(error) => self.capture(error.clone()),
            LogLine::Log(log) if log.is_error_log() => self.capture(log.to_error()),
            LogLine::Ready | LogLine::Noise => return,
            _ => {}
        }

        if self.queue.try_send(classified).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(engine_id = %self.engine_id, dropped = dropped, "engine log queue full, dropping lines");
            }
        }
    }

    pub fn capture(&self, error: RustError) {
        keep_first_error(&mut self.last_error.lock(), error);
    }

    /// Take whatever error was captured
    pub fn take_error(&self) -> Option<RustError> {
        self.last_error.lock().take()
    }

    /// Take the captured error only if it is a panic
    pub fn take_panic(&self) -> Option<RustError> {
        let mut slot = self.last_error.lock();
        if slot.as_ref().is_some_and(|e| e.is_panic) {
            slot.take()
        } else {
            None
        }
    }

    pub fn clear(&self) {
        self.last_error.lock().take();
    }

    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain the queue until every sender is gone
pub fn spawn_consumer(
    handle: &tokio::runtime::Handle,
    engine_id: String,
    mut receiver: mpsc::Receiver<LogLine>,
    events: EventPublisher,
    span_exporter: Arc<Mutex<Arc<dyn SpanExporter>>>,
    tracing_enabled: bool,
) -> JoinHandle<()> {
    handle.spawn(async move {
        while let Some(line) = receiver.recv().await {
            let event = match line {
                LogLine::RustError(error) => {
                    Some(EngineEvent::new(EngineEventLevel::Error, error.message, "query_engine"))
                }
                LogLine::Log(log) => Some(log.to_event()),
                LogLine::Spans(spans) => {
                    if tracing_enabled {
                        let exporter = span_exporter.lock().clone();
                        exporter.export(spans);
                    }
                    None
                }
                LogLine::Raw(text) => {
                    debug!(engine_id = %engine_id, line = %text, "engine output");
                    None
                }
                LogLine::Ready | LogLine::Noise => None,
            };

            if let Some(event) = event {
                trace_event(&engine_id, &event);
                events.publish(event);
            }
        }
        debug!(engine_id = %engine_id, "engine log queue closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TracingSpanExporter;

    #[test]
    fn test_panic_is_captured_synchronously() {
        let (bridge, _rx) = LogBridge::new("lib-1", 8);
        let callback = bridge.callback();
        callback(r#"{"level":"ERROR","target":"qe","fields":{"message":"PANIC","reason":"boom","file":"a.rs","line":1,"column":2}}"#.to_string());

        let panic = bridge.take_panic().unwrap();
        assert!(panic.is_panic);
        assert_eq!(panic.message, "PANIC: boom in a.rs:1:2");
        assert!(bridge.take_error().is_none());
    }

    #[test]
    fn test_take_panic_leaves_plain_errors() {
        let (bridge, _rx) = LogBridge::new("lib-1", 8);
        bridge.handle_line(r#"{"level":"ERROR","target":"qe","fields":{"message":"connection lost"}}"#);
        assert!(bridge.take_panic().is_none());
        assert_eq!(bridge.take_error().unwrap().message, "connection lost");
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (bridge, _rx) = LogBridge::new("lib-1", 2);
        for _ in 0..5 {
            bridge.handle_line("plain text");
        }
        assert_eq!(bridge.dropped_lines(), 3);
    }

    #[tokio::test]
    async fn test_consumer_publishes_in_order() {
        let (bridge, rx) = LogBridge::new("lib-1", 16);
        let events = EventPublisher::new(16);
        let mut subscriber = events.subscribe();
        let exporter: Arc<Mutex<Arc<dyn SpanExporter>>> =
            Arc::new(Mutex::new(Arc::new(TracingSpanExporter)));
        let consumer = spawn_consumer(
            &tokio::runtime::Handle::current(),
            "lib-1".to_string(),
            rx,
            events,
            exporter,
            false,
        );

        bridge.handle_line(r#"{"level":"INFO","target":"qe","fields":{"message":"first"}}"#);
        bridge.handle_line(r#"{"level":"WARN","target":"qe","fields":{"message":"second"}}"#);
        drop(bridge);
        consumer.await.unwrap();

        let first = subscriber.recv().await.unwrap();
        let second = subscriber.recv().await.unwrap();
        assert_eq!(first.message, "first");
        assert_eq!(second.message, "second");
        assert_eq!(second.level, EngineEventLevel::Warn);
    }
}
