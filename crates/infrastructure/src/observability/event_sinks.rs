use std::sync::Arc;

use orchestrator_domain::{EventEnvelope, EventSink, LifecycleEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 将生命周期事件写入结构化日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: LifecycleEvent) {
        let event_type = event.event_type();
        let aggregate_id = event.aggregate_id();
        match &event {
            LifecycleEvent::TaskFailed { .. }
            | LifecycleEvent::WorkerRestartExhausted { .. }
            | LifecycleEvent::LedgerRolledBack { .. }
            | LifecycleEvent::LateResultDiscarded { .. } => {
                warn!(event_type, aggregate_id = %aggregate_id, ?event, "生命周期事件");
            }
            LifecycleEvent::BreakerTransition { .. }
            | LifecycleEvent::WorkerHealthChanged { .. }
            | LifecycleEvent::WorkerRegistered { .. }
            | LifecycleEvent::WorkerRestarted { .. } => {
                info!(event_type, aggregate_id = %aggregate_id, ?event, "生命周期事件");
            }
            _ => {
                debug!(event_type, aggregate_id = %aggregate_id, ?event, "生命周期事件");
            }
        }
    }
}

/// 通过无界通道转发事件，接收端关闭后事件被丢弃
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: LifecycleEvent) {
        if self.sender.send(EventEnvelope::new(event)).is_err() {
            debug!("事件接收端已关闭，丢弃事件");
        }
    }
}

/// 依次转发给多个下游
#[derive(Default, Clone)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for CompositeEventSink {
    fn publish(&self, event: LifecycleEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(event.clone());
            }
            last.publish(event);
        }
    }
}
