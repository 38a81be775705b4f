use std::collections::HashMap;
use std::sync::Mutex;

use vantage_proto::UpMessage;

/// Which part of an [`UpMessage`] a handler is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The message carries a tracking (head pose) update.
    Tracking,
    /// The message carries a frame-timing report.
    FrameTiming,
}

type Handler = Box<dyn Fn(&UpMessage) + Send>;

/// Typed callback table for telemetry arriving on the data channels.
///
/// Components register handlers keyed by event kind; decoded up messages are
/// fanned out to every handler whose kind the message carries. Handlers run
/// on the data-channel callback thread and must not block.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<Handler>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&UpMessage) + Send + 'static,
    {
        self.handlers
            .lock()
            .expect("dispatcher poisoned")
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
    }

    /// Route a decoded message to the interested handlers.
    pub fn dispatch(&self, msg: &UpMessage) {
        let handlers = self.handlers.lock().expect("dispatcher poisoned");
        if msg.tracking.is_some() {
            if let Some(list) = handlers.get(&EventKind::Tracking) {
                for handler in list {
                    handler(msg);
                }
            }
        }
        if msg.frame.is_some() {
            if let Some(list) = handlers.get(&EventKind::FrameTiming) {
                for handler in list {
                    handler(msg);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vantage_proto::{TrackingMessage, UpFrameMessage};

    #[test]
    fn dispatch_routes_by_payload() {
        let dispatcher = EventDispatcher::new();
        let tracking_hits = Arc::new(AtomicUsize::new(0));
        let frame_hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&tracking_hits);
        dispatcher.register(EventKind::Tracking, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = Arc::clone(&frame_hits);
        dispatcher.register(EventKind::FrameTiming, move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        let tracking_only = UpMessage {
            up_message_id: 1,
            tracking: Some(TrackingMessage::default()),
            frame: None,
        };
        let both = UpMessage {
            up_message_id: 2,
            tracking: Some(TrackingMessage::default()),
            frame: Some(UpFrameMessage::default()),
        };
        dispatcher.dispatch(&tracking_only);
        dispatcher.dispatch(&both);

        assert_eq!(tracking_hits.load(Ordering::Relaxed), 2);
        assert_eq!(frame_hits.load(Ordering::Relaxed), 1);
    }
}
