//! In-process event bus.
//!
//! Settlement emits domain events after state transitions. Handlers run on
//! spawned tasks so a slow or failing consumer never blocks the transition
//! that produced the event.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::domain::{AppError, Event, EventHandler, EventPublisher};

/// Fans events out to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: Event) {
        if self.handlers.is_empty() {
            warn!(topic = event.topic(), "No event handlers registered, dropping event");
            return;
        }

        for handler in &self.handlers {
            let handler = Arc::clone(handler);
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&event).await {
                    error!(
                        error = %e,
                        handler = handler.name(),
                        topic = event.topic(),
                        "Event handler failed"
                    );
                }
            });
        }
    }
}

/// Writes every event to the application log
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event: &Event) -> Result<(), AppError> {
        let payload = serde_json::to_string(event).unwrap_or_default();
        info!(topic = event.topic(), payload = %payload, "Domain event");
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) -> Result<(), AppError> {
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new()
            .with_handler(Arc::new(RecordingHandler { seen: seen.clone() }))
            .with_handler(Arc::new(LoggingEventHandler));

        bus.publish(Event::WithdrawalCreated {
            payment_id: 4,
            transaction_id: 11,
        });

        // Handlers run on spawned tasks, give them a beat to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), "withdrawal.created");
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(Event::PaymentStatusChanged {
            payment_id: 1,
            merchant_id: 2,
            status: "succeeded".to_string(),
        });
    }
}
