//! Event bus: fan-out of events to every registered handler whose predicate
//! accepts the message. Handler errors are logged, never propagated.

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Envelope;

/// A predicate deciding whether a handler should receive a given event.
pub type Predicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Envelope) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn handle(&self, event: &Envelope) -> Result<(), anyhow::Error> {
        (self)(event.clone()).await
    }
}

struct Registration {
    matches: Predicate,
    handler: Arc<dyn EventHandler>,
}

/// Matches every event.
pub fn match_any() -> Predicate {
    Arc::new(|_| true)
}

/// Matches events by exact message name.
pub fn match_name(name: &'static str) -> Predicate {
    Arc::new(move |e| e.name() == name)
}

/// Multi-handler event bus. Registrations are kept in insertion order and
/// all matching handlers run, in order, for every dispatched event.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<std::sync::RwLock<Vec<Registration>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, matches: Predicate, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .expect("lock poisoned")
            .push(Registration { matches, handler });
    }

    /// Dispatches `event` to every matching handler. Never fails: handler
    /// errors are logged and discarded, since events are informational and
    /// fan-out must not abort the append that produced them.
    pub async fn dispatch(&self, event: &Envelope) {
        let registrations: Vec<Arc<dyn EventHandler>> = {
            let guard = self.handlers.read().expect("lock poisoned");
            guard
                .iter()
                .filter(|r| (r.matches)(event))
                .map(|r| r.handler.clone())
                .collect()
        };

        for handler in registrations {
            if let Err(_err) = handler.handle(event).await {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, message = %event, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Envelope) -> Result<(), anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn match_any_receives_every_event() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(match_any(), Arc::new(CountingHandler(count.clone())));

        let e1 = Envelope::new_event("a", Payload::Generic(HashMap::new()), 1);
        let e2 = Envelope::new_event("b", Payload::Generic(HashMap::new()), 1);
        bus.dispatch(&e1).await;
        bus.dispatch(&e2).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn match_name_filters_out_other_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(match_name("a"), Arc::new(CountingHandler(count.clone())));

        bus.dispatch(&Envelope::new_event("a", Payload::Generic(HashMap::new()), 1))
            .await;
        bus.dispatch(&Envelope::new_event("b", Payload::Generic(HashMap::new()), 1))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct FailingHandler;

    #[async_trait]
    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Envelope) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    #[tokio::test]
    async fn handler_errors_do_not_abort_dispatch() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(match_any(), Arc::new(FailingHandler));
        bus.register(match_any(), Arc::new(CountingHandler(count.clone())));

        bus.dispatch(&Envelope::new_event("a", Payload::Generic(HashMap::new()), 1))
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
