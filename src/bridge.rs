//! Event-store bridge: command-bus middleware that injects an event-store
//! handle and causation/correlation identifiers into the dispatch context.
//!
//! Idempotent across nested dispatches: if the context already carries a
//! handle, this middleware leaves it untouched rather than overwriting it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Middleware, Next};
use crate::context::DispatchContext;
use crate::error::MissingEventStoreInContext;
use crate::message::Envelope;
use crate::store::EventStore;

/// Middleware that makes an [`EventStore`] reachable from any handler or
/// nested middleware further down the chain.
pub struct EventStoreBridge {
    store: Arc<dyn EventStore>,
}

impl EventStoreBridge {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        EventStoreBridge { store }
    }
}

#[async_trait]
impl Middleware for EventStoreBridge {
    async fn handle(
        &self,
        mut ctx: DispatchContext,
        command: Envelope,
        next: Next,
    ) -> Result<(), anyhow::Error> {
        if !ctx.contains::<Arc<dyn EventStore>>() {
            ctx.insert(self.store.clone());
        }
        if ctx.causation_id.is_none() {
            ctx.causation_id = Some(command.id().to_string());
        }
        if ctx.correlation_id.is_none() {
            ctx.correlation_id = Some(command.id().to_string());
        }
        next(ctx, command).await
    }
}

/// Looks up the event store injected by [`EventStoreBridge`].
pub fn event_store_from(ctx: &DispatchContext) -> Result<Arc<dyn EventStore>, MissingEventStoreInContext> {
    ctx.get::<Arc<dyn EventStore>>()
        .cloned()
        .ok_or(MissingEventStoreInContext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandBus;
    use crate::memory::InMemoryStore;
    use crate::message::Payload;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[tokio::test]
    async fn bridge_injects_store_and_ids_once() {
        let bus = CommandBus::new();
        let store: Arc<dyn EventStore> = Arc::new(InMemoryStore::new());
        bus.use_middleware(Arc::new(EventStoreBridge::new(store)));

        let seen_ids: Arc<Mutex<Vec<(Option<String>, Option<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let seen_ids_for_handler = seen_ids.clone();

        struct Probe(Arc<Mutex<Vec<(Option<String>, Option<String>)>>>);

        #[async_trait]
        impl crate::command::Handler for Probe {
            async fn handle(
                &self,
                ctx: &mut DispatchContext,
                _command: Envelope,
            ) -> Result<(), anyhow::Error> {
                assert!(event_store_from(ctx).is_ok());
                self.0
                    .lock()
                    .unwrap()
                    .push((ctx.causation_id.clone(), ctx.correlation_id.clone()));
                Ok(())
            }
        }

        bus.register("do-thing", Arc::new(Probe(seen_ids_for_handler)))
            .unwrap();

        let cmd = Envelope::new_command("do-thing", Payload::Generic(HashMap::new()));
        let expected_id = cmd.id().to_string();
        bus.dispatch(cmd).await.unwrap();

        let recorded = seen_ids.lock().unwrap();
        assert_eq!(recorded[0].0, Some(expected_id.clone()));
        assert_eq!(recorded[0].1, Some(expected_id));
    }
}
