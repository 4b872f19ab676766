//! Publishing store wrapper: forwards reads verbatim, and on a successful
//! append fans the newly durable events out to an [`EventBus`] before
//! returning to the caller.
//!
//! Dispatch happens only after a successful append, never on failure, so
//! subscribers only ever see events that actually happened.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::event_bus::EventBus;
use crate::iterator::EventIterator;
use crate::matcher::Matcher;
use crate::message::{Envelope, Metadata};
use crate::store::EventStore;

/// Decorates an [`EventStore`] with synchronous, post-commit event-bus
/// fan-out.
pub struct PublishingEventStore<S> {
    inner: S,
    bus: EventBus,
}

impl<S: EventStore> PublishingEventStore<S> {
    pub fn new(inner: S, bus: EventBus) -> Self {
        PublishingEventStore { inner, bus }
    }

    async fn publish_all(&self, events: &[Envelope]) {
        for event in events {
            self.bus.dispatch(event).await;
        }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for PublishingEventStore<S> {
    async fn create(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
        initial_events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        self.inner
            .create(token, stream_name, metadata, initial_events.clone())
            .await?;
        self.publish_all(&initial_events).await;
        Ok(())
    }

    async fn append_to(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        self.inner.append_to(token, stream_name, events.clone()).await?;
        self.publish_all(&events).await;
        Ok(())
    }

    async fn delete(&self, token: &CancellationToken, stream_name: &str) -> Result<(), StoreError> {
        self.inner.delete(token, stream_name).await
    }

    async fn load(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        self.inner.load(token, stream_name, from, count, matcher).await
    }

    async fn load_reverse(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        self.inner
            .load_reverse(token, stream_name, from, count, matcher)
            .await
    }

    async fn fetch_stream_names(
        &self,
        token: &CancellationToken,
        substring: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        self.inner
            .fetch_stream_names(token, substring, matcher, limit, offset)
            .await
    }

    async fn fetch_stream_names_regex(
        &self,
        token: &CancellationToken,
        pattern: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        self.inner
            .fetch_stream_names_regex(token, pattern, matcher, limit, offset)
            .await
    }

    async fn fetch_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
    ) -> Result<Metadata, StoreError> {
        self.inner.fetch_stream_metadata(token, stream_name).await
    }

    async fn update_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError> {
        self.inner
            .update_stream_metadata(token, stream_name, metadata)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{match_any, EventHandler};
    use crate::memory::InMemoryStore;
    use crate::message::Payload;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Envelope) -> Result<(), anyhow::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_append_publishes_every_event_in_order() {
        let tok = CancellationToken::new();
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(match_any(), Arc::new(CountingHandler(count.clone())));

        let store = PublishingEventStore::new(InMemoryStore::new(), bus);
        store
            .create(
                &tok,
                "users",
                Metadata::new(),
                vec![
                    Envelope::new_event("a", Payload::Generic(HashMap::new()), 1),
                    Envelope::new_event("b", Payload::Generic(HashMap::new()), 2),
                ],
            )
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_append_never_publishes() {
        let tok = CancellationToken::new();
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(match_any(), Arc::new(CountingHandler(count.clone())));

        let store = PublishingEventStore::new(InMemoryStore::new(), bus);
        let err = store
            .append_to(
                &tok,
                "missing",
                vec![Envelope::new_event("a", Payload::Generic(HashMap::new()), 1)],
            )
            .await;

        assert!(err.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
