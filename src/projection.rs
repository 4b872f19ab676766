//! Projection manager & projector: a named, resumable, at-least-once
//! event-to-handler loop with persisted per-stream positions and status.
//!
//! A projection is built with `from_stream`/`when`/`when_any`, binding event
//! names (or a catch-all) to handlers. Running it polls its source stream
//! from the last persisted position, delivers each event to every matching
//! handler, and only then advances the position — so a crash between
//! delivery and persistence re-delivers on restart rather than losing work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProjectionError;
use crate::event::PersistedEvent;
use crate::matcher::Matcher;
use crate::store::EventStore;

/// Default interval the projector sleeps for after draining a stream.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle status of a [`ProjectionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    Idle,
    Running,
    Stopping,
    Deleting,
    Resetting,
}

/// Persisted projection bookkeeping: status plus one position per source
/// stream. The public surface binds exactly one stream today, but the
/// record itself stays map-shaped for forward compatibility with a future
/// multi-stream projector.
#[derive(Debug, Clone)]
pub struct ProjectionRecord {
    pub name: String,
    pub status: ProjectionStatus,
    pub positions: HashMap<String, u64>,
}

impl ProjectionRecord {
    fn idle(name: impl Into<String>) -> Self {
        ProjectionRecord {
            name: name.into(),
            status: ProjectionStatus::Idle,
            positions: HashMap::new(),
        }
    }
}

/// Persistence for [`ProjectionRecord`]s. The manager and projector both
/// drive a store through this trait; [`InMemoryProjectionStore`] is the
/// backend that ships with this crate, and the relational crate provides
/// one backed by a `projections` table.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Returns the existing record for `name`, inserting an idle one if
    /// absent.
    async fn ensure(&self, name: &str) -> Result<ProjectionRecord, ProjectionError>;

    async fn fetch(&self, name: &str) -> Result<Option<ProjectionRecord>, ProjectionError>;

    async fn set_status(&self, name: &str, status: ProjectionStatus) -> Result<(), ProjectionError>;

    async fn set_position(
        &self,
        name: &str,
        stream_name: &str,
        position: u64,
    ) -> Result<(), ProjectionError>;

    /// Resets every position to zero without changing status.
    async fn reset(&self, name: &str) -> Result<(), ProjectionError>;

    /// Removes the record entirely. Idempotent.
    async fn delete(&self, name: &str) -> Result<(), ProjectionError>;

    async fn fetch_names(&self, limit: u64, offset: u64) -> Result<Vec<String>, ProjectionError>;
}

/// In-memory [`ProjectionStore`], following the same `Arc<RwLock<HashMap>>`
/// discipline as [`crate::memory::InMemoryStore`].
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    records: Arc<std::sync::RwLock<HashMap<String, (u64, ProjectionRecord)>>>,
    next_order: Arc<std::sync::atomic::AtomicU64>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn ensure(&self, name: &str) -> Result<ProjectionRecord, ProjectionError> {
        let mut records = self.records.write().expect("lock poisoned");
        if let Some((_, record)) = records.get(name) {
            return Ok(record.clone());
        }
        let order = self
            .next_order
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let record = ProjectionRecord::idle(name);
        records.insert(name.to_string(), (order, record.clone()));
        Ok(record)
    }

    async fn fetch(&self, name: &str) -> Result<Option<ProjectionRecord>, ProjectionError> {
        Ok(self
            .records
            .read()
            .expect("lock poisoned")
            .get(name)
            .map(|(_, r)| r.clone()))
    }

    async fn set_status(&self, name: &str, status: ProjectionStatus) -> Result<(), ProjectionError> {
        let mut records = self.records.write().expect("lock poisoned");
        let (_, record) = records
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        record.status = status;
        Ok(())
    }

    async fn set_position(
        &self,
        name: &str,
        stream_name: &str,
        position: u64,
    ) -> Result<(), ProjectionError> {
        let mut records = self.records.write().expect("lock poisoned");
        let (_, record) = records
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        record.positions.insert(stream_name.to_string(), position);
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<(), ProjectionError> {
        let mut records = self.records.write().expect("lock poisoned");
        let (_, record) = records
            .get_mut(name)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
        for position in record.positions.values_mut() {
            *position = 0;
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProjectionError> {
        self.records.write().expect("lock poisoned").remove(name);
        Ok(())
    }

    async fn fetch_names(&self, limit: u64, offset: u64) -> Result<Vec<String>, ProjectionError> {
        let records = self.records.read().expect("lock poisoned");
        let mut ordered: Vec<(&u64, &str)> = records
            .values()
            .map(|(order, record)| (order, record.name.as_str()))
            .collect();
        ordered.sort_by_key(|(order, _)| **order);
        Ok(ordered
            .into_iter()
            .map(|(_, name)| name.to_string())
            .skip(offset as usize)
            .take(if limit == 0 { usize::MAX } else { limit as usize })
            .collect())
    }
}

/// Receives events delivered by a [`Projector`]'s run loop.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    async fn handle(&self, event: &PersistedEvent) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<F, Fut> ProjectionHandler for F
where
    F: Fn(PersistedEvent) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn handle(&self, event: &PersistedEvent) -> Result<(), anyhow::Error> {
        (self)(event.clone()).await
    }
}

/// Builds a [`Projector`] bound to exactly one source stream, with routes
/// registered by event name plus a catch-all list.
pub struct ProjectionBuilder {
    name: String,
    stream_name: String,
    by_name: HashMap<&'static str, Vec<Arc<dyn ProjectionHandler>>>,
    universal: Vec<Arc<dyn ProjectionHandler>>,
}

impl ProjectionBuilder {
    /// Starts building a projection named `name`, reading from `stream_name`.
    pub fn from_stream(name: impl Into<String>, stream_name: impl Into<String>) -> Self {
        ProjectionBuilder {
            name: name.into(),
            stream_name: stream_name.into(),
            by_name: HashMap::new(),
            universal: Vec::new(),
        }
    }

    /// Registers `handler` for events named `event_name`.
    #[must_use]
    pub fn when(mut self, event_name: &'static str, handler: Arc<dyn ProjectionHandler>) -> Self {
        self.by_name.entry(event_name).or_default().push(handler);
        self
    }

    /// Registers `handler` to receive every event, regardless of name, in
    /// addition to any name-specific handlers.
    #[must_use]
    pub fn when_any(mut self, handler: Arc<dyn ProjectionHandler>) -> Self {
        self.universal.push(handler);
        self
    }

    pub fn build(self) -> Projector {
        Projector {
            name: self.name,
            stream_name: self.stream_name,
            by_name: self.by_name,
            universal: self.universal,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A named, resumable consumer of one event stream. Events are delivered in
/// stream order; the persisted position advances only after every matching
/// handler has returned successfully, giving at-least-once delivery across
/// restarts.
pub struct Projector {
    name: String,
    stream_name: String,
    by_name: HashMap<&'static str, Vec<Arc<dyn ProjectionHandler>>>,
    universal: Vec<Arc<dyn ProjectionHandler>>,
    poll_interval: Duration,
}

impl Projector {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Overrides the poll interval used when the stream is caught up
    /// (default [`DEFAULT_POLL_INTERVAL`]).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs the projection loop until `cancel` fires, the projection's
    /// status becomes `stopping` or `deleting`, or a handler returns an
    /// unrecoverable error. On a handler error the position is *not*
    /// advanced, so the same event is redelivered on the next `run`.
    pub async fn run(
        &self,
        store: Arc<dyn EventStore>,
        projections: Arc<dyn ProjectionStore>,
        cancel: CancellationToken,
    ) -> Result<(), ProjectionError> {
        let existing = projections.ensure(&self.name).await?;
        if existing.status != ProjectionStatus::Stopping && existing.status != ProjectionStatus::Deleting {
            projections
                .set_status(&self.name, ProjectionStatus::Running)
                .await?;
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let record = projections
                .fetch(&self.name)
                .await?
                .ok_or_else(|| ProjectionError::NotFound(self.name.clone()))?;
            if record.status == ProjectionStatus::Stopping || record.status == ProjectionStatus::Deleting {
                return Ok(());
            }

            let position = *record.positions.get(&self.stream_name).unwrap_or(&0);
            let mut iterator = match store
                .load(&cancel, &self.stream_name, position, 0, Matcher::new())
                .await
            {
                Ok(it) => it,
                Err(e) => return Err(e.into()),
            };

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        iterator.close().await;
                        return Ok(());
                    }
                    next = iterator.next(&cancel) => next,
                };

                let persisted = match next {
                    Ok(e) => e,
                    Err(crate::error::IteratorError::EndOfStream) => {
                        iterator.close().await;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };

                for handler in &self.universal {
                    handler
                        .handle(&persisted)
                        .await
                        .map_err(ProjectionError::Handler)?;
                }
                if let Some(handlers) = self.by_name.get(persisted.envelope.name()) {
                    for handler in handlers {
                        handler
                            .handle(&persisted)
                            .await
                            .map_err(ProjectionError::Handler)?;
                    }
                }

                projections
                    .set_position(&self.name, &self.stream_name, persisted.sequence_number + 1)
                    .await?;

                let record = projections
                    .fetch(&self.name)
                    .await?
                    .ok_or_else(|| ProjectionError::NotFound(self.name.clone()))?;
                if record.status == ProjectionStatus::Stopping || record.status == ProjectionStatus::Deleting {
                    iterator.close().await;
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Administrative operations over a [`ProjectionStore`], independent of any
/// running [`Projector`] loop.
#[derive(Clone)]
pub struct ProjectionManager {
    store: Arc<dyn ProjectionStore>,
}

impl ProjectionManager {
    pub fn new(store: Arc<dyn ProjectionStore>) -> Self {
        ProjectionManager { store }
    }

    pub async fn create(&self, name: &str) -> Result<ProjectionRecord, ProjectionError> {
        self.store.ensure(name).await
    }

    /// Marks `name` as deleting so a running [`Projector`] loop observes the
    /// status and exits cleanly, then removes the record.
    pub async fn delete(&self, name: &str) -> Result<(), ProjectionError> {
        match self.store.set_status(name, ProjectionStatus::Deleting).await {
            Ok(()) | Err(ProjectionError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.delete(name).await
    }

    /// Resets every persisted position for `name` to zero. A projector
    /// whose loop observes this will re-deliver its stream from the start.
    pub async fn reset(&self, name: &str) -> Result<(), ProjectionError> {
        self.store.set_status(name, ProjectionStatus::Resetting).await?;
        self.store.reset(name).await?;
        self.store.set_status(name, ProjectionStatus::Idle).await
    }

    /// Requests that the named projection's loop exit at its next
    /// observation point.
    pub async fn stop(&self, name: &str) -> Result<(), ProjectionError> {
        self.store.set_status(name, ProjectionStatus::Stopping).await
    }

    pub async fn fetch_names(&self, limit: u64, offset: u64) -> Result<Vec<String>, ProjectionError> {
        self.store.fetch_names(limit, offset).await
    }

    pub async fn fetch_status(&self, name: &str) -> Result<ProjectionStatus, ProjectionError> {
        self.store
            .fetch(name)
            .await?
            .map(|r| r.status)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    pub async fn fetch_positions(&self, name: &str) -> Result<HashMap<String, u64>, ProjectionError> {
        self.store
            .fetch(name)
            .await?
            .map(|r| r.positions)
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::message::{Envelope, Metadata, Payload};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(name: &'static str, version: u64) -> Envelope {
        Envelope::new_event(name, Payload::Generic(StdHashMap::new()), version)
    }

    struct RecordingHandler(Arc<Mutex<Vec<u64>>>);

    #[async_trait]
    impl ProjectionHandler for RecordingHandler {
        async fn handle(&self, event: &PersistedEvent) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(event.sequence_number);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order_and_advances_position() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryStore::new());
        let tok = CancellationToken::new();
        store
            .create(
                &tok,
                "orders",
                Metadata::new(),
                vec![event("placed", 1), event("placed", 2), event("shipped", 1)],
            )
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let projector = ProjectionBuilder::from_stream("read-model", "orders")
            .when_any(Arc::new(RecordingHandler(seen.clone())))
            .build();

        let projections: Arc<dyn ProjectionStore> = Arc::new(InMemoryProjectionStore::new());
        let cancel = CancellationToken::new();
        let run_store = store.clone();
        let run_projections = projections.clone();
        let handle = tokio::spawn(async move { projector.run(run_store, run_projections, cancel).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        let positions = projections.fetch_positions("read-model").await.unwrap();
        assert_eq!(positions.get("orders"), Some(&3));
    }

    #[tokio::test]
    async fn stop_is_observed_between_events() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryStore::new());
        let tok = CancellationToken::new();
        store
            .create(&tok, "orders", Metadata::new(), vec![event("placed", 1)])
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counting = count.clone();
        let projector = ProjectionBuilder::from_stream("counter", "orders")
            .when_any(Arc::new(move |_: PersistedEvent| {
                let counting = counting.clone();
                async move {
                    counting.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .build();

        let projections: Arc<dyn ProjectionStore> = Arc::new(InMemoryProjectionStore::new());
        projections.ensure("counter").await.unwrap();
        projections
            .set_status("counter", ProjectionStatus::Stopping)
            .await
            .unwrap();

        let result = projector.run(store, projections, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deleting_status_is_observed_between_events() {
        let store: Arc<dyn EventStore> = Arc::new(InMemoryStore::new());
        let tok = CancellationToken::new();
        store
            .create(&tok, "orders", Metadata::new(), vec![event("placed", 1)])
            .await
            .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let counting = count.clone();
        let projector = ProjectionBuilder::from_stream("counter", "orders")
            .when_any(Arc::new(move |_: PersistedEvent| {
                let counting = counting.clone();
                async move {
                    counting.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .build();

        let projections: Arc<dyn ProjectionStore> = Arc::new(InMemoryProjectionStore::new());
        projections.ensure("counter").await.unwrap();
        projections
            .set_status("counter", ProjectionStatus::Deleting)
            .await
            .unwrap();

        let result = projector.run(store, projections, CancellationToken::new()).await;
        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn manager_delete_marks_deleting_before_removing_the_record() {
        let projections = Arc::new(InMemoryProjectionStore::new());
        projections.ensure("p").await.unwrap();

        let manager = ProjectionManager::new(projections.clone());
        manager.delete("p").await.unwrap();

        assert!(projections.fetch("p").await.unwrap().is_none());
        // Deleting an already-absent projection is idempotent.
        manager.delete("p").await.unwrap();
    }

    #[tokio::test]
    async fn manager_reset_zeroes_positions() {
        let projections = InMemoryProjectionStore::new();
        projections.ensure("p").await.unwrap();
        projections.set_position("p", "orders", 5).await.unwrap();

        let manager = ProjectionManager::new(Arc::new(projections));
        manager.reset("p").await.unwrap();

        let positions = manager.fetch_positions("p").await.unwrap();
        assert_eq!(positions.get("orders"), Some(&0));
    }
}
