//! In-memory [`EventStore`] backend: a single process-wide map from stream
//! name to ordered events, guarded by one `RwLock`.
//!
//! `create` holds the write guard for the whole check-then-insert so two
//! concurrent creates of the same name can't both observe "absent". Each
//! iterator snapshots an `Arc<Vec<Envelope>>` at construction, so an
//! in-flight read never sees events appended after it started.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{metadata_keys, IteratorError, StoreError};
use crate::event::PersistedEvent;
use crate::iterator::{EventIterator, IteratorState};
use crate::matcher::Matcher;
use crate::message::{Envelope, Metadata};
use crate::store::EventStore;

struct StreamData {
    metadata: Metadata,
    events: Vec<Envelope>,
    created_order: u64,
    /// Last `aggregate_version` seen per `aggregate_id`, kept up to date on
    /// every append so a version-conflict check only needs this map rather
    /// than a full rescan (or clone) of `events`.
    aggregate_versions: HashMap<String, u64>,
}

#[derive(Default)]
struct Backend {
    streams: HashMap<String, StreamData>,
    next_order: u64,
}

impl Backend {
    /// Checks `incoming` against the last-known version per aggregate id in
    /// `existing`, and returns the batch's own per-aggregate-id version
    /// updates for the caller to merge in on success.
    fn check_version_conflicts(
        existing: &HashMap<String, u64>,
        incoming: &[Envelope],
    ) -> Result<HashMap<String, u64>, StoreError> {
        let mut batch: HashMap<String, u64> = HashMap::new();
        for e in incoming {
            if let (Some(id), Some(v)) = (e.aggregate_id(), aggregate_version(e)) {
                let last = batch.get(id).copied().or_else(|| existing.get(id).copied());
                if let Some(last) = last {
                    if v <= last {
                        return Err(StoreError::VersionConflict {
                            aggregate_id: id.to_string(),
                            expected: last + 1,
                            actual: v,
                        });
                    }
                }
                batch.insert(id.to_string(), v);
            }
        }
        Ok(batch)
    }
}

fn aggregate_version(e: &Envelope) -> Option<u64> {
    e.metadata()
        .get(metadata_keys::AGGREGATE_VERSION)
        .and_then(|v| v.parse().ok())
}

/// In-memory event store. Cheap to construct; typically one instance is
/// shared (behind an `Arc`) across a process.
#[derive(Clone)]
pub struct InMemoryStore {
    backend: Arc<RwLock<Backend>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            backend: Arc::new(RwLock::new(Backend::default())),
        }
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn create(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
        initial_events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut backend = self.backend.write().expect("lock poisoned");
        if backend.streams.contains_key(stream_name) {
            return Err(StoreError::StreamAlreadyExists(stream_name.to_string()));
        }
        let aggregate_versions = Backend::check_version_conflicts(&HashMap::new(), &initial_events)?;
        let order = backend.next_order;
        backend.next_order += 1;
        backend.streams.insert(
            stream_name.to_string(),
            StreamData {
                metadata,
                events: initial_events,
                created_order: order,
                aggregate_versions,
            },
        );
        Ok(())
    }

    async fn append_to(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        events: Vec<Envelope>,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut backend = self.backend.write().expect("lock poisoned");
        let stream = backend
            .streams
            .get(stream_name)
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        let updates = Backend::check_version_conflicts(&stream.aggregate_versions, &events)?;
        let stream = backend.streams.get_mut(stream_name).expect("checked above");
        stream.events.extend(events);
        stream.aggregate_versions.extend(updates);
        Ok(())
    }

    async fn delete(&self, token: &CancellationToken, stream_name: &str) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut backend = self.backend.write().expect("lock poisoned");
        backend.streams.remove(stream_name);
        Ok(())
    }

    async fn load(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let snapshot = self.snapshot(stream_name)?;
        Ok(Box::new(InMemoryIterator::forward(
            stream_name.to_string(),
            snapshot,
            from,
            count,
            matcher,
        )))
    }

    async fn load_reverse(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Result<Box<dyn EventIterator>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let snapshot = self.snapshot(stream_name)?;
        Ok(Box::new(InMemoryIterator::reverse(
            stream_name.to_string(),
            snapshot,
            from,
            count,
            matcher,
        )))
    }

    async fn fetch_stream_names(
        &self,
        token: &CancellationToken,
        substring: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let backend = self.backend.read().expect("lock poisoned");
        Ok(Self::filter_names(&backend, limit, offset, |name, data| {
            name.contains(substring) && matcher.matches(&data.metadata)
        }))
    }

    async fn fetch_stream_names_regex(
        &self,
        token: &CancellationToken,
        pattern: &str,
        matcher: Matcher,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<String>, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let re = regex::Regex::new(pattern).map_err(|e| StoreError::Internal(e.into()))?;
        let backend = self.backend.read().expect("lock poisoned");
        Ok(Self::filter_names(&backend, limit, offset, |name, data| {
            re.is_match(name) && matcher.matches(&data.metadata)
        }))
    }

    async fn fetch_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
    ) -> Result<Metadata, StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let backend = self.backend.read().expect("lock poisoned");
        backend
            .streams
            .get(stream_name)
            .map(|d| d.metadata.clone())
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))
    }

    async fn update_stream_metadata(
        &self,
        token: &CancellationToken,
        stream_name: &str,
        metadata: Metadata,
    ) -> Result<(), StoreError> {
        if token.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let mut backend = self.backend.write().expect("lock poisoned");
        let data = backend
            .streams
            .get_mut(stream_name)
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))?;
        data.metadata = metadata;
        Ok(())
    }
}

impl InMemoryStore {
    fn snapshot(&self, stream_name: &str) -> Result<Arc<Vec<Envelope>>, StoreError> {
        let backend = self.backend.read().expect("lock poisoned");
        backend
            .streams
            .get(stream_name)
            .map(|d| Arc::new(d.events.clone()))
            .ok_or_else(|| StoreError::StreamDoesNotExist(stream_name.to_string()))
    }

    fn filter_names(
        backend: &Backend,
        limit: u64,
        offset: u64,
        pred: impl Fn(&str, &StreamData) -> bool,
    ) -> Vec<String> {
        let mut names: Vec<(&str, &StreamData)> = backend
            .streams
            .iter()
            .map(|(n, d)| (n.as_str(), d))
            .filter(|(n, d)| pred(n, d))
            .collect();
        names.sort_by_key(|(_, d)| d.created_order);
        names
            .into_iter()
            .map(|(n, _)| n.to_string())
            .skip(offset as usize)
            .take(if limit == 0 {
                usize::MAX
            } else {
                limit as usize
            })
            .collect()
    }
}

enum Direction {
    Forward,
    Reverse,
}

/// Cursor over a snapshot taken at construction time; later appends to the
/// same stream are invisible to an already-open iterator.
struct InMemoryIterator {
    stream_name: String,
    snapshot: Arc<Vec<Envelope>>,
    matcher: Matcher,
    direction: Direction,
    from: u64,
    count: u64,
    // mutable cursor state, reset by rewind()
    position: i64,
    skip_remaining: u64,
    yielded: u64,
    state: IteratorState,
}

impl InMemoryIterator {
    fn forward(
        stream_name: String,
        snapshot: Arc<Vec<Envelope>>,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Self {
        InMemoryIterator {
            stream_name,
            snapshot,
            matcher,
            direction: Direction::Forward,
            from,
            count,
            position: from as i64,
            skip_remaining: 0,
            yielded: 0,
            state: IteratorState::Fresh,
        }
    }

    fn reverse(
        stream_name: String,
        snapshot: Arc<Vec<Envelope>>,
        from: u64,
        count: u64,
        matcher: Matcher,
    ) -> Self {
        let start = snapshot.len() as i64 - 1;
        InMemoryIterator {
            stream_name,
            snapshot,
            matcher,
            direction: Direction::Reverse,
            from,
            count,
            position: start,
            skip_remaining: from,
            yielded: 0,
            state: IteratorState::Fresh,
        }
    }

    fn has_capacity(&self) -> bool {
        self.count == 0 || self.yielded < self.count
    }
}

#[async_trait]
impl EventIterator for InMemoryIterator {
    async fn next(&mut self, token: &CancellationToken) -> Result<PersistedEvent, IteratorError> {
        if self.state == IteratorState::Closed {
            return Err(IteratorError::Closed);
        }
        if token.is_cancelled() {
            return Err(IteratorError::Cancelled);
        }
        self.state = IteratorState::Advancing;

        loop {
            if token.is_cancelled() {
                return Err(IteratorError::Cancelled);
            }
            if !self.has_capacity() {
                self.state = IteratorState::AtEnd;
                return Err(IteratorError::EndOfStream);
            }

            let idx = match self.direction {
                Direction::Forward => {
                    if self.position < 0 || self.position as usize >= self.snapshot.len() {
                        self.state = IteratorState::AtEnd;
                        return Err(IteratorError::EndOfStream);
                    }
                    let idx = self.position as usize;
                    self.position += 1;
                    idx
                }
                Direction::Reverse => {
                    if self.position < 0 {
                        self.state = IteratorState::AtEnd;
                        return Err(IteratorError::EndOfStream);
                    }
                    let idx = self.position as usize;
                    self.position -= 1;
                    idx
                }
            };

            let envelope = &self.snapshot[idx];
            if !self.matcher.matches(envelope.metadata()) {
                continue;
            }

            if matches!(self.direction, Direction::Reverse) && self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }

            self.yielded += 1;
            return Ok(PersistedEvent::new(
                self.stream_name.clone(),
                idx as u64,
                envelope.clone(),
            ));
        }
    }

    async fn rewind(&mut self, token: &CancellationToken) -> Result<(), IteratorError> {
        if token.is_cancelled() {
            return Err(IteratorError::Cancelled);
        }
        self.position = match self.direction {
            Direction::Forward => self.from as i64,
            Direction::Reverse => self.snapshot.len() as i64 - 1,
        };
        self.skip_remaining = match self.direction {
            Direction::Forward => 0,
            Direction::Reverse => self.from,
        };
        self.yielded = 0;
        self.state = IteratorState::Fresh;
        Ok(())
    }

    async fn close(&mut self) {
        self.state = IteratorState::Closed;
    }

    fn state(&self) -> IteratorState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::collections::HashMap as StdHashMap;

    fn event(agg: &str, version: u64) -> Envelope {
        Envelope::new_event(
            "thing-happened",
            Payload::Generic(StdHashMap::new()),
            version,
        )
        .with_metadata(metadata_keys::AGGREGATE_ID, agg)
        .with_metadata(metadata_keys::AGGREGATE_VERSION, version.to_string())
    }

    #[tokio::test]
    async fn append_order_is_preserved() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store
            .create(&tok, "users", Metadata::new(), vec![event("A", 1)])
            .await
            .unwrap();
        store
            .append_to(&tok, "users", vec![event("A", 2), event("A", 3)])
            .await
            .unwrap();

        let mut it = store.load(&tok, "users", 0, 0, Matcher::new()).await.unwrap();
        let mut versions = Vec::new();
        loop {
            match it.next(&tok).await {
                Ok(e) => versions.push(e.aggregate_version().unwrap()),
                Err(IteratorError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn version_conflict_is_detected() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store
            .create(&tok, "users", Metadata::new(), vec![event("A", 1)])
            .await
            .unwrap();
        let err = store.append_to(&tok, "users", vec![event("A", 1)]).await;
        assert!(matches!(err, Err(StoreError::VersionConflict { .. })));
    }

    #[tokio::test]
    async fn matcher_filters_by_aggregate_id() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store
            .create(&tok, "users",
                Metadata::new(),
                vec![event("A", 1), event("B", 1), event("A", 2), event("B", 2)],
            )
            .await
            .unwrap();

        let matcher = Matcher::new().with_eq(metadata_keys::AGGREGATE_ID, "A");
        let mut it = store.load(&tok, "users", 0, 0, matcher).await.unwrap();
        let mut seen = Vec::new();
        while let Ok(e) = it.next(&tok).await {
            seen.push(e.aggregate_version().unwrap());
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn reverse_window_skips_from_tail() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        let events: Vec<Envelope> = (1..=8).map(|v| event("A", v)).collect();
        store.create(&tok, "users", Metadata::new(), events).await.unwrap();

        let mut it = store
            .load_reverse(&tok, "users", 2, 5, Matcher::new())
            .await
            .unwrap();
        let mut seen = Vec::new();
        loop {
            match it.next(&tok).await {
                Ok(e) => seen.push(e.aggregate_version().unwrap()),
                Err(IteratorError::EndOfStream) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(seen, vec![6, 5, 4, 3, 2]);
    }

    #[tokio::test]
    async fn create_fails_when_stream_already_exists() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store.create(&tok, "users", Metadata::new(), vec![]).await.unwrap();
        let err = store.create(&tok, "users", Metadata::new(), vec![]).await;
        assert!(matches!(err, Err(StoreError::StreamAlreadyExists(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store.create(&tok, "users", Metadata::new(), vec![]).await.unwrap();
        store.delete(&tok, "users").await.unwrap();
        store.delete(&tok, "users").await.unwrap();
    }
}
