//! Aggregate engine: reconstitute state from a stream, route a command to
//! the user's state handler, record the resulting events, and commit them
//! atomically.
//!
//! A pure `apply(state, event) -> state` keeps deterministic state
//! transition separate from the (possibly side-effecting) `handle(id,
//! state, command) -> events` that validates and records; on commit the
//! offset of the first uncommitted event is `current_version -
//! events_to_commit.len()`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::Handler as CommandHandler;
use crate::context::DispatchContext;
use crate::error::{metadata_keys, AggregateError, StoreError};
use crate::event::PersistedEvent;
use crate::iterator::EventIterator;
use crate::matcher::Matcher;
use crate::message::{Envelope, Payload};
use crate::store::EventStore;

/// A deterministic state machine driven by events, plus the (possibly
/// fallible) domain logic that decides which events a command produces.
#[async_trait]
pub trait Aggregate: Default + Send + Sync {
    type Command: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Mutates `self` to reflect `event` having happened. Must be
    /// deterministic and side-effect-free: it runs identically during
    /// reconstitution and during live command handling.
    fn apply(&mut self, event: &Envelope) -> Result<(), Self::Error>;

    /// Validates `command` against the current state and returns the
    /// events it produces, as `(event_name, payload)` pairs, in the order
    /// they should be recorded. An empty list is a valid "no-op" outcome.
    async fn handle(&self, command: &Self::Command) -> Result<Vec<(&'static str, Payload)>, Self::Error>;
}

/// A live aggregate instance: its id, reconstituted state, current version,
/// and any events staged but not yet committed.
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    stream_name: String,
    version: u64,
    state: A,
    pending: Vec<Envelope>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Reconstitutes an aggregate by replaying every event in `stream_name`
    /// whose `aggregate_id` metadata equals `id`. Fails with
    /// `CorruptedHistory` if versions are not contiguous starting at 1.
    pub async fn load(
        token: &CancellationToken,
        id: impl Into<String>,
        store: &dyn EventStore,
        stream_name: impl Into<String>,
    ) -> Result<Self, AggregateError> {
        let id = id.into();
        let stream_name = stream_name.into();
        let matcher = Matcher::new().with_eq(metadata_keys::AGGREGATE_ID, id.clone());

        let mut iterator = match store.load(token, &stream_name, 0, 0, matcher).await {
            Ok(it) => it,
            Err(StoreError::StreamDoesNotExist(_)) => {
                return Ok(AggregateRoot {
                    id,
                    stream_name,
                    version: 0,
                    state: A::default(),
                    pending: Vec::new(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = A::default();
        let mut version = 0u64;

        loop {
            let persisted: PersistedEvent = match iterator.next(token).await {
                Ok(e) => e,
                Err(crate::error::IteratorError::EndOfStream) => break,
                Err(e) => return Err(e.into()),
            };
            let found_version = persisted.aggregate_version().unwrap_or(0);
            if found_version != version + 1 {
                return Err(AggregateError::CorruptedHistory {
                    expected: version + 1,
                    found: found_version,
                });
            }
            state
                .apply(&persisted.envelope)
                .map_err(|e| AggregateError::State(e.into()))?;
            version = found_version;
        }
        iterator.close().await;

        Ok(AggregateRoot {
            id,
            stream_name,
            version,
            state,
            pending: Vec::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    /// Runs `command` against the current state, staging and immediately
    /// applying every event it produces so later logic in the same
    /// dispatch observes post-event state.
    pub async fn handle(&mut self, command: &A::Command) -> Result<(), AggregateError> {
        let produced = self
            .state
            .handle(command)
            .await
            .map_err(|e| AggregateError::State(e.into()))?;

        for (name, payload) in produced {
            self.version += 1;
            let event = Envelope::new_event(name, payload, self.version)
                .with_metadata(metadata_keys::AGGREGATE_ID, self.id.clone())
                .with_metadata(metadata_keys::AGGREGATE_VERSION, self.version.to_string());
            self.state
                .apply(&event)
                .map_err(|e| AggregateError::State(e.into()))?;
            self.pending.push(event);
        }
        Ok(())
    }

    /// Commits staged events as a single atomic append. The pending buffer
    /// is cleared whether or not the append succeeds: on failure the
    /// in-memory state is no longer authoritative and the caller must
    /// reload before retrying (see `DESIGN.md`, resolved open question #4).
    pub async fn close(
        &mut self,
        token: &CancellationToken,
        store: &dyn EventStore,
    ) -> Result<(), AggregateError> {
        let events = std::mem::take(&mut self.pending);
        if events.is_empty() {
            return Ok(());
        }
        store.append_to(token, &self.stream_name, events).await?;
        Ok(())
    }
}

/// Resolves an aggregate id out of a command's payload. Required for
/// [`make_handler`] to route a command to the right aggregate instance.
pub fn aggregate_id_of(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Generic(map) => map.get(metadata_keys::AGGREGATE_ID).cloned(),
        Payload::Structured(value) => value
            .get(metadata_keys::AGGREGATE_ID)
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

/// Builds a command-bus [`CommandHandler`] that loads the aggregate named
/// by the incoming command's `aggregate_id` field from `stream_name`, runs
/// the command, and commits the result, using the event store found in the
/// dispatch context (see [`crate::bridge`]).
pub fn make_handler<A>(
    stream_name: &'static str,
    decode: impl Fn(&Envelope) -> Result<A::Command, anyhow::Error> + Send + Sync + 'static,
) -> Arc<dyn CommandHandler>
where
    A: Aggregate + 'static,
{
    Arc::new(AggregateCommandHandler::<A> {
        stream_name,
        decode: Box::new(decode),
    })
}

struct AggregateCommandHandler<A: Aggregate> {
    stream_name: &'static str,
    decode: Box<dyn Fn(&Envelope) -> Result<A::Command, anyhow::Error> + Send + Sync>,
}

#[async_trait]
impl<A: Aggregate + 'static> CommandHandler for AggregateCommandHandler<A> {
    async fn handle(&self, ctx: &mut DispatchContext, command: Envelope) -> Result<(), anyhow::Error> {
        let store = crate::bridge::event_store_from(ctx)?;
        let aggregate_id =
            aggregate_id_of(command.data()).ok_or(AggregateError::InvalidCommandPayload)?;
        let token = ctx.cancellation.clone();

        let mut root =
            AggregateRoot::<A>::load(&token, aggregate_id, store.as_ref(), self.stream_name).await?;
        let decoded = (self.decode)(&command)?;
        root.handle(&decoded).await?;
        root.close(&token, store.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use std::collections::HashMap;
    use thiserror::Error;

    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    enum CounterCommand {
        Increment(i64),
    }

    #[derive(Debug, Error)]
    enum CounterError {
        #[error("value would go negative")]
        WouldGoNegative,
    }

    #[async_trait]
    impl Aggregate for Counter {
        type Command = CounterCommand;
        type Error = CounterError;

        fn apply(&mut self, event: &Envelope) -> Result<(), Self::Error> {
            if event.name() == "incremented" {
                if let Payload::Generic(map) = event.data() {
                    let by: i64 = map.get("by").and_then(|v| v.parse().ok()).unwrap_or(0);
                    self.value += by;
                }
            }
            Ok(())
        }

        async fn handle(
            &self,
            command: &Self::Command,
        ) -> Result<Vec<(&'static str, Payload)>, Self::Error> {
            match command {
                CounterCommand::Increment(by) => {
                    if self.value + by < 0 {
                        return Err(CounterError::WouldGoNegative);
                    }
                    let mut map = HashMap::new();
                    map.insert("by".to_string(), by.to_string());
                    Ok(vec![("incremented", Payload::Generic(map))])
                }
            }
        }
    }

    #[tokio::test]
    async fn round_trip_through_load_handle_close_load() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store
            .create(&tok, "counters", Default::default(), vec![])
            .await
            .unwrap();

        let mut root = AggregateRoot::<Counter>::load(&tok, "c1", &store, "counters")
            .await
            .unwrap();
        root.handle(&CounterCommand::Increment(3)).await.unwrap();
        root.handle(&CounterCommand::Increment(4)).await.unwrap();
        root.close(&tok, &store).await.unwrap();
        assert_eq!(root.version(), 2);

        let reloaded = AggregateRoot::<Counter>::load(&tok, "c1", &store, "counters")
            .await
            .unwrap();
        assert_eq!(reloaded.state().value, 7);
        assert_eq!(reloaded.version(), 2);
    }

    #[tokio::test]
    async fn concurrent_close_reports_version_conflict_to_the_loser() {
        let tok = CancellationToken::new();
        let store = InMemoryStore::new();
        store
            .create(&tok, "counters", Default::default(), vec![])
            .await
            .unwrap();

        let mut a = AggregateRoot::<Counter>::load(&tok, "c1", &store, "counters")
            .await
            .unwrap();
        let mut b = AggregateRoot::<Counter>::load(&tok, "c1", &store, "counters")
            .await
            .unwrap();
        a.handle(&CounterCommand::Increment(1)).await.unwrap();
        b.handle(&CounterCommand::Increment(2)).await.unwrap();

        a.close(&tok, &store).await.unwrap();
        let result = b.close(&tok, &store).await;
        assert!(matches!(result, Err(AggregateError::Store(StoreError::VersionConflict { .. }))));
    }
}
