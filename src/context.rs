//! Request-scoped dispatch context carried through the command-bus
//! middleware chain.
//!
//! A small typed extensions map (the same shape as `http::Extensions`) plus
//! first-class fields for the two metadata values every command dispatch
//! carries and a cancellation token threaded down to whatever store calls
//! the handler makes.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

/// Carries causation/correlation identifiers, a cancellation token, and a
/// small type-keyed bag of extensions (notably the event-store handle
/// injected by [`crate::bridge::EventStoreBridge`]) through a single command
/// dispatch.
pub struct DispatchContext {
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Cancellation token for this dispatch's store operations. Defaults to
    /// a fresh, never-cancelled token; callers that want a cancellable
    /// dispatch should set this before the command reaches the bus.
    pub cancellation: CancellationToken,
}

impl Default for DispatchContext {
    fn default() -> Self {
        DispatchContext {
            extensions: HashMap::new(),
            causation_id: None,
            correlation_id: None,
            cancellation: CancellationToken::new(),
        }
    }
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }
}
