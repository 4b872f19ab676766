//! Command bus: exactly one handler per message name, behind an ordered
//! middleware chain.
//!
//! The middleware chain is built as a small recursive continuation, in the
//! style `tower`-based Rust services use: each middleware receives the
//! context, the message, and a `Next` continuation it may call, mutate
//! around, or short-circuit.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::context::DispatchContext;
use crate::error::CommandBusError;
use crate::message::Envelope;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The terminal handler for a single command name.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut DispatchContext, command: Envelope) -> Result<(), anyhow::Error>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), anyhow::Error>> + Send,
{
    async fn handle(&self, _ctx: &mut DispatchContext, command: Envelope) -> Result<(), anyhow::Error> {
        (self)(command).await
    }
}

/// Continuation handed to a [`Middleware`]; calling it runs the rest of the
/// chain (and eventually the registered handler).
pub type Next = Box<dyn FnOnce(DispatchContext, Envelope) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(
        &self,
        ctx: DispatchContext,
        command: Envelope,
        next: Next,
    ) -> Result<(), anyhow::Error>;
}

/// Single-handler-per-name command bus with an ordered middleware chain.
#[derive(Clone, Default)]
pub struct CommandBus {
    handlers: Arc<RwLock<HashMap<&'static str, Arc<dyn Handler>>>>,
    middleware: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as the handler for `name`. Fails if a handler is
    /// already registered for that name.
    pub fn register(
        &self,
        name: &'static str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), CommandBusError> {
        let mut handlers = self.handlers.write().expect("lock poisoned");
        if handlers.contains_key(name) {
            return Err(CommandBusError::HandlerAlreadyRegistered(name.to_string()));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    /// Appends `middleware` to the tail of the chain; index 0 runs first.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.write().expect("lock poisoned").push(middleware);
    }

    /// Runs the middleware chain and then the registered handler for
    /// `command`'s name.
    pub async fn dispatch(&self, command: Envelope) -> Result<(), CommandBusError> {
        let name = command.name();
        let id = command.id().to_string();

        let handler = self
            .handlers
            .read()
            .expect("lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| CommandBusError::NoHandlerFound(name.to_string()))?;

        let chain: Arc<[Arc<dyn Middleware>]> =
            self.middleware.read().expect("lock poisoned").clone().into();

        run_chain(chain, 0, DispatchContext::new(), command, handler)
            .await
            .map_err(|source| CommandBusError::DispatchFailed {
                message_id: id,
                message_name: name.to_string(),
                source,
            })
    }
}

fn run_chain(
    middleware: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    ctx: DispatchContext,
    command: Envelope,
    handler: Arc<dyn Handler>,
) -> BoxFuture<'static, Result<(), anyhow::Error>> {
    Box::pin(async move {
        if index >= middleware.len() {
            let mut ctx = ctx;
            return handler.handle(&mut ctx, command).await;
        }

        let current = middleware[index].clone();
        let next: Next = Box::new(move |ctx, command| {
            run_chain(middleware.clone(), index + 1, ctx, command, handler.clone())
        });
        current.handle(ctx, command, next).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn dispatch_fails_without_a_handler() {
        let bus = CommandBus::new();
        let cmd = Envelope::new_command("do-thing", Payload::Generic(StdHashMap::new()));
        let err = bus.dispatch(cmd).await;
        assert!(matches!(err, Err(CommandBusError::NoHandlerFound(_))));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = CommandBus::new();
        bus.register("do-thing", Arc::new(|_: Envelope| async { Ok(()) }))
            .unwrap();
        let err = bus.register("do-thing", Arc::new(|_: Envelope| async { Ok(()) }));
        assert!(matches!(err, Err(CommandBusError::HandlerAlreadyRegistered(_))));
    }

    struct RecordingMiddleware(Arc<std::sync::Mutex<Vec<&'static str>>>, &'static str);

    #[async_trait]
    impl Middleware for RecordingMiddleware {
        async fn handle(
            &self,
            ctx: DispatchContext,
            command: Envelope,
            next: Next,
        ) -> Result<(), anyhow::Error> {
            self.0.lock().unwrap().push(self.1);
            next(ctx, command).await
        }
    }

    #[tokio::test]
    async fn middleware_runs_in_registration_order_before_the_handler() {
        let bus = CommandBus::new();
        let trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        bus.use_middleware(Arc::new(RecordingMiddleware(trace.clone(), "first")));
        bus.use_middleware(Arc::new(RecordingMiddleware(trace.clone(), "second")));

        let trace_for_handler = trace.clone();
        bus.register(
            "do-thing",
            Arc::new(move |_: Envelope| {
                let trace = trace_for_handler.clone();
                async move {
                    trace.lock().unwrap().push("handler");
                    Ok(())
                }
            }),
        )
        .unwrap();

        bus.dispatch(Envelope::new_command("do-thing", Payload::Generic(StdHashMap::new())))
            .await
            .unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["first", "second", "handler"]);
    }

    #[tokio::test]
    async fn handler_failure_is_wrapped_in_dispatch_error() {
        let bus = CommandBus::new();
        bus.register(
            "do-thing",
            Arc::new(|_: Envelope| async { Err(anyhow::anyhow!("nope")) }),
        )
        .unwrap();

        let err = bus
            .dispatch(Envelope::new_command("do-thing", Payload::Generic(StdHashMap::new())))
            .await;
        assert!(matches!(err, Err(CommandBusError::DispatchFailed { .. })));
    }
}
